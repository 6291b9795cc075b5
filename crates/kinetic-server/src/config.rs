//! Server configuration.
//!
//! Values resolve in layers: built-in defaults, then an optional TOML file,
//! then `KINETIC_*` environment variables and CLI flags (applied in
//! `main`). Size limits accept human-readable strings like "64M".

use std::path::{Path, PathBuf};
use std::time::Duration;

use kinetic_core::pipeline::{DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DEFAULT_RETAIN_CEILING_MS};
use kinetic_core::queue::{DEFAULT_BUCKET_DEPTH, DEFAULT_URGENCY_MS};
use kinetic_core::response_queue::DEFAULT_RESPONSE_QUEUE_CAPACITY;
use kinetic_core::{AgingConfig, LatencyLogConfig, Limits, PipelineConfig, QueueConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Access;

/// Kinetic drives listen here by default.
pub const DEFAULT_PORT: u16 = 8123;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Everything the server can be configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KineticConfig {
    pub bind: String,
    pub port: u16,
    /// Prometheus exporter port. 0 disables it.
    pub metrics_port: u16,

    pub ingest_threads: usize,
    pub exec_threads: usize,
    pub respond_threads: usize,

    pub max_connections: usize,
    pub provisional_threshold: usize,

    pub bucket_depth: usize,
    pub urgency_ms: u64,
    pub response_queue_capacity: usize,
    pub default_timeout_ms: u64,
    pub retain_ceiling_ms: u64,
    pub aging_window_ms: u64,
    pub aging_poll_ms: u64,

    pub max_key_size: String,
    pub max_version_size: String,
    pub max_value_size: String,
    pub max_message_size: String,
    pub max_batch_size: String,
    pub max_deletes_per_batch: usize,
    pub max_batches: usize,
    pub max_pending_status: usize,
    pub value_pool: String,

    /// Commands slower than this many milliseconds go to the latency log.
    /// -1 disables the log.
    pub latency_log_slower_than_ms: i64,
    pub latency_log_max_len: usize,

    pub cluster_version: i64,
    /// Per-user access. Empty means every user may do everything.
    pub users: Vec<Access>,
}

impl Default for KineticConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            metrics_port: 0,
            ingest_threads: 2,
            exec_threads: 4,
            respond_threads: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            provisional_threshold: kinetic_core::connection::PROVISIONAL_EXCLUSIVITY_THRESHOLD,
            bucket_depth: DEFAULT_BUCKET_DEPTH,
            urgency_ms: DEFAULT_URGENCY_MS,
            response_queue_capacity: DEFAULT_RESPONSE_QUEUE_CAPACITY,
            default_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            retain_ceiling_ms: DEFAULT_RETAIN_CEILING_MS,
            aging_window_ms: 30_000,
            aging_poll_ms: 20,
            max_key_size: "1K".into(),
            max_version_size: "2K".into(),
            max_value_size: "1M".into(),
            max_message_size: "1M".into(),
            max_batch_size: "64M".into(),
            max_deletes_per_batch: Limits::DEFAULT_MAX_DELETES_PER_BATCH,
            max_batches: Limits::DEFAULT_MAX_BATCHES,
            max_pending_status: Limits::DEFAULT_MAX_PENDING_STATUS,
            value_pool: "512M".into(),
            latency_log_slower_than_ms: 10,
            latency_log_max_len: 128,
            cluster_version: 0,
            users: Vec::new(),
        }
    }
}

impl KineticConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn metrics_port(&self) -> Option<u16> {
        (self.metrics_port != 0).then_some(self.metrics_port)
    }

    pub fn limits(&self) -> Result<Limits, ConfigError> {
        Ok(Limits {
            max_key_size: size("max_key_size", &self.max_key_size)?,
            max_version_size: size("max_version_size", &self.max_version_size)?,
            max_value_size: size("max_value_size", &self.max_value_size)?,
            max_message_size: size("max_message_size", &self.max_message_size)?,
            max_batch_size: size("max_batch_size", &self.max_batch_size)?,
            max_deletes_per_batch: self.max_deletes_per_batch,
            max_batches: self.max_batches,
            max_pending_status: self.max_pending_status,
        })
    }

    /// Builds the pipeline tunables, validating as it goes.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        for (key, n) in [
            ("ingest_threads", self.ingest_threads),
            ("exec_threads", self.exec_threads),
            ("respond_threads", self.respond_threads),
            ("bucket_depth", self.bucket_depth),
            ("response_queue_capacity", self.response_queue_capacity),
            ("max_connections", self.max_connections),
        ] {
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.aging_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "aging_poll_ms",
                reason: "must be at least 1".into(),
            });
        }

        Ok(PipelineConfig {
            ingest_threads: self.ingest_threads,
            exec_threads: self.exec_threads,
            respond_threads: self.respond_threads,
            queue: QueueConfig {
                bucket_depth: self.bucket_depth,
                urgency_ms: self.urgency_ms,
            },
            response_queue_capacity: self.response_queue_capacity,
            aging: AgingConfig {
                poll: Duration::from_millis(self.aging_poll_ms),
                default_window_ms: self.aging_window_ms,
            },
            limits: self.limits()?,
            default_timeout_ms: self.default_timeout_ms,
            retain_ceiling_ms: self.retain_ceiling_ms,
            value_pool_bytes: size("value_pool", &self.value_pool)?,
            max_connections: self.max_connections,
            provisional_threshold: self.provisional_threshold,
            latency: LatencyLogConfig {
                slower_than: Duration::from_millis(self.latency_log_slower_than_ms.max(0) as u64),
                max_len: self.latency_log_max_len,
                enabled: self.latency_log_slower_than_ms >= 0,
            },
        })
    }
}

fn size(key: &'static str, input: &str) -> Result<usize, ConfigError> {
    parse_byte_size(input).map_err(|reason| ConfigError::Invalid { key, reason })
}

/// Parses "1024", "100K", "50MB", "2g" and so on into bytes.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty byte size string".into());
    }
    let upper = input.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').filter(|s| !s.is_empty()).unwrap_or(&upper);

    let (digits, multiplier) = match trimmed.as_bytes().last() {
        Some(b'K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some(b'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some(b'G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size: '{input}'"))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: '{input}'"))
}
