mod config;
mod metrics;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kinetic_core::{Collaborators, Pipeline};
use tracing::info;

use crate::config::KineticConfig;
use crate::metrics::MetricsObserver;
use crate::store::MemoryStore;

#[derive(Parser)]
#[command(name = "kinetic-server", about = "kinetic drive request scheduler")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "KINETIC_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "KINETIC_HOST")]
    host: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "KINETIC_PORT")]
    port: Option<u16>,

    /// port for prometheus metrics HTTP endpoint (0 = disabled)
    #[arg(long, env = "KINETIC_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// threads reading commands off connections
    #[arg(long, env = "KINETIC_INGEST_THREADS")]
    ingest_threads: Option<usize>,

    /// threads executing queued commands
    #[arg(long, env = "KINETIC_EXEC_THREADS")]
    exec_threads: Option<usize>,

    /// threads sending responses
    #[arg(long, env = "KINETIC_RESPOND_THREADS")]
    respond_threads: Option<usize>,

    /// maximum concurrent client connections. the least recently active
    /// connection is evicted past this
    #[arg(long, env = "KINETIC_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// bytes reserved for in-flight values (e.g. "512M", "2G")
    #[arg(long, env = "KINETIC_VALUE_POOL")]
    value_pool: Option<String>,

    /// largest total value size one batch may carry (e.g. "64M")
    #[arg(long, env = "KINETIC_MAX_BATCH_SIZE")]
    max_batch_size: Option<String>,

    /// timeout applied to commands that don't set one, in milliseconds
    #[arg(long, env = "KINETIC_DEFAULT_TIMEOUT_MS")]
    default_timeout_ms: Option<u64>,

    /// longest a write-back acknowledgement may be held before a flush, in
    /// milliseconds
    #[arg(long, env = "KINETIC_RETAIN_CEILING_MS")]
    retain_ceiling_ms: Option<u64>,

    /// log commands slower than this many milliseconds. default: 10.
    /// set to -1 to disable, 0 to log every command
    #[arg(long, env = "KINETIC_LATENCY_LOG_SLOWER_THAN")]
    latency_log_slower_than: Option<i64>,

    /// maximum number of entries in the latency log ring buffer
    #[arg(long, env = "KINETIC_LATENCY_LOG_MAX_LEN")]
    latency_log_max_len: Option<usize>,

    /// start with writes refused
    #[arg(long, env = "KINETIC_READ_ONLY")]
    read_only: bool,
}

/// Layers CLI flags and env vars over the file/default config.
fn apply_args(cfg: &mut KineticConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(port) = args.metrics_port {
        cfg.metrics_port = port;
    }
    if let Some(n) = args.ingest_threads {
        cfg.ingest_threads = n;
    }
    if let Some(n) = args.exec_threads {
        cfg.exec_threads = n;
    }
    if let Some(n) = args.respond_threads {
        cfg.respond_threads = n;
    }
    if let Some(n) = args.max_connections {
        cfg.max_connections = n;
    }
    if let Some(ref size) = args.value_pool {
        cfg.value_pool = size.clone();
    }
    if let Some(ref size) = args.max_batch_size {
        cfg.max_batch_size = size.clone();
    }
    if let Some(ms) = args.default_timeout_ms {
        cfg.default_timeout_ms = ms;
    }
    if let Some(ms) = args.retain_ceiling_ms {
        cfg.retain_ceiling_ms = ms;
    }
    if let Some(ms) = args.latency_log_slower_than {
        cfg.latency_log_slower_than_ms = ms;
    }
    if let Some(n) = args.latency_log_max_len {
        cfg.latency_log_max_len = n;
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn parse_bind_addr(host: &str, port: u16, label: &str) -> SocketAddr {
    match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            if label.is_empty() {
                exit_err(format!("invalid bind address '{host}:{port}': {e}"));
            } else {
                exit_err(format!("invalid {label} bind address '{host}:{port}': {e}"));
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kinetic=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match KineticConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => KineticConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => KineticConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let addr = parse_bind_addr(&cfg.bind, cfg.port, "");
    let pipeline_config = cfg.pipeline_config().unwrap_or_else(|e| exit_err(e));

    let store = Arc::new(MemoryStore::new(cfg.cluster_version, cfg.users.clone()));
    if args.read_only {
        store.set_read_only(true);
        info!("starting read-only: writes will be refused");
    }

    info!(
        ingest = pipeline_config.ingest_threads,
        exec = pipeline_config.exec_threads,
        respond = pipeline_config.respond_threads,
        value_pool = pipeline_config.value_pool_bytes,
        "starting pipeline"
    );

    let metrics_addr = cfg
        .metrics_port()
        .map(|port| parse_bind_addr(&cfg.bind, port, "metrics"));

    let mut collab = Collaborators::from_drive(Arc::clone(&store));
    if metrics_addr.is_some() {
        collab = collab.with_observer(Arc::new(MetricsObserver));
    }

    let pipeline = match Pipeline::start(pipeline_config, collab) {
        Ok(p) => Arc::new(p),
        Err(e) => exit_err(format!("failed to start pipeline: {e}")),
    };

    if let Some(metrics_addr) = metrics_addr {
        if let Err(e) = metrics::install_exporter(metrics_addr) {
            exit_err(e);
        }
        metrics::spawn_gauge_poller(Arc::clone(&pipeline), Duration::from_secs(5));
    }

    if let Err(e) = server::run(addr, pipeline).await {
        exit_err(format!("server error: {e}"));
    }

    info!(
        keys = store.len(),
        flushes = store.flush_count(),
        "store closed"
    );
}
