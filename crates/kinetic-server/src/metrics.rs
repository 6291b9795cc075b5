//! Prometheus metrics.
//!
//! When `--metrics-port` is set a Prometheus exporter serves the global
//! `metrics` recorder. Per-command counters and latency histograms are
//! recorded by [`MetricsObserver`], which the pipeline calls as work
//! completes. A background poller copies pipeline gauges every few
//! seconds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kinetic_core::{OpKind, Pipeline, PipelineObserver, Status};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Histogram buckets for end-to-end command latency (100µs to 10s).
const HISTOGRAM_BUCKETS: &[f64] = &[
    0.000_1, // 100µs
    0.000_5, // 500µs
    0.001,   // 1ms
    0.005,   // 5ms
    0.01,    // 10ms
    0.05,    // 50ms
    0.1,     // 100ms
    0.5,     // 500ms
    1.0,
    7.0, // retain ceiling
    10.0,
];

/// Installs the recorder and starts the exporter's HTTP listener.
///
/// Must be called from inside the tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(HISTOGRAM_BUCKETS)
        .map_err(|e| format!("failed to set histogram buckets: {e}"))?
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {e}"))?;
    info!("metrics endpoint on http://{addr}/metrics");
    Ok(())
}

/// Forwards pipeline events to the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl PipelineObserver for MetricsObserver {
    fn on_command_complete(&self, op: OpKind, status: &Status, total_us: u64) {
        let labels = [("op", op.name())];
        counter!("kinetic_commands_total", &labels).increment(1);
        histogram!("kinetic_command_duration_seconds", &labels).record(total_us as f64 / 1e6);
        if !status.is_success() {
            let labels = [("op", op.name()), ("status", status.code.as_str())];
            counter!("kinetic_command_errors_total", &labels).increment(1);
        }
    }

    fn on_request_expired(&self, op: OpKind) {
        counter!("kinetic_requests_expired_total", "op" => op.name()).increment(1);
    }

    fn on_batch_committed(&self, members: usize) {
        counter!("kinetic_batches_committed_total").increment(1);
        histogram!("kinetic_batch_members").record(members as f64);
    }

    fn on_batch_aborted(&self) {
        counter!("kinetic_batches_aborted_total").increment(1);
    }

    fn on_batch_expired(&self) {
        counter!("kinetic_batches_expired_total").increment(1);
    }

    fn on_response_retained(&self) {
        counter!("kinetic_responses_retained_total").increment(1);
    }

    fn on_connection_closed(&self, _conn_id: u64) {
        gauge!("kinetic_connections_active").decrement(1.0);
        counter!("kinetic_connections_closed_total").increment(1);
    }
}

pub fn on_connection_accepted() {
    gauge!("kinetic_connections_active").increment(1.0);
    counter!("kinetic_connections_total").increment(1);
}

pub fn on_connection_rejected() {
    counter!("kinetic_connections_rejected_total").increment(1);
}

/// Copies pipeline gauges into the recorder every `interval`.
pub fn spawn_gauge_poller(pipeline: Arc<Pipeline>, interval: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let s = pipeline.stats();
            gauge!("kinetic_queue_depth").set(s.queue_depth as f64);
            gauge!("kinetic_response_queue_depth").set(s.response_queue_depth as f64);
            gauge!("kinetic_open_batches").set(s.open_batches as f64);
            gauge!("kinetic_value_pool_used_bytes").set(s.pool_used_bytes as f64);
            gauge!("kinetic_pending_responses").set(s.pending_responses as f64);
            gauge!("kinetic_latency_log_entries").set(pipeline.latency_log().len() as f64);
        }
    });
}
