//! Prometheus metrics for the backup operator

use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

use crate::crd::Phase;
use crate::error::Result;

lazy_static::lazy_static! {
    /// Total reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["controller", "result"]
    ).expect("reconciliations metric registers once");

    /// Reconciliation duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "backup_operator_reconciliation_duration_seconds",
        "Duration of reconciliations",
        &["controller"]
    ).expect("duration metric registers once");

    /// Backups created by schedules
    pub static ref BACKUPS_TRIGGERED: CounterVec = register_counter_vec!(
        "backup_operator_backups_triggered_total",
        "Number of backups created by schedules",
        &["namespace"]
    ).expect("triggered metric registers once");

    /// Phase transitions written
    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "backup_operator_phase_transitions_total",
        "Number of backup and restore phase transitions",
        &["kind", "phase"]
    ).expect("transitions metric registers once");

    /// Operator errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "backup_operator_errors_total",
        "Total number of errors",
        &["reason"]
    ).expect("errors metric registers once");
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let metrics = render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics.len(),
                    metrics
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}

/// Encode all registered metrics in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record a reconciliation and how long it took
pub fn record_reconciliation(controller: &str, success: bool, duration_secs: f64) {
    let result = if success { "success" } else { "failure" };
    RECONCILIATIONS.with_label_values(&[controller, result]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration_secs);
}

/// Record a backup created by a schedule
pub fn record_backup_triggered(namespace: &str) {
    BACKUPS_TRIGGERED.with_label_values(&[namespace]).inc();
}

/// Record a phase transition
pub fn record_phase_transition(kind: &str, phase: Phase) {
    PHASE_TRANSITIONS
        .with_label_values(&[kind, phase.as_str()])
        .inc();
}

/// Record an error
pub fn record_error(reason: &str) {
    ERRORS.with_label_values(&[reason]).inc();
}
