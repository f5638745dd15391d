//! Backup operator for multi-tenant sites.
//!
//! Decides when scheduled backups are due, creates and supervises backup jobs
//! through a forward-only phase machine, and drives restores from completed
//! backups. All state lives in Kubernetes custom resources:
//!
//! - **BackupScheduled**: a cron schedule for one site.
//! - **Backup**: one snapshot of a site's volumes and databases.
//! - **Restore**: replays a completed Backup onto a site.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  kube-runtime controllers (watch, retry, backoff)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Schedule reconciler | Backup lifecycle | Restore lifecycle  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Decision engine (cron) | Phase state machine                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResourceStore | ExecutionAgent | SiteDirectory              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use backup_operator::config::OperatorConfig;
//!
//! #[tokio::main]
//! async fn main() -> backup_operator::Result<()> {
//!     let config = OperatorConfig::default();
//!     backup_operator::observability::init(&config.observability)?;
//!     backup_operator::run(config).await
//! }
//! ```

pub mod agent;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod scheduling;
pub mod sites;
pub mod store;

// Re-exports
pub use error::{Error, Result};

use config::OperatorConfig;
use controller::Controllers;
use tracing::{error, info};

/// Run the operator against the cluster from the ambient kubeconfig.
pub async fn run(config: OperatorConfig) -> Result<()> {
    info!(
        namespace = %config.namespace,
        dry_run = config.dry_run,
        "Starting backup operator"
    );

    let client = kube::Client::try_default().await?;
    let controllers = Controllers::new(client, config.clone());
    controllers.verify_crds().await?;

    let metrics_port = config.observability.metrics_port;
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = metrics::run_metrics_server(metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let health_port = config.observability.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = observability::run_health_server(health_port).await {
            error!(error = %e, "Health server error");
        }
    });

    let schedule_handle = {
        let controllers = controllers.clone();
        tokio::spawn(async move {
            if let Err(e) = controllers.run_schedule_controller().await {
                error!(error = %e, "Schedule controller error");
            }
        })
    };

    let backup_handle = {
        let controllers = controllers.clone();
        tokio::spawn(async move {
            if let Err(e) = controllers.run_backup_controller().await {
                error!(error = %e, "Backup controller error");
            }
        })
    };

    let restore_handle = tokio::spawn(async move {
        if let Err(e) = controllers.run_restore_controller().await {
            error!(error = %e, "Restore controller error");
        }
    });

    info!("All controllers started");

    // Any controller returning means a shutdown signal arrived
    tokio::select! {
        _ = schedule_handle => info!("Schedule controller stopped"),
        _ = backup_handle => info!("Backup controller stopped"),
        _ = restore_handle => info!("Restore controller stopped"),
        _ = metrics_handle => info!("Metrics server stopped"),
        _ = health_handle => info!("Health server stopped"),
    }

    Ok(())
}
