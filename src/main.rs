//! Backup operator entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use backup_operator::config::OperatorConfig;
use backup_operator::crd;

#[derive(Parser, Debug)]
#[command(name = "backup-operator")]
#[command(about = "Kubernetes operator that schedules, tracks and restores site backups")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "BACKUP_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Log intended writes without performing them
    #[arg(long)]
    dry_run: bool,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: Option<bool>,

    /// Metrics server port
    #[arg(short, long)]
    metrics_port: Option<u16>,

    /// Health check port
    #[arg(short = 'H', long)]
    health_port: Option<u16>,

    /// Image running the backup agent
    #[arg(long)]
    agent_image: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the CustomResourceDefinitions as YAML
    Crdgen,
}

impl Args {
    fn into_config(self) -> anyhow::Result<OperatorConfig> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::from_file(path)?,
            None => OperatorConfig::default(),
        };

        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(json) = self.json_logs {
            config.observability.json_logs = json;
        }
        if let Some(port) = self.metrics_port {
            config.observability.metrics_port = port;
        }
        if let Some(port) = self.health_port {
            config.observability.health_port = port;
        }
        if let Some(image) = self.agent_image {
            config.agent.image = image;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::Crdgen) = args.command {
        for crd in crd::crds() {
            print!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    let config = args.into_config()?;
    backup_operator::observability::init(&config.observability)?;
    backup_operator::run(config).await?;

    Ok(())
}
