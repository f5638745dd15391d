//! Configuration module for the backup operator.
//!
//! A single [`OperatorConfig`] value is built at startup (file, then CLI
//! overrides) and passed into every reconciler call. Nothing here is global.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace to watch; empty watches all namespaces.
    pub namespace: String,
    /// Log intended writes instead of performing them.
    pub dry_run: bool,
    /// Periodic re-check of non-terminal jobs, covering missed watch events.
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,
    /// Delay before retrying after an optimistic-concurrency conflict.
    #[serde(with = "humantime_serde")]
    pub conflict_retry: Duration,
    /// Backoff for transient errors.
    pub backoff: BackoffConfig,
    /// Execution agent settings.
    pub agent: AgentConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            dry_run: false,
            resync_interval: Duration::from_secs(300),
            conflict_retry: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
            agent: AgentConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.backoff.initial_delay.is_zero() {
            return Err(Error::InvalidConfig {
                field: "backoff.initial_delay".to_string(),
                reason: "Initial delay must be non-zero".to_string(),
            });
        }

        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(Error::InvalidConfig {
                field: "backoff.max_delay".to_string(),
                reason: "Max delay must not be shorter than the initial delay".to_string(),
            });
        }

        if self.backoff.multiplier < 1.0 {
            return Err(Error::InvalidConfig {
                field: "backoff.multiplier".to_string(),
                reason: "Multiplier must be at least 1.0".to_string(),
            });
        }

        if self.agent.image.is_empty() {
            return Err(Error::InvalidConfig {
                field: "agent.image".to_string(),
                reason: "Agent image must be set".to_string(),
            });
        }

        if self.resync_interval.is_zero() {
            return Err(Error::InvalidConfig {
                field: "resync_interval".to_string(),
                reason: "Resync interval must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Exponential backoff for transient reconcile errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Execution agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Container image running the restic agent.
    pub image: String,
    /// Service account for agent pods.
    pub service_account: Option<String>,
    /// Pod retries before the agent job is marked failed.
    pub backoff_limit: i32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/uofa/shepherd-restic:latest".to_string(),
            service_account: None,
            backoff_limit: 2,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub json_logs: bool,
    /// Port for the Prometheus metrics endpoint.
    pub metrics_port: u16,
    /// Port for the health endpoint.
    pub health_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: 8080,
            health_port: 8081,
        }
    }
}

/// Serde helper for human-readable durations (`500ms`, `30s`, `5m`, `1h`).
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = duration.as_millis();
        if ms % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", ms))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("'{}': {}", s, e));
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(m) = s.strip_suffix('m') {
            parse(m).map(|v| Duration::from_secs(v * 60))
        } else if let Some(h) = s.strip_suffix('h') {
            parse(h).map(|v| Duration::from_secs(v * 3600))
        } else {
            parse(s).map(Duration::from_millis)
        }
    }
}
