use crate::error::{Result, WorkerError};
use sandbox_orchestrator::{LeaseConfig, OrchestratorConfig, TimeoutPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Number of concurrent worker sessions in this process.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker waits before looking for work again.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_lease_grace")]
    pub lease_grace_secs: u64,

    #[serde(default = "default_max_tries")]
    pub max_try_count: u32,

    /// First retry delay after a transient failure, doubled on each try.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_provider")]
    pub provider: String,

    /// YAML file overriding the built-in timeout table.
    #[serde(default)]
    pub timeout_policy: Option<PathBuf>,
}

fn default_db_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata)
            .join("sandbox")
            .join("orchestrator.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".sandbox")
            .join("orchestrator.db")
    }
}

fn default_workers() -> usize {
    4
}

fn default_idle_poll_ms() -> u64 {
    1_000
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_lease_grace() -> u64 {
    LeaseConfig::default().grace_secs
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    OrchestratorConfig::default().retry_backoff_ms
}

fn default_provider() -> String {
    "dry-run".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: default_workers(),
            idle_poll_ms: default_idle_poll_ms(),
            sweep_interval_secs: default_sweep_interval(),
            lease_grace_secs: default_lease_grace(),
            max_try_count: default_max_tries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            provider: default_provider(),
            timeout_policy: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `SANDBOX_*` keys. Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.parse().ok()).unwrap_or(default)
        }

        let defaults = Self::default();
        let config = Self {
            db_path: lookup("SANDBOX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            workers: parsed(lookup("SANDBOX_WORKERS"), defaults.workers),
            idle_poll_ms: parsed(lookup("SANDBOX_IDLE_POLL_MS"), defaults.idle_poll_ms),
            sweep_interval_secs: parsed(
                lookup("SANDBOX_SWEEP_INTERVAL"),
                defaults.sweep_interval_secs,
            ),
            lease_grace_secs: parsed(lookup("SANDBOX_LEASE_GRACE"), defaults.lease_grace_secs),
            max_try_count: parsed(lookup("SANDBOX_MAX_TRIES"), defaults.max_try_count),
            retry_backoff_ms: parsed(lookup("SANDBOX_RETRY_BACKOFF_MS"), defaults.retry_backoff_ms),
            provider: lookup("SANDBOX_PROVIDER").unwrap_or(defaults.provider),
            timeout_policy: lookup("SANDBOX_TIMEOUT_POLICY").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(WorkerError::InvalidSetting {
                name: "SANDBOX_WORKERS",
                value: "0".to_string(),
            });
        }
        if self.max_try_count == 0 {
            return Err(WorkerError::InvalidSetting {
                name: "SANDBOX_MAX_TRIES",
                value: "0".to_string(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(WorkerError::InvalidSetting {
                name: "SANDBOX_SWEEP_INTERVAL",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// The orchestrator settings this worker runs with, loading the timeout
    /// policy file when one is configured.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let timeouts = match &self.timeout_policy {
            Some(path) => load_timeout_policy(path)?,
            None => TimeoutPolicy::default(),
        };

        Ok(OrchestratorConfig {
            default_max_try_count: self.max_try_count,
            retry_backoff_ms: self.retry_backoff_ms,
            lease: LeaseConfig {
                grace_secs: self.lease_grace_secs,
            },
            timeouts,
            ..OrchestratorConfig::default()
        })
    }
}

pub fn load_timeout_policy(path: &Path) -> Result<TimeoutPolicy> {
    let raw = std::fs::read_to_string(path)?;
    serde_yaml_ng::from_str(&raw).map_err(|source| WorkerError::TimeoutPolicy {
        path: path.to_path_buf(),
        source,
    })
}
