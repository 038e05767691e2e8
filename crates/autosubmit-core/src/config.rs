use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AutosubmitError, Result};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";

// Scheduling defaults. Every value is overridable; see `SchedulerConfig`.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_LEASE_SECS: u64 = 600; // must outlive every dispatch wave of a batch
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Ceiling for every scheduler duration (lease, timeout, backoff, cadences).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;
/// Ceiling for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 100;

/// Top-level config (autosubmit.toml + AUTOSUBMIT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutosubmitConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// SQLite busy timeout. A store call blocked longer than this fails and the
    /// worker retries on its next tick.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Knobs for the claim / dispatch / reconcile workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of the claim + dispatch tick.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Cadence of the orphaned-claim sweep. Independent of `poll_interval_secs`.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// How long a claim stays valid before the reconciler may take it back.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Hard cap on a single executor call.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Claims allowed per job, lease expiries included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Executor calls in flight per worker.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    /// A failed attempt becomes eligible again after `retry_backoff_secs * attempt_count`.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            lease_secs: DEFAULT_LEASE_SECS,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Reject combinations the claim protocol cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AutosubmitError::Config(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AutosubmitError::Config(
                "scheduler.batch_size must be at least 1".to_string(),
            ));
        }
        if self.dispatch_concurrency == 0 {
            return Err(AutosubmitError::Config(
                "scheduler.dispatch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 || self.reconcile_interval_secs == 0 {
            return Err(AutosubmitError::Config(
                "scheduler intervals must be at least 1 second".to_string(),
            ));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(AutosubmitError::Config(format!(
                "scheduler.max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        for (name, secs) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("lease_secs", self.lease_secs),
            ("execution_timeout_secs", self.execution_timeout_secs),
            ("retry_backoff_secs", self.retry_backoff_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(AutosubmitError::Config(format!(
                    "scheduler.{name} ({secs}) must be at most {MAX_DURATION_SECS}"
                )));
            }
        }
        // A batch is dispatched in waves of `dispatch_concurrency`; every job's
        // lease starts at claim time, so it must cover the last wave too.
        let waves = u64::from(self.batch_size).div_ceil(self.dispatch_concurrency as u64);
        let worst_case = self.execution_timeout_secs * waves;
        if self.lease_secs <= worst_case {
            return Err(AutosubmitError::Config(format!(
                "scheduler.lease_secs ({}) must exceed execution_timeout_secs ({}) x {} dispatch waves \
                 (batch_size {} / dispatch_concurrency {})",
                self.lease_secs,
                self.execution_timeout_secs,
                waves,
                self.batch_size,
                self.dispatch_concurrency
            )));
        }
        Ok(())
    }
}

/// Where claimed jobs are sent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_url")]
    pub url: String,
    /// Bearer token presented to the executor, if it requires one.
    pub token: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url: default_executor_url(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, every owner request must carry `Authorization: Bearer <token>`.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            token: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}
fn default_dispatch_concurrency() -> usize {
    DEFAULT_DISPATCH_CONCURRENCY
}
fn default_retry_backoff_secs() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}
fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}
fn default_executor_url() -> String {
    "http://127.0.0.1:8000/execute".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.autosubmit/autosubmit.db", home)
}

impl AutosubmitConfig {
    /// Load config from a TOML file with AUTOSUBMIT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.autosubmit/autosubmit.toml
    ///
    /// Nested keys are addressed with a double underscore, e.g.
    /// `AUTOSUBMIT_SCHEDULER__LEASE_SECS=600`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AutosubmitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("AUTOSUBMIT_").split("__"))
            .extract()
            .map_err(|e| AutosubmitError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.autosubmit/autosubmit.toml", home)
}
