//! `autosubmit-core`: configuration and shared error types.

pub mod config;
pub mod error;

pub use config::{ApiConfig, AutosubmitConfig, DatabaseConfig, ExecutorConfig, SchedulerConfig};
pub use error::{AutosubmitError, Result};
