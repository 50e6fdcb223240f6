//! Error types for pm2-watchdog

use thiserror::Error;

use crate::config::ConfigError;
use crate::logging::LoggingError;
use crate::process::ProcessManagerError;

/// Result type alias for pm2-watchdog operations
pub type Result<T> = std::result::Result<T, Pm2WatchdogError>;

/// Main error type for pm2-watchdog
#[derive(Error, Debug)]
pub enum Pm2WatchdogError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process manager error: {0}")]
    ProcessManager(#[from] ProcessManagerError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
