//! pm2-watchdog - HTTP health watchdog for PM2 processes
//!
//! This crate provides:
//! - One watchdog per PM2 process, probing its web endpoint periodically
//! - Restart of the process after too many consecutive failed probes
//! - Watchdog lifecycle driven by PM2 process events
//! - PM2 access through its command line (`pm2 jlist`, `pm2 restart`)
//! - Layered configuration and structured logging

pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod process;
pub mod watchdog;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use crate::config::{ConfigSource, ModuleConfig};
pub use error::{Pm2WatchdogError, Result};
pub use listener::{serve, EventListener};
pub use process::{Pm2Cli, ProcessManager};
pub use watchdog::{HealthProbe, HttpProbe, Watchdog, WatchdogConfig, WatchdogRegistry};
