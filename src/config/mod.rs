//! Configuration Module for pm2-watchdog
//!
//! Provides the module configuration with:
//! - Layered loading (defaults, config file, environment)
//! - Per-process health-check URLs and credentials
//! - Validation before any watchdog starts

mod settings;

pub use settings::{
    ConfigError, ConfigResult, ConfigSource, ModuleConfig, Pm2Settings, ENV_PREFIX,
};
