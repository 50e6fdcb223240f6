//! Module configuration
//!
//! Layered loading with the `config` crate: built-in defaults, then an
//! optional config file (JSON, TOML or YAML by extension), then environment
//! variables prefixed with `PM2_WATCHDOG` (nested keys separated by `__`).

use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use reqwest::Url;

use crate::logging::LoggingConfig;
use crate::watchdog::{BasicAuth, WatchdogConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PM2_WATCHDOG";

/// Legacy per-process URL key prefix
const LEGACY_URL_PREFIX: &str = "url-";

/// Legacy per-process credentials key prefix
const LEGACY_AUTH_PREFIX: &str = "urlauth-";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Resolves a process name to its watchdog configuration
pub trait ConfigSource: Send + Sync {
    /// `None` means the process is not monitored
    fn resolve(&self, process_name: &str) -> Option<WatchdogConfig>;
}

/// Settings of the `pm2` command line adapter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pm2Settings {
    /// Path or name of the pm2 executable
    pub bin: String,

    /// Delay between two process list snapshots
    #[serde(alias = "poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for a single pm2 invocation
    #[serde(alias = "command_timeout")]
    pub command_timeout_ms: u64,

    /// Name under which the watchdog itself runs in PM2, never watched
    pub self_name: Option<String>,
}

impl Default for Pm2Settings {
    fn default() -> Self {
        Self {
            bin: "pm2".to_string(),
            poll_interval_ms: 2000,
            command_timeout_ms: 10_000,
            self_name: None,
        }
    }
}

/// Watchdog module configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    /// Minimum delay between two checks, in milliseconds
    #[serde(default = "default_checking_interval_ms", alias = "checking_interval")]
    pub checking_interval_ms: u64,

    /// Per-probe timeout, in milliseconds
    #[serde(default = "default_checking_timeout_ms", alias = "checking_timeout")]
    pub checking_timeout_ms: u64,

    /// Consecutive failures that trigger a restart
    pub fails_to_restart: NonZeroU32,

    /// Raise the log level to trace
    #[serde(default)]
    pub debug: bool,

    /// Health-check URL per process name
    #[serde(default)]
    pub urls: HashMap<String, String>,

    /// `user:password` credentials per process name
    #[serde(default)]
    pub auth: HashMap<String, String>,

    #[serde(default)]
    pub pm2: Pm2Settings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_checking_interval_ms() -> u64 {
    10_000
}

fn default_checking_timeout_ms() -> u64 {
    5000
}

impl ModuleConfig {
    /// Configuration without any watched process
    pub fn new(fails_to_restart: NonZeroU32) -> Self {
        Self {
            checking_interval_ms: default_checking_interval_ms(),
            checking_timeout_ms: default_checking_timeout_ms(),
            fails_to_restart,
            debug: false,
            urls: HashMap::new(),
            auth: HashMap::new(),
            pm2: Pm2Settings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pm2-watchdog")
            .join("config.json")
    }

    /// Load and validate the configuration.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (file, required) = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                (path.to_path_buf(), true)
            }
            None => (Self::default_path(), false),
        };

        tracing::debug!("Loading configuration from {:?}", file);

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        Self::load_from(
            ::config::File::from(file.as_path()).required(required),
            environment,
        )
    }

    /// Load from an explicit file and environment source
    pub fn load_from<F, E>(file: F, environment: E) -> ConfigResult<Self>
    where
        F: ::config::Source + Send + Sync + 'static,
        E: ::config::Source + Send + Sync + 'static,
    {
        let settings = ::config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?;

        let mut config: ModuleConfig = settings.clone().try_deserialize()?;
        let raw: HashMap<String, ::config::Value> = settings.try_deserialize()?;
        config.absorb_legacy_keys(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Move `url-<name>` and `urlauth-<name>` keys into the url and auth tables
    fn absorb_legacy_keys(&mut self, raw: HashMap<String, ::config::Value>) -> ConfigResult<()> {
        for (key, value) in raw {
            // `urlauth-` also starts with `url`, so test it first
            let (table, name) = if let Some(name) = key.strip_prefix(LEGACY_AUTH_PREFIX) {
                (&mut self.auth, name)
            } else if let Some(name) = key.strip_prefix(LEGACY_URL_PREFIX) {
                (&mut self.urls, name)
            } else {
                continue;
            };

            let value = value.into_string()?;
            table.entry(name.to_string()).or_insert(value);
        }
        Ok(())
    }

    /// Reject configurations no watchdog could run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.checking_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "checking_interval must be at least 1 ms".to_string(),
            ));
        }

        if self.checking_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "checking_timeout must be at least 1 ms".to_string(),
            ));
        }

        if self.pm2.bin.trim().is_empty() {
            return Err(ConfigError::Invalid("pm2.bin must not be empty".to_string()));
        }

        if self.pm2.poll_interval_ms == 0 || self.pm2.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pm2.poll_interval and pm2.command_timeout must be at least 1 ms".to_string(),
            ));
        }

        for (name, url) in &self.urls {
            if url.is_empty() {
                continue;
            }
            parse_watched_url(url).map_err(|reason| {
                ConfigError::Invalid(format!("Invalid URL for process {}: {}", name, reason))
            })?;
        }

        for (name, credentials) in &self.auth {
            if BasicAuth::parse(credentials).username.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Invalid credentials for process {}: expected user:password",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn checking_interval(&self) -> Duration {
        Duration::from_millis(self.checking_interval_ms)
    }

    pub fn checking_timeout(&self) -> Duration {
        Duration::from_millis(self.checking_timeout_ms)
    }

    pub fn with_url(mut self, process_name: impl Into<String>, url: impl Into<String>) -> Self {
        self.urls.insert(process_name.into(), url.into());
        self
    }

    pub fn with_auth(
        mut self,
        process_name: impl Into<String>,
        credentials: impl Into<String>,
    ) -> Self {
        self.auth.insert(process_name.into(), credentials.into());
        self
    }

    pub fn with_checking_interval(mut self, interval: Duration) -> Self {
        self.checking_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_checking_timeout(mut self, timeout: Duration) -> Self {
        self.checking_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Entry for `process_name`, exact match first, then ignoring case
    fn lookup<'a>(table: &'a HashMap<String, String>, process_name: &str) -> Option<&'a String> {
        table.get(process_name).or_else(|| {
            table
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(process_name))
                .map(|(_, value)| value)
        })
    }
}

impl ConfigSource for ModuleConfig {
    fn resolve(&self, process_name: &str) -> Option<WatchdogConfig> {
        let url = Self::lookup(&self.urls, process_name)?;
        if url.is_empty() {
            return None;
        }

        let watched_url = match parse_watched_url(url) {
            Ok(url) => url,
            Err(reason) => {
                tracing::error!("Process {} - invalid watched URL: {}", process_name, reason);
                return None;
            }
        };

        let mut config = WatchdogConfig::new(watched_url, self.fails_to_restart)
            .with_checking_interval(self.checking_interval())
            .with_checking_timeout(self.checking_timeout());

        if let Some(credentials) = Self::lookup(&self.auth, process_name) {
            config = config.with_basic_auth(BasicAuth::parse(credentials));
        }

        Some(config)
    }
}

/// Parse an http(s) URL
fn parse_watched_url(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(format!("unsupported scheme {}", scheme)),
    }
}
