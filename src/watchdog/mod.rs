//! Watchdog Module
//!
//! This module provides health supervision of PM2 processes. Each watchdog
//! periodically requests the web endpoint of its process and asks PM2 to
//! restart the process once the endpoint failed too many times in a row.

pub mod probe;
pub mod registry;
pub mod supervisor;


pub use probe::{BasicAuth, HealthProbe, HttpProbe, ProbeFailure, ProbeOutcome};
pub use registry::WatchdogRegistry;
pub use supervisor::{
    next_check_delay, FailureStreak, StreakVerdict, Watchdog, WatchdogConfig, WatchdogState,
    DEFAULT_CHECKING_INTERVAL, DEFAULT_CHECKING_TIMEOUT, DESCRIBE_RETRY_BACKOFF, MIN_CHECK_DELAY,
};
