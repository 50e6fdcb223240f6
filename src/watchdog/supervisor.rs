//! Watchdog Supervisor Module
//!
//! Implements the per-process watchdog that periodically checks the web
//! endpoint of a PM2 process and restarts the process when the endpoint keeps
//! failing.
//!
//! The health-checking loop is a single spawned task per watchdog walking
//! through [`WatchdogState`]: describe the process, wait for the next check,
//! probe, and restart once the failure streak reaches the threshold. Every
//! suspension point races against the watchdog's cancellation token so that
//! [`Watchdog::stop`] takes effect immediately.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use super::probe::{BasicAuth, HealthProbe, ProbeFailure};
use crate::process::{ProcessIdentity, ProcessManager};

/// Wait before retrying after the process manager failed to describe the process
pub const DESCRIBE_RETRY_BACKOFF: Duration = Duration::from_millis(5000);

/// Lower bound for the delay between two checks
pub const MIN_CHECK_DELAY: Duration = Duration::from_millis(1000);

/// Default minimum delay between two checks
pub const DEFAULT_CHECKING_INTERVAL: Duration = Duration::from_millis(10_000);

/// Default per-probe timeout
pub const DEFAULT_CHECKING_TIMEOUT: Duration = Duration::from_millis(5000);

/// Watchdog configuration
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Health-check endpoint
    pub watched_url: Url,

    /// Credentials sent with each probe
    pub basic_auth: Option<BasicAuth>,

    /// Minimum delay between two checks
    pub checking_interval: Duration,

    /// Consecutive failures that trigger a restart
    pub fails_to_restart: NonZeroU32,

    /// Per-probe timeout
    pub checking_timeout: Duration,
}

impl WatchdogConfig {
    /// Create a configuration with default interval and timeout
    pub fn new(watched_url: Url, fails_to_restart: NonZeroU32) -> Self {
        Self {
            watched_url,
            basic_auth: None,
            checking_interval: DEFAULT_CHECKING_INTERVAL,
            fails_to_restart,
            checking_timeout: DEFAULT_CHECKING_TIMEOUT,
        }
    }

    pub fn with_checking_interval(mut self, interval: Duration) -> Self {
        self.checking_interval = interval;
        self
    }

    pub fn with_checking_timeout(mut self, timeout: Duration) -> Self {
        self.checking_timeout = timeout;
        self
    }

    pub fn with_basic_auth(mut self, auth: BasicAuth) -> Self {
        self.basic_auth = Some(auth);
        self
    }
}

/// Watchdog state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Not running
    Idle,
    /// Waiting for the process description
    AwaitingDescribe,
    /// Describe failed, waiting before the next attempt
    BackingOff,
    /// Waiting for the next scheduled check
    AwaitingTimer,
    /// Probe in flight
    AwaitingProbe,
    /// Restart request in flight
    AwaitingRestart,
}

/// What a failed probe means for the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakVerdict {
    /// Still below the threshold
    Tolerated { failures: u32 },
    /// Threshold reached, the process must be restarted
    RestartDue { failures: u32 },
}

/// Consecutive failed probes since the last success or successful restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStreak {
    failures: u32,
}

impl FailureStreak {
    pub fn count(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self, threshold: NonZeroU32) -> StreakVerdict {
        self.failures = self.failures.saturating_add(1);
        if self.failures < threshold.get() {
            StreakVerdict::Tolerated {
                failures: self.failures,
            }
        } else {
            StreakVerdict::RestartDue {
                failures: self.failures,
            }
        }
    }
}

/// Delay before the next check.
///
/// Never probes before the process manager considers the process stable
/// (`min_uptime`), never faster than `checking_interval`, never below
/// [`MIN_CHECK_DELAY`].
pub fn next_check_delay(
    min_uptime: Duration,
    uptime: Duration,
    checking_interval: Duration,
) -> Duration {
    min_uptime
        .saturating_sub(uptime)
        .max(checking_interval)
        .max(MIN_CHECK_DELAY)
}

/// State shared between a watchdog and its health-checking task
struct Shared {
    identity: ProcessIdentity,
    config: WatchdogConfig,
    running: AtomicBool,
    streak: Mutex<FailureStreak>,
    restart_count: AtomicU64,
    state: RwLock<WatchdogState>,
}

/// Watchdog of one PM2 process
pub struct Watchdog {
    shared: Arc<Shared>,
    process_manager: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
    cancel: Option<CancellationToken>,
}

impl Watchdog {
    /// Create a stopped watchdog
    pub fn new(
        identity: ProcessIdentity,
        config: WatchdogConfig,
        process_manager: Arc<dyn ProcessManager>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                config,
                running: AtomicBool::new(false),
                streak: Mutex::new(FailureStreak::default()),
                restart_count: AtomicU64::new(0),
                state: RwLock::new(WatchdogState::Idle),
            }),
            process_manager,
            probe,
            cancel: None,
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Current failure streak
    pub fn failure_streak(&self) -> u32 {
        self.shared.streak.lock().count()
    }

    /// Restart requests issued by this watchdog
    pub fn restart_count(&self) -> u64 {
        self.shared.restart_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WatchdogState {
        *self.shared.state.read()
    }

    /// Start the health-checking loop. Must be called within a tokio runtime.
    pub fn start(&mut self) {
        let name = &self.shared.identity.name;
        if self.is_running() {
            tracing::trace!(
                "Process {} - cannot start watchdog, because it is already running",
                name
            );
            return;
        }

        tracing::info!(
            "Process {} - starting watching {}",
            name,
            self.shared.config.watched_url
        );

        self.shared.streak.lock().reset();
        self.shared.running.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let health_loop = HealthLoop {
            shared: Arc::clone(&self.shared),
            process_manager: Arc::clone(&self.process_manager),
            probe: Arc::clone(&self.probe),
            cancel: cancel.clone(),
        };
        tokio::spawn(health_loop.run());
        self.cancel = Some(cancel);
    }

    /// Stop the health-checking loop. A pending check never fires and an
    /// in-flight probe result is discarded.
    pub fn stop(&mut self) {
        let name = &self.shared.identity.name;
        if !self.is_running() {
            tracing::trace!(
                "Process {} - cannot stop watchdog, because it is not running",
                name
            );
            return;
        }

        tracing::info!("Process {} - stopping watchdog", name);

        let mut state = self.shared.state.write();
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.take() {
            tracing::trace!("Process {} - removing planned checking", name);
            cancel.cancel();
        }
        *state = WatchdogState::Idle;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("identity", &self.shared.identity)
            .field("running", &self.is_running())
            .field("failure_streak", &self.failure_streak())
            .field("state", &self.state())
            .finish()
    }
}

/// The health-checking task of one watchdog run
struct HealthLoop {
    shared: Arc<Shared>,
    process_manager: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
    cancel: CancellationToken,
}

impl HealthLoop {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.shared.running.load(Ordering::SeqCst)
    }

    /// Liveness is checked under the state lock, so a concurrent `stop()`
    /// always has the last word.
    fn enter(&self, state: WatchdogState) {
        let mut current = self.shared.state.write();
        if self.is_live() {
            *current = state;
        }
    }

    /// Sleep unless cancelled first; returns false when cancelled
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn run(self) {
        while self.is_live() {
            if !self.cycle().await {
                break;
            }
        }
        tracing::trace!(
            "Process {} - health checking loop finished",
            self.shared.identity.name
        );
    }

    /// One describe, wait, probe, react cycle. Returns false once cancelled.
    async fn cycle(&self) -> bool {
        let identity = &self.shared.identity;
        let config = &self.shared.config;

        self.enter(WatchdogState::AwaitingDescribe);
        let described = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            result = self.process_manager.describe(identity) => result,
        };

        let description = match described {
            Ok(description) => description,
            Err(e) => {
                tracing::error!(
                    "Process {} - failed to receive process details: {}",
                    identity.name,
                    e
                );
                self.enter(WatchdogState::BackingOff);
                return self.sleep(DESCRIBE_RETRY_BACKOFF).await;
            }
        };
        if !self.is_live() {
            return false;
        }

        let delay = next_check_delay(
            description.min_uptime,
            description.uptime_at(Utc::now()),
            config.checking_interval,
        );
        tracing::trace!(
            "Process {} - next checking after {}s",
            identity.name,
            delay.as_secs()
        );

        self.enter(WatchdogState::AwaitingTimer);
        if !self.sleep(delay).await || !self.is_live() {
            return false;
        }

        tracing::trace!("Process {} - webserver checking executed", identity.name);
        self.enter(WatchdogState::AwaitingProbe);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            outcome = self.probe.probe(
                &config.watched_url,
                config.basic_auth.as_ref(),
                config.checking_timeout,
            ) => outcome,
        };

        match outcome {
            Ok(()) => {
                self.shared.streak.lock().reset();
                tracing::debug!("Process {} - webserver response ok", identity.name);
                true
            }
            Err(failure) => self.handle_failure(failure).await,
        }
    }

    async fn handle_failure(&self, failure: ProbeFailure) -> bool {
        if !self.is_live() {
            return false;
        }

        let identity = &self.shared.identity;
        let threshold = self.shared.config.fails_to_restart;
        let verdict = self.shared.streak.lock().record_failure(threshold);

        let failures = match verdict {
            StreakVerdict::Tolerated { failures } => {
                tracing::info!(
                    "Process {} - webserver response {}/{} failed: {}",
                    identity.name,
                    failures,
                    threshold,
                    failure
                );
                return true;
            }
            StreakVerdict::RestartDue { failures } => failures,
        };

        tracing::warn!(
            "Process {} - restarting because of webserver is failing ({} in a row, last: {})",
            identity.name,
            failures,
            failure
        );

        self.enter(WatchdogState::AwaitingRestart);
        self.shared.restart_count.fetch_add(1, Ordering::SeqCst);
        let restarted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            result = self.process_manager.restart(identity) => result,
        };

        match restarted {
            Ok(()) => {
                self.shared.streak.lock().reset();
                tracing::info!("Process {} - restart requested", identity.name);
            }
            Err(e) => {
                tracing::error!("Process {} - restart failed. {}", identity.name, e);
            }
        }
        true
    }
}
