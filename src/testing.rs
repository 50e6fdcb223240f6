//! Test doubles for the process manager and the health probe

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;

use crate::process::{
    ProcessDescription, ProcessEvent, ProcessId, ProcessIdentity, ProcessManager,
    ProcessManagerError, ProcessManagerResult, ProcessStatus, DEFAULT_MIN_UPTIME,
};
use crate::watchdog::{BasicAuth, HealthProbe, ProbeFailure, ProbeOutcome, WatchdogConfig};

/// An online process started an hour ago
pub fn online_process(pm_id: ProcessId, name: &str) -> ProcessDescription {
    ProcessDescription {
        identity: ProcessIdentity::new(pm_id, name),
        status: ProcessStatus::Online,
        created_at: Utc::now() - ChronoDuration::hours(1),
        min_uptime: DEFAULT_MIN_UPTIME,
        restart_time: 0,
        is_module: false,
    }
}

/// Config checking every second with the given threshold
pub fn watchdog_config(fails_to_restart: u32) -> WatchdogConfig {
    WatchdogConfig::new(
        Url::parse("http://127.0.0.1:3000/health").unwrap(),
        NonZeroU32::new(fails_to_restart).unwrap(),
    )
    .with_checking_interval(Duration::from_millis(1000))
    .with_checking_timeout(Duration::from_millis(500))
}

/// In-memory process manager recording every call
#[derive(Default)]
pub struct MockProcessManager {
    processes: Mutex<HashMap<ProcessId, ProcessDescription>>,
    failing_describes: AtomicU32,
    fail_restarts: AtomicBool,
    fail_list: AtomicBool,
    describe_calls: AtomicU32,
    restarts: Mutex<Vec<ProcessId>>,
    events: Mutex<Option<mpsc::Receiver<ProcessEvent>>>,
}

impl MockProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(self, process: ProcessDescription) -> Self {
        self.insert(process);
        self
    }

    pub fn insert(&self, process: ProcessDescription) {
        self.processes
            .lock()
            .insert(process.identity.pm_id, process);
    }

    /// Make the next `count` describe calls fail
    pub fn fail_next_describes(&self, count: u32) {
        self.failing_describes.store(count, Ordering::SeqCst);
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restarts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Restart requests received, in order
    pub fn restarts(&self) -> Vec<ProcessId> {
        self.restarts.lock().clone()
    }

    /// Create the channel handed out by `subscribe`
    pub fn event_sender(&self) -> mpsc::Sender<ProcessEvent> {
        let (tx, rx) = mpsc::channel(32);
        *self.events.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn describe(&self, identity: &ProcessIdentity) -> ProcessManagerResult<ProcessDescription> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_describes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_describes.store(failing - 1, Ordering::SeqCst);
            return Err(ProcessManagerError::Unavailable("pm2 daemon not reachable".into()));
        }

        self.processes
            .lock()
            .get(&identity.pm_id)
            .cloned()
            .ok_or(ProcessManagerError::UnexpectedDescriptionCount {
                pm_id: identity.pm_id,
                count: 0,
            })
    }

    async fn restart(&self, identity: &ProcessIdentity) -> ProcessManagerResult<()> {
        self.restarts.lock().push(identity.pm_id);
        if self.fail_restarts.load(Ordering::SeqCst) {
            return Err(ProcessManagerError::CommandFailed {
                command: format!("pm2 restart {}", identity.pm_id),
                reason: "process or namespace not found".into(),
            });
        }
        Ok(())
    }

    async fn list(&self) -> ProcessManagerResult<Vec<ProcessDescription>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ProcessManagerError::Unavailable("pm2 daemon not reachable".into()));
        }
        let mut processes: Vec<_> = self.processes.lock().values().cloned().collect();
        processes.sort_by_key(|process| process.identity.pm_id);
        Ok(processes)
    }

    async fn subscribe(&self) -> ProcessManagerResult<mpsc::Receiver<ProcessEvent>> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| ProcessManagerError::Unavailable("no event channel".into()))
    }
}

/// Probe replaying scripted outcomes, then a fallback outcome forever
pub struct ScriptedProbe {
    outcomes: Mutex<VecDeque<ProbeOutcome>>,
    fallback: ProbeOutcome,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with_fallback(Ok(()))
    }

    pub fn failing() -> Self {
        Self::with_fallback(Err(ProbeFailure::Status(503)))
    }

    fn with_fallback(fallback: ProbeOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = ProbeOutcome>) -> Self {
        self.outcomes.lock().extend(outcomes);
        self
    }

    /// Delay every response, keeping the probe in flight
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _url: &Url, _auth: Option<&BasicAuth>, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self.outcomes.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
