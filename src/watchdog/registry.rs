//! Watchdog Registry
//!
//! Maps live PM2 processes to their watchdog. At most one watchdog exists per
//! `pm_id`; replacing one always stops the previous instance first.

use std::collections::HashMap;
use std::sync::Arc;

use super::probe::HealthProbe;
use super::supervisor::{Watchdog, WatchdogConfig};
use crate::process::{ProcessId, ProcessIdentity, ProcessManager};

/// Owner of every running watchdog
pub struct WatchdogRegistry {
    process_manager: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
    watchdogs: HashMap<ProcessId, Watchdog>,
}

impl WatchdogRegistry {
    pub fn new(process_manager: Arc<dyn ProcessManager>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            process_manager,
            probe,
            watchdogs: HashMap::new(),
        }
    }

    /// Start a watchdog for `identity`, replacing any existing one.
    ///
    /// `None` means the process is not configured for monitoring.
    pub fn start_or_replace(&mut self, identity: &ProcessIdentity, config: Option<WatchdogConfig>) {
        let Some(config) = config else {
            tracing::trace!("Process {} - no watchdog configuration", identity.name);
            return;
        };

        self.remove(identity);

        let watchdog = self.watchdogs.entry(identity.pm_id).or_insert_with(|| {
            Watchdog::new(
                identity.clone(),
                config,
                Arc::clone(&self.process_manager),
                Arc::clone(&self.probe),
            )
        });
        watchdog.start();
    }

    /// Stop and forget the watchdog of `identity`. Returns whether one existed.
    pub fn remove(&mut self, identity: &ProcessIdentity) -> bool {
        match self.watchdogs.remove(&identity.pm_id) {
            Some(mut watchdog) => {
                watchdog.stop();
                true
            }
            None => {
                tracing::trace!(
                    "Process {} - no watchdog exists for removal",
                    identity.name
                );
                false
            }
        }
    }

    /// Stop every watchdog
    pub fn stop_all(&mut self) {
        for (_, mut watchdog) in self.watchdogs.drain() {
            watchdog.stop();
        }
    }

    pub fn get(&self, pm_id: ProcessId) -> Option<&Watchdog> {
        self.watchdogs.get(&pm_id)
    }

    pub fn contains(&self, pm_id: ProcessId) -> bool {
        self.watchdogs.contains_key(&pm_id)
    }

    pub fn len(&self) -> usize {
        self.watchdogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchdogs.is_empty()
    }
}
