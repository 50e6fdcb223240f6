//! Event Listener Module
//!
//! Keeps the watchdog registry in line with the processes PM2 runs: a
//! bootstrap pass over the current process list at startup, then one registry
//! operation per lifecycle event.


use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSource;
use crate::error::Result;
use crate::process::{
    ProcessDescription, ProcessEvent, ProcessEventKind, ProcessManager, ProcessManagerResult,
};
use crate::watchdog::{HealthProbe, WatchdogRegistry};

/// Translates process lifecycle into watchdog registry operations.
///
/// Sole owner of the registry, so every mutation is serialized through it.
pub struct EventListener {
    process_manager: Arc<dyn ProcessManager>,
    config_source: Arc<dyn ConfigSource>,
    registry: WatchdogRegistry,
}

impl EventListener {
    pub fn new(
        process_manager: Arc<dyn ProcessManager>,
        probe: Arc<dyn HealthProbe>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        let registry = WatchdogRegistry::new(Arc::clone(&process_manager), probe);
        Self {
            process_manager,
            config_source,
            registry,
        }
    }

    pub fn registry(&self) -> &WatchdogRegistry {
        &self.registry
    }

    /// Start watchdogs for every online process. Returns how many were started.
    pub async fn bootstrap(&mut self) -> ProcessManagerResult<usize> {
        tracing::trace!("Getting list of processes");

        let processes = self.process_manager.list().await.map_err(|e| {
            tracing::error!("PM2 get process list failed. {}", e);
            e
        })?;

        for process in &processes {
            if self.process_manager.is_infrastructure(process) {
                tracing::trace!(
                    "Process {} - is PM2 module. Ignoring it",
                    process.identity.name
                );
                continue;
            }

            if process.is_online() {
                self.start_or_replace(process);
            } else {
                tracing::trace!(
                    "Process {} - is not online, no watchdog yet",
                    process.identity.name
                );
            }
        }

        let started = self.registry.len();
        tracing::info!(
            "Watching {} of {} processes",
            started,
            processes.len()
        );
        Ok(started)
    }

    /// Apply one lifecycle event to the registry
    pub fn handle_event(&mut self, event: &ProcessEvent) {
        let process = &event.process;
        if self.process_manager.is_infrastructure(process) {
            return;
        }

        tracing::debug!("Process {} - event {}", process.identity.name, event.kind);

        match event.kind {
            ProcessEventKind::Start | ProcessEventKind::Online => {
                if process.is_online() {
                    self.start_or_replace(process);
                } else {
                    tracing::warn!(
                        "Process {} - unexpected status when starting: {}",
                        process.identity.name,
                        process.status
                    );
                }
            }
            ProcessEventKind::Stop | ProcessEventKind::Exit | ProcessEventKind::Delete => {
                self.registry.remove(&process.identity);
            }
            ProcessEventKind::Restart | ProcessEventKind::RestartOverlimit => {
                tracing::debug!(
                    "Process {} - {} needs no watchdog change",
                    process.identity.name,
                    event.kind
                );
            }
        }
    }

    /// Consume events until the stream closes or `shutdown` fires, then stop
    /// every watchdog.
    pub async fn run(mut self, mut events: mpsc::Receiver<ProcessEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&event),
                    None => {
                        tracing::warn!("Process event stream closed");
                        break;
                    }
                },
            }
        }

        tracing::info!("Stopping {} watchdogs", self.registry.len());
        self.registry.stop_all();
    }

    fn start_or_replace(&mut self, process: &ProcessDescription) {
        let config = self.config_source.resolve(&process.identity.name);
        self.registry.start_or_replace(&process.identity, config);
    }
}

/// Subscribe to lifecycle events, start watchdogs for the running processes
/// and supervise until `shutdown` fires.
///
/// Subscribing first means no event between the snapshot and the stream is lost.
pub async fn serve(
    process_manager: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
    config_source: Arc<dyn ConfigSource>,
    shutdown: CancellationToken,
) -> Result<()> {
    let events = process_manager.subscribe().await?;

    let mut listener = EventListener::new(process_manager, probe, config_source);
    listener.bootstrap().await?;
    listener.run(events, shutdown).await;

    Ok(())
}
