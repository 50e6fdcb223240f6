//! Process Manager Module
//!
//! Describes the processes managed by PM2 and the operations the watchdog
//! needs from the process manager:
//! - Describing a single process (uptime-related fields)
//! - Restarting a process
//! - Listing all processes (startup snapshot)
//! - Streaming lifecycle events

pub mod pm2;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use pm2::Pm2Cli;
pub use snapshot::diff_snapshots;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// PM2 process id (`pm_id`)
pub type ProcessId = u32;

/// Default `min_uptime` applied by PM2 when a process does not set one
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_millis(1000);

/// Process manager errors
#[derive(Error, Debug)]
pub enum ProcessManagerError {
    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Unexpected number of descriptions for process {pm_id}: {count}")]
    UnexpectedDescriptionCount { pm_id: ProcessId, count: usize },

    #[error("Invalid process list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Process manager unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for process manager calls
pub type ProcessManagerResult<T> = Result<T, ProcessManagerError>;

/// Identity of a managed process; `pm_id` is the registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pm_id: ProcessId,
    pub name: String,
}

impl ProcessIdentity {
    pub fn new(pm_id: ProcessId, name: impl Into<String>) -> Self {
        Self {
            pm_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.pm_id)
    }
}

/// Status reported by PM2 for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Online,
    Stopping,
    Stopped,
    Launching,
    Errored,
    OneLaunchStatus,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessStatus::Online => "online",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Launching => "launching",
            ProcessStatus::Errored => "errored",
            ProcessStatus::OneLaunchStatus => "one-launch-status",
            ProcessStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Snapshot of a managed process as seen by the process manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescription {
    pub identity: ProcessIdentity,
    pub status: ProcessStatus,
    /// Start of the current incarnation
    pub created_at: DateTime<Utc>,
    /// Uptime the process manager requires before considering the process stable
    pub min_uptime: Duration,
    /// Number of restarts performed by the process manager
    pub restart_time: u32,
    /// Set for PM2 modules (including this watchdog when run as a module)
    pub is_module: bool,
}

impl ProcessDescription {
    pub fn is_online(&self) -> bool {
        self.status == ProcessStatus::Online
    }

    /// Uptime at `now`; zero if the clock reads earlier than `created_at`
    pub fn uptime_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Lifecycle event kinds emitted by PM2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessEventKind {
    Start,
    Online,
    Stop,
    Exit,
    Restart,
    RestartOverlimit,
    Delete,
}

impl fmt::Display for ProcessEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessEventKind::Start => "start",
            ProcessEventKind::Online => "online",
            ProcessEventKind::Stop => "stop",
            ProcessEventKind::Exit => "exit",
            ProcessEventKind::Restart => "restart",
            ProcessEventKind::RestartOverlimit => "restart overlimit",
            ProcessEventKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A lifecycle event together with the process state it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub kind: ProcessEventKind,
    pub process: ProcessDescription,
}

impl ProcessEvent {
    pub fn new(kind: ProcessEventKind, process: ProcessDescription) -> Self {
        Self { kind, process }
    }
}

/// Operations the watchdog needs from the process manager
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Describe one process
    async fn describe(&self, identity: &ProcessIdentity) -> ProcessManagerResult<ProcessDescription>;

    /// Restart one process
    async fn restart(&self, identity: &ProcessIdentity) -> ProcessManagerResult<()>;

    /// List every managed process
    async fn list(&self) -> ProcessManagerResult<Vec<ProcessDescription>>;

    /// Subscribe to lifecycle events. The stream ends when the receiver is dropped
    /// or the event source shuts down.
    async fn subscribe(&self) -> ProcessManagerResult<mpsc::Receiver<ProcessEvent>>;

    /// Whether the process belongs to the process manager's own infrastructure
    /// and must never be supervised
    fn is_infrastructure(&self, process: &ProcessDescription) -> bool {
        process.is_module
    }
}
