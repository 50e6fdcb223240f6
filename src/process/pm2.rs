//! PM2 command-line adapter
//!
//! Implements [`ProcessManager`] on top of the `pm2` CLI:
//! - `pm2 jlist` for listing and describing processes
//! - `pm2 restart <pm_id>` for restarts
//! - polling `pm2 jlist` and diffing snapshots for lifecycle events

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::snapshot::{diff_snapshots, index_snapshot};
use super::{
    ProcessDescription, ProcessEvent, ProcessId, ProcessIdentity, ProcessManager,
    ProcessManagerError, ProcessManagerResult, ProcessStatus, DEFAULT_MIN_UPTIME,
};
use crate::config::Pm2Settings;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// PM2 process manager driven through its CLI
#[derive(Debug, Clone)]
pub struct Pm2Cli {
    bin: String,
    poll_interval: Duration,
    command_timeout: Duration,
    self_name: Option<String>,
}

impl Pm2Cli {
    /// Create an adapter from configuration
    pub fn new(settings: &Pm2Settings) -> Self {
        Self {
            bin: settings.bin.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
            self_name: settings.self_name.clone(),
        }
    }

    /// Run one pm2 command and return its stdout
    async fn run(&self, args: &[&str]) -> ProcessManagerResult<Vec<u8>> {
        let command = format!("{} {}", self.bin, args.join(" "));
        tracing::trace!(%command, "Running pm2 command");

        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| ProcessManagerError::CommandTimeout {
                command: command.clone(),
                timeout: self.command_timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(ProcessManagerError::CommandFailed { command, reason });
        }

        Ok(output.stdout)
    }

    /// Poll `pm2 jlist` and forward the derived events until the receiver goes away
    async fn poll_events(
        self,
        mut previous: HashMap<ProcessId, ProcessDescription>,
        events: mpsc::Sender<ProcessEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the baseline is already known.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = events.closed() => break,
                _ = ticker.tick() => {}
            }

            let current = match self.list().await {
                Ok(processes) => index_snapshot(processes),
                Err(e) => {
                    tracing::warn!("Polling pm2 process list failed: {}", e);
                    continue;
                }
            };

            for event in diff_snapshots(&previous, &current) {
                if events.send(event).await.is_err() {
                    tracing::debug!("Event receiver dropped, stopping pm2 poller");
                    return;
                }
            }
            previous = current;
        }

        tracing::debug!("pm2 poller stopped");
    }
}

#[async_trait]
impl ProcessManager for Pm2Cli {
    async fn describe(&self, identity: &ProcessIdentity) -> ProcessManagerResult<ProcessDescription> {
        tracing::trace!(process = %identity.name, "Getting process details");
        select_description(self.list().await?, identity)
    }

    async fn restart(&self, identity: &ProcessIdentity) -> ProcessManagerResult<()> {
        let pm_id = identity.pm_id.to_string();
        self.run(&["restart", &pm_id]).await?;
        Ok(())
    }

    async fn list(&self) -> ProcessManagerResult<Vec<ProcessDescription>> {
        let stdout = self.run(&["jlist"]).await?;
        parse_process_list(&stdout)
    }

    async fn subscribe(&self) -> ProcessManagerResult<mpsc::Receiver<ProcessEvent>> {
        let baseline = index_snapshot(self.list().await?);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let poller = self.clone();
        tokio::spawn(poller.poll_events(baseline, tx));

        Ok(rx)
    }

    fn is_infrastructure(&self, process: &ProcessDescription) -> bool {
        process.is_module || self.self_name.as_deref() == Some(process.identity.name.as_str())
    }
}

// ============================================================================
// `pm2 jlist` parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawProcess {
    name: String,
    pm_id: ProcessId,
    #[serde(default)]
    pm2_env: RawPm2Env,
}

#[derive(Debug, Default, Deserialize)]
struct RawPm2Env {
    #[serde(default)]
    status: Option<ProcessStatus>,
    #[serde(default)]
    pm_uptime: Option<i64>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    min_uptime: Option<Value>,
    #[serde(default)]
    restart_time: u32,
    #[serde(default)]
    axm_options: RawAxmOptions,
}

#[derive(Debug, Default, Deserialize)]
struct RawAxmOptions {
    #[serde(default, rename = "isModule")]
    is_module: bool,
}

impl RawProcess {
    fn into_description(self) -> ProcessDescription {
        let env = self.pm2_env;
        let started_ms = env.pm_uptime.or(env.created_at).unwrap_or(0);

        ProcessDescription {
            identity: ProcessIdentity::new(self.pm_id, self.name),
            status: env.status.unwrap_or(ProcessStatus::Unknown),
            created_at: DateTime::<Utc>::from_timestamp_millis(started_ms).unwrap_or_default(),
            min_uptime: env
                .min_uptime
                .as_ref()
                .and_then(parse_min_uptime)
                .unwrap_or(DEFAULT_MIN_UPTIME),
            restart_time: env.restart_time,
            is_module: env.axm_options.is_module,
        }
    }
}

/// Parse the output of `pm2 jlist`
pub fn parse_process_list(raw: &[u8]) -> ProcessManagerResult<Vec<ProcessDescription>> {
    let text = String::from_utf8_lossy(raw);
    let processes: Vec<RawProcess> = serde_json::from_str(json_payload(&text))?;
    Ok(processes
        .into_iter()
        .map(RawProcess::into_description)
        .collect())
}

/// The single description of `identity` in a process list
pub fn select_description(
    processes: Vec<ProcessDescription>,
    identity: &ProcessIdentity,
) -> ProcessManagerResult<ProcessDescription> {
    let mut matching: Vec<_> = processes
        .into_iter()
        .filter(|process| process.identity.pm_id == identity.pm_id)
        .collect();

    if matching.len() != 1 {
        return Err(ProcessManagerError::UnexpectedDescriptionCount {
            pm_id: identity.pm_id,
            count: matching.len(),
        });
    }
    Ok(matching.remove(0))
}

/// Skip banner lines pm2 prints before the JSON document (e.g. when it spawns its daemon).
/// Banner lines look like `[PM2] ...`, so only a `[` followed by `{`, `]` or
/// nothing else on the line opens the document.
fn json_payload(text: &str) -> &str {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if opens_json_array(line) {
            return text[offset..].trim();
        }
        offset += line.len();
    }
    text.trim()
}

fn opens_json_array(line: &str) -> bool {
    match line.trim().strip_prefix('[') {
        Some(rest) => matches!(rest.trim_start().chars().next(), None | Some('{') | Some(']')),
        None => false,
    }
}

/// `min_uptime` is a number of milliseconds or a string such as `"1000"`, `"5s"`
fn parse_min_uptime(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_millis),
        Value::String(s) => parse_duration_str(s),
        _ => None,
    }
}

fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let ms = match unit.trim() {
        "" | "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    Some(Duration::from_millis(ms))
}
