//! Lifecycle event synthesis from consecutive process snapshots.
//!
//! PM2 exposes its event bus only to Node clients, so events are derived by
//! comparing two `pm2 jlist` results.

use std::collections::HashMap;

use super::{ProcessDescription, ProcessEvent, ProcessEventKind, ProcessId, ProcessStatus};

/// Index a snapshot by `pm_id`
pub fn index_snapshot(
    processes: impl IntoIterator<Item = ProcessDescription>,
) -> HashMap<ProcessId, ProcessDescription> {
    processes
        .into_iter()
        .map(|process| (process.identity.pm_id, process))
        .collect()
}

/// Derive the lifecycle events that turn `previous` into `current`.
///
/// Events are ordered by `pm_id`; deletions come last.
pub fn diff_snapshots(
    previous: &HashMap<ProcessId, ProcessDescription>,
    current: &HashMap<ProcessId, ProcessDescription>,
) -> Vec<ProcessEvent> {
    let mut events = Vec::new();

    let mut current_ids: Vec<_> = current.keys().copied().collect();
    current_ids.sort_unstable();

    for pm_id in current_ids {
        let now = &current[&pm_id];
        match previous.get(&pm_id) {
            None => {
                // Online only, the listener handles start and online alike
                if now.is_online() {
                    events.push(ProcessEvent::new(ProcessEventKind::Online, now.clone()));
                }
            }
            Some(before) => transition_events(before, now, &mut events),
        }
    }

    let mut removed: Vec<_> = previous
        .keys()
        .filter(|pm_id| !current.contains_key(pm_id))
        .copied()
        .collect();
    removed.sort_unstable();

    for pm_id in removed {
        events.push(ProcessEvent::new(
            ProcessEventKind::Delete,
            previous[&pm_id].clone(),
        ));
    }

    events
}

fn transition_events(
    before: &ProcessDescription,
    now: &ProcessDescription,
    events: &mut Vec<ProcessEvent>,
) {
    let restarted = now.restart_time > before.restart_time || now.created_at > before.created_at;

    match (before.is_online(), now.is_online()) {
        (true, true) if restarted => {
            events.push(ProcessEvent::new(ProcessEventKind::Restart, now.clone()));
            events.push(ProcessEvent::new(ProcessEventKind::Online, now.clone()));
        }
        (true, true) => {}
        (false, true) => {
            if restarted {
                events.push(ProcessEvent::new(ProcessEventKind::Restart, now.clone()));
            }
            events.push(ProcessEvent::new(ProcessEventKind::Online, now.clone()));
        }
        (true, false) => {
            let kind = match now.status {
                ProcessStatus::Stopping | ProcessStatus::Stopped => ProcessEventKind::Stop,
                _ => ProcessEventKind::Exit,
            };
            events.push(ProcessEvent::new(kind, now.clone()));
        }
        (false, false) => {}
    }
}
