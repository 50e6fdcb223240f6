//! Tests for process descriptions, `pm2 jlist` parsing and event synthesis

use super::pm2::parse_process_list;
use super::snapshot::index_snapshot;
use super::*;
use chrono::{Duration as ChronoDuration, TimeZone};
use std::collections::HashMap;

fn process(pm_id: ProcessId, name: &str, status: ProcessStatus) -> ProcessDescription {
    ProcessDescription {
        identity: ProcessIdentity::new(pm_id, name),
        status,
        created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        min_uptime: DEFAULT_MIN_UPTIME,
        restart_time: 0,
        is_module: false,
    }
}

fn kinds(events: &[ProcessEvent]) -> Vec<(ProcessId, ProcessEventKind)> {
    events
        .iter()
        .map(|event| (event.process.identity.pm_id, event.kind))
        .collect()
}

const JLIST: &str = r#"[
  {
    "pid": 4242,
    "name": "api",
    "pm_id": 0,
    "monit": { "memory": 52428800, "cpu": 1.5 },
    "pm2_env": {
      "status": "online",
      "pm_uptime": 1700000005000,
      "created_at": 1700000000000,
      "min_uptime": 3000,
      "restart_time": 2,
      "axm_options": {}
    }
  },
  {
    "pid": 0,
    "name": "worker",
    "pm_id": 1,
    "pm2_env": {
      "status": "stopped",
      "created_at": 1700000000000,
      "min_uptime": "5s",
      "axm_options": {}
    }
  },
  {
    "pid": 4300,
    "name": "pm2-logrotate",
    "pm_id": 2,
    "pm2_env": {
      "status": "online",
      "pm_uptime": 1700000000000,
      "axm_options": { "isModule": true }
    }
  },
  {
    "name": "legacy",
    "pm_id": 3,
    "pm2_env": { "status": "waiting restart" }
  }
]"#;

#[test]
fn test_parse_jlist() {
    let processes = parse_process_list(JLIST.as_bytes()).unwrap();
    assert_eq!(processes.len(), 4);

    let api = &processes[0];
    assert_eq!(api.identity, ProcessIdentity::new(0, "api"));
    assert_eq!(api.status, ProcessStatus::Online);
    assert_eq!(api.created_at.timestamp_millis(), 1_700_000_005_000);
    assert_eq!(api.min_uptime, Duration::from_millis(3000));
    assert_eq!(api.restart_time, 2);
    assert!(!api.is_module);

    let worker = &processes[1];
    assert_eq!(worker.status, ProcessStatus::Stopped);
    assert_eq!(worker.created_at.timestamp_millis(), 1_700_000_000_000);
    assert_eq!(worker.min_uptime, Duration::from_secs(5));

    assert!(processes[2].is_module);
    assert_eq!(processes[2].min_uptime, DEFAULT_MIN_UPTIME);

    assert_eq!(processes[3].status, ProcessStatus::Unknown);
    assert_eq!(processes[3].restart_time, 0);
}

#[test]
fn test_parse_empty_and_invalid_jlist() {
    assert!(parse_process_list(b"[]").unwrap().is_empty());
    assert!(matches!(
        parse_process_list(b"not json"),
        Err(ProcessManagerError::Parse(_))
    ));
}

#[test]
fn test_status_display_matches_pm2_names() {
    assert_eq!(ProcessStatus::Online.to_string(), "online");
    assert_eq!(ProcessStatus::OneLaunchStatus.to_string(), "one-launch-status");
    assert_eq!(ProcessEventKind::RestartOverlimit.to_string(), "restart overlimit");
}

#[test]
fn test_uptime_is_never_negative() {
    let description = process(0, "api", ProcessStatus::Online);
    let later = description.created_at + ChronoDuration::milliseconds(2500);
    let earlier = description.created_at - ChronoDuration::seconds(10);

    assert_eq!(description.uptime_at(later), Duration::from_millis(2500));
    assert_eq!(description.uptime_at(earlier), Duration::ZERO);
}

#[test]
fn test_default_infrastructure_predicate_uses_module_flag() {
    struct NoopManager;

    #[async_trait]
    impl ProcessManager for NoopManager {
        async fn describe(&self, _: &ProcessIdentity) -> ProcessManagerResult<ProcessDescription> {
            Err(ProcessManagerError::Unavailable("noop".into()))
        }
        async fn restart(&self, _: &ProcessIdentity) -> ProcessManagerResult<()> {
            Ok(())
        }
        async fn list(&self) -> ProcessManagerResult<Vec<ProcessDescription>> {
            Ok(Vec::new())
        }
        async fn subscribe(&self) -> ProcessManagerResult<mpsc::Receiver<ProcessEvent>> {
            Err(ProcessManagerError::Unavailable("noop".into()))
        }
    }

    let mut description = process(0, "api", ProcessStatus::Online);
    assert!(!NoopManager.is_infrastructure(&description));
    description.is_module = true;
    assert!(NoopManager.is_infrastructure(&description));
}

mod diff {
    use super::*;

    #[test]
    fn new_online_process_emits_single_online() {
        let previous = HashMap::new();
        let current = index_snapshot(vec![process(4, "api", ProcessStatus::Online)]);

        let events = diff_snapshots(&previous, &current);
        assert_eq!(kinds(&events), vec![(4, ProcessEventKind::Online)]);
    }

    #[test]
    fn new_stopped_process_is_silent() {
        let previous = HashMap::new();
        let current = index_snapshot(vec![process(4, "api", ProcessStatus::Stopped)]);
        assert!(diff_snapshots(&previous, &current).is_empty());
    }

    #[test]
    fn unchanged_snapshot_is_silent() {
        let snapshot = index_snapshot(vec![
            process(0, "api", ProcessStatus::Online),
            process(1, "worker", ProcessStatus::Stopped),
        ]);
        assert!(diff_snapshots(&snapshot, &snapshot.clone()).is_empty());
    }

    #[test]
    fn coming_online_emits_online() {
        let previous = index_snapshot(vec![process(0, "api", ProcessStatus::Launching)]);
        let current = index_snapshot(vec![process(0, "api", ProcessStatus::Online)]);
        assert_eq!(
            kinds(&diff_snapshots(&previous, &current)),
            vec![(0, ProcessEventKind::Online)]
        );
    }

    #[test]
    fn stopping_emits_stop() {
        let previous = index_snapshot(vec![process(0, "api", ProcessStatus::Online)]);
        for status in [ProcessStatus::Stopped, ProcessStatus::Stopping] {
            let current = index_snapshot(vec![process(0, "api", status)]);
            assert_eq!(
                kinds(&diff_snapshots(&previous, &current)),
                vec![(0, ProcessEventKind::Stop)]
            );
        }
    }

    #[test]
    fn crashing_emits_exit() {
        let previous = index_snapshot(vec![process(0, "api", ProcessStatus::Online)]);
        for status in [ProcessStatus::Errored, ProcessStatus::Launching] {
            let current = index_snapshot(vec![process(0, "api", status)]);
            assert_eq!(
                kinds(&diff_snapshots(&previous, &current)),
                vec![(0, ProcessEventKind::Exit)]
            );
        }
    }

    #[test]
    fn restart_between_polls_emits_restart_and_online() {
        let before = process(0, "api", ProcessStatus::Online);
        let mut after = before.clone();
        after.restart_time = 1;
        after.created_at = before.created_at + ChronoDuration::seconds(30);

        let events = diff_snapshots(&index_snapshot(vec![before]), &index_snapshot(vec![after]));
        assert_eq!(
            kinds(&events),
            vec![(0, ProcessEventKind::Restart), (0, ProcessEventKind::Online)]
        );
        assert_eq!(events[1].process.restart_time, 1);
    }

    #[test]
    fn removed_process_emits_delete_last() {
        let previous = index_snapshot(vec![
            process(0, "api", ProcessStatus::Online),
            process(1, "worker", ProcessStatus::Stopped),
        ]);
        let current = index_snapshot(vec![
            process(1, "worker", ProcessStatus::Online),
            process(5, "cron", ProcessStatus::Online),
        ]);

        assert_eq!(
            kinds(&diff_snapshots(&previous, &current)),
            vec![
                (1, ProcessEventKind::Online),
                (5, ProcessEventKind::Online),
                (0, ProcessEventKind::Delete),
            ]
        );
    }
}
