use pgrelay::config::BackendConfig;
use pgrelay::core::status::{
    BackendRole, BackendStatus, StatusTable, Transition, TransitionReason,
};
use tempfile::TempDir;

fn backends(n: usize) -> Vec<BackendConfig> {
    (0..n)
        .map(|i| BackendConfig {
            host: format!("10.0.0.{i}"),
            port: 5432,
            weight: 1.0,
            role: if i == 0 {
                Some(BackendRole::Primary)
            } else {
                Some(BackendRole::Standby)
            },
            data_directory: String::new(),
            application_name: format!("node{i}"),
        })
        .collect()
}

fn bring_up(table: &StatusTable, n: usize) {
    for node_id in 0..n {
        table
            .apply(&Transition {
                node_id,
                new_status: BackendStatus::Up,
                quarantine: false,
                new_role: None,
                reason: TransitionReason::Failback,
            })
            .unwrap();
    }
}

#[test]
fn test_new_table_starts_waiting() {
    let table = StatusTable::new(&backends(3), None).unwrap();
    let snapshot = table.snapshot();
    assert_eq!(snapshot.entries.len(), 3);
    assert!(
        snapshot
            .entries
            .iter()
            .all(|e| e.status == BackendStatus::Waiting)
    );
    assert!(snapshot.primary().is_none());
}

#[test]
fn test_generation_bumps_on_apply() {
    let table = StatusTable::new(&backends(2), None).unwrap();
    let before = table.generation();
    bring_up(&table, 1);
    assert_eq!(table.generation(), before + 1);
}

#[test]
fn test_weights_normalize_over_selectable_set() {
    let table = StatusTable::new(&backends(3), None).unwrap();
    bring_up(&table, 3);

    let snapshot = table.snapshot();
    let total: f64 = snapshot.entries.iter().map(|e| e.weight).sum();
    assert!((total - 1.0).abs() < 1e-9);

    // Taking one node down redistributes its weight.
    table
        .apply(&Transition {
            node_id: 2,
            new_status: BackendStatus::Down,
            quarantine: false,
            new_role: None,
            reason: TransitionReason::HealthFail,
        })
        .unwrap();
    let snapshot = table.snapshot();
    assert_eq!(snapshot.entries[2].weight, 0.0);
    assert!((snapshot.entries[0].weight - 0.5).abs() < 1e-9);
}

#[test]
fn test_quarantine_is_not_selectable_but_not_down() {
    let table = StatusTable::new(&backends(2), None).unwrap();
    bring_up(&table, 2);
    table
        .apply(&Transition {
            node_id: 1,
            new_status: BackendStatus::Up,
            quarantine: true,
            new_role: None,
            reason: TransitionReason::Quarantine,
        })
        .unwrap();

    let snapshot = table.snapshot();
    assert_eq!(snapshot.entries[1].status, BackendStatus::Up);
    assert!(snapshot.entries[1].quarantined);
    assert!(!snapshot.entries[1].selectable());
}

#[test]
fn test_snapshot_is_stable_copy() {
    let table = StatusTable::new(&backends(2), None).unwrap();
    bring_up(&table, 2);
    let snapshot = table.snapshot();

    table
        .apply(&Transition {
            node_id: 0,
            new_status: BackendStatus::Down,
            quarantine: false,
            new_role: None,
            reason: TransitionReason::AdminDetach,
        })
        .unwrap();

    // The earlier snapshot still shows the pre-transition picture.
    assert_eq!(snapshot.entries[0].status, BackendStatus::Up);
    assert_eq!(table.snapshot().entries[0].status, BackendStatus::Down);
}

#[test]
fn test_replication_lag_does_not_bump_generation() {
    let table = StatusTable::new(&backends(2), None).unwrap();
    bring_up(&table, 2);
    let generation = table.generation();
    table.record_replication_lag(1, 4096);
    assert_eq!(table.generation(), generation);
    assert_eq!(table.snapshot().entries[1].replication_lag, 4096);
}

#[test]
fn test_statuses_survive_restart_via_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgrelay_status");

    {
        let table = StatusTable::new(&backends(3), Some(&path)).unwrap();
        bring_up(&table, 3);
        table
            .apply(&Transition {
                node_id: 1,
                new_status: BackendStatus::Down,
                quarantine: false,
                new_role: None,
                reason: TransitionReason::HealthFail,
            })
            .unwrap();
    }

    // A new table over the same file restores the picture.
    let table = StatusTable::new(&backends(3), Some(&path)).unwrap();
    let snapshot = table.snapshot();
    assert_eq!(snapshot.entries[0].status, BackendStatus::Up);
    assert_eq!(snapshot.entries[1].status, BackendStatus::Down);
    assert_eq!(snapshot.entries[2].status, BackendStatus::Up);
    assert!(!table.status_file_dirty());
}

#[test]
fn test_mismatched_status_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgrelay_status");

    {
        let table = StatusTable::new(&backends(2), Some(&path)).unwrap();
        bring_up(&table, 2);
    }

    // Restarting with a different backend count falls back to defaults.
    let table = StatusTable::new(&backends(3), Some(&path)).unwrap();
    assert!(
        table
            .snapshot()
            .entries
            .iter()
            .all(|e| e.status == BackendStatus::Waiting)
    );
}

#[test]
fn test_promote_changes_role() {
    let table = StatusTable::new(&backends(2), None).unwrap();
    bring_up(&table, 2);
    table
        .apply(&Transition {
            node_id: 1,
            new_status: BackendStatus::Up,
            quarantine: false,
            new_role: Some(BackendRole::Primary),
            reason: TransitionReason::Promote,
        })
        .unwrap();
    table
        .apply(&Transition {
            node_id: 0,
            new_status: BackendStatus::Down,
            quarantine: false,
            new_role: Some(BackendRole::Standby),
            reason: TransitionReason::Demote,
        })
        .unwrap();

    let snapshot = table.snapshot();
    assert_eq!(snapshot.primary().map(|e| e.node_id), Some(1));
}
