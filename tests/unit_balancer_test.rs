use pgrelay::config::BackendConfig;
use pgrelay::core::router::balancer::select_replica_with;
use pgrelay::core::status::{
    BackendRole, BackendStatus, StatusTable, Transition, TransitionReason,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::HashMap;

fn table_with_weights(weights: &[f64]) -> StatusTable {
    let backends: Vec<BackendConfig> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| BackendConfig {
            host: format!("10.0.0.{i}"),
            port: 5432,
            weight: *w,
            role: if i == 0 {
                Some(BackendRole::Primary)
            } else {
                Some(BackendRole::Standby)
            },
            data_directory: String::new(),
            application_name: String::new(),
        })
        .collect();
    let table = StatusTable::new(&backends, None).unwrap();
    for node_id in 0..weights.len() {
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
    table
}

#[test]
fn test_no_replicas_returns_none() {
    let table = table_with_weights(&[1.0]);
    let mut rng = SmallRng::seed_from_u64(7);
    assert_eq!(select_replica_with(&table.snapshot(), 0, &mut rng), None);
}

#[test]
fn test_primary_is_never_selected() {
    let table = table_with_weights(&[1.0, 1.0]);
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..100 {
        assert_eq!(
            select_replica_with(&table.snapshot(), 0, &mut rng),
            Some(1)
        );
    }
}

#[test]
fn test_down_and_quarantined_replicas_are_skipped() {
    let table = table_with_weights(&[1.0, 1.0, 1.0]);
    table
        .apply(&Transition {
            node_id: 1,
            new_status: BackendStatus::Up,
            quarantine: true,
            new_role: None,
            reason: TransitionReason::Quarantine,
        })
        .unwrap();

    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..100 {
        assert_eq!(
            select_replica_with(&table.snapshot(), 0, &mut rng),
            Some(2)
        );
    }
}

#[test]
fn test_lagging_replica_excluded_by_threshold() {
    let table = table_with_weights(&[1.0, 1.0, 1.0]);
    table.record_replication_lag(1, 10_000_000);
    table.record_replication_lag(2, 100);

    let snapshot = table.snapshot();
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..100 {
        assert_eq!(select_replica_with(&snapshot, 1_000_000, &mut rng), Some(2));
    }
    // With the check disabled both replicas are eligible again.
    let mut seen: HashMap<usize, u64> = HashMap::new();
    for _ in 0..200 {
        let node = select_replica_with(&snapshot, 0, &mut rng).unwrap();
        *seen.entry(node).or_default() += 1;
    }
    assert!(seen.contains_key(&1));
    assert!(seen.contains_key(&2));
}

#[test]
fn test_weight_faithfulness() {
    // Spec-style scenario: three equal replicas, 3000 decisions, each
    // replica chosen 1000 +/- 60 times.
    let table = table_with_weights(&[0.0, 1.0, 1.0, 1.0]);
    let snapshot = table.snapshot();
    let mut rng = SmallRng::seed_from_u64(42);

    let mut counts: HashMap<usize, u64> = HashMap::new();
    for _ in 0..3000 {
        let node = select_replica_with(&snapshot, 0, &mut rng).unwrap();
        *counts.entry(node).or_default() += 1;
    }
    for node in 1..=3 {
        let count = counts[&node];
        assert!(
            (940..=1060).contains(&count),
            "node {node} selected {count} times"
        );
    }
}

#[test]
fn test_skewed_weights_converge() {
    let table = table_with_weights(&[0.0, 3.0, 1.0]);
    let snapshot = table.snapshot();
    let mut rng = SmallRng::seed_from_u64(42);

    let mut heavy = 0u64;
    const DRAWS: u64 = 4000;
    for _ in 0..DRAWS {
        if select_replica_with(&snapshot, 0, &mut rng) == Some(1) {
            heavy += 1;
        }
    }
    let share = heavy as f64 / DRAWS as f64;
    assert!((share - 0.75).abs() < 0.03, "heavy share was {share}");
}

#[test]
fn test_zero_weight_replica_never_selected() {
    let table = table_with_weights(&[1.0, 0.0, 1.0]);
    let snapshot = table.snapshot();
    let mut rng = SmallRng::seed_from_u64(9);
    for _ in 0..200 {
        assert_eq!(select_replica_with(&snapshot, 0, &mut rng), Some(2));
    }
}
