use pgrelay::config::Config;
use pgrelay::core::failover::{
    FailoverExecutor, FailoverRequest, NodeRequestKind, RequestOrigin, promotion_candidate,
};
use pgrelay::core::state::{ControlEvent, Runtime};
use pgrelay::core::status::{BackendStatus, TransitionReason};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(num_backends: usize) -> Config {
    let mut toml = String::from("port = 16432\npool_passwd = \"\"\n");
    for i in 0..num_backends {
        toml.push_str(&format!(
            "[[backend]]\nhost = \"10.0.0.{i}\"\nweight = {}\nrole = \"{}\"\n",
            if i == 1 { 2.0 } else { 1.0 },
            if i == 0 { "primary" } else { "standby" },
        ));
    }
    let config: Config = toml::from_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

/// Builds a runtime with all backends up and a running executor without a
/// watchdog (single-instance mode).
async fn runtime_with_executor(num_backends: usize) -> (Arc<Runtime>, TempDir) {
    let dir = TempDir::new().unwrap();
    let status_path = dir.path().join("status");
    let (runtime, request_rx) =
        Runtime::new(test_config(num_backends), Some(&status_path), "").unwrap();

    let executor = FailoverExecutor::new(runtime.clone(), None, request_rx);
    tokio::spawn(executor.run());

    for node_id in 0..num_backends {
        runtime.post_request(FailoverRequest::node(
            node_id,
            NodeRequestKind::Failback,
            TransitionReason::Failback,
            RequestOrigin::Admin,
            runtime.status.generation(),
        ));
    }
    wait_until(&runtime, |r| {
        r.status.snapshot().entries.iter().all(|e| e.selectable())
    })
    .await;
    (runtime, dir)
}

async fn wait_until(runtime: &Arc<Runtime>, predicate: impl Fn(&Arc<Runtime>) -> bool) {
    for _ in 0..200 {
        if predicate(runtime) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_detach_marks_node_down() {
    let (runtime, _dir) = runtime_with_executor(3).await;

    runtime.post_request(FailoverRequest::node(
        2,
        NodeRequestKind::Detach,
        TransitionReason::AdminDetach,
        RequestOrigin::Admin,
        runtime.status.generation(),
    ));

    wait_until(&runtime, |r| {
        r.status.snapshot().entries[2].status == BackendStatus::Down
    })
    .await;
}

#[tokio::test]
async fn test_primary_loss_promotes_best_standby() {
    let (runtime, _dir) = runtime_with_executor(3).await;

    runtime.post_request(FailoverRequest::node(
        0,
        NodeRequestKind::Detach,
        TransitionReason::HealthFail,
        RequestOrigin::Health,
        runtime.status.generation(),
    ));

    // Node 1 carries the heavier weight and wins the promotion.
    wait_until(&runtime, |r| {
        let snapshot = r.status.snapshot();
        snapshot.entries[0].status == BackendStatus::Down
            && snapshot.primary().map(|e| e.node_id) == Some(1)
    })
    .await;
}

#[tokio::test]
async fn test_quarantine_and_failback() {
    let (runtime, _dir) = runtime_with_executor(2).await;

    runtime.post_request(FailoverRequest::node(
        1,
        NodeRequestKind::Quarantine,
        TransitionReason::Quarantine,
        RequestOrigin::Health,
        runtime.status.generation(),
    ));
    wait_until(&runtime, |r| r.status.snapshot().entries[1].quarantined).await;
    assert_eq!(
        runtime.status.snapshot().entries[1].status,
        BackendStatus::Up
    );

    runtime.post_request(FailoverRequest::node(
        1,
        NodeRequestKind::Failback,
        TransitionReason::Failback,
        RequestOrigin::Health,
        runtime.status.generation(),
    ));
    wait_until(&runtime, |r| {
        let entry = &r.status.snapshot().entries[1];
        entry.selectable()
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_detach_applies_once() {
    let (runtime, _dir) = runtime_with_executor(2).await;
    let generation = runtime.status.generation();

    // Two instances detect the same failure: the second request finds the
    // node already down and plans to nothing.
    for _ in 0..2 {
        runtime.post_request(FailoverRequest::node(
            1,
            NodeRequestKind::Detach,
            TransitionReason::HealthFail,
            RequestOrigin::Health,
            generation,
        ));
    }
    wait_until(&runtime, |r| {
        r.status.snapshot().entries[1].status == BackendStatus::Down
    })
    .await;
    // Generation advanced by exactly one transition beyond the detach point.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.status.generation(), generation + 1);
}

#[tokio::test]
async fn test_promote_rejects_current_primary() {
    let (runtime, _dir) = runtime_with_executor(2).await;
    let generation = runtime.status.generation();

    runtime.post_request(FailoverRequest::node(
        0,
        NodeRequestKind::Promote,
        TransitionReason::Promote,
        RequestOrigin::Admin,
        generation,
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The request is rejected during re-validation; nothing changed.
    assert_eq!(runtime.status.generation(), generation);
    let snapshot = runtime.status.snapshot();
    assert_eq!(snapshot.primary().map(|e| e.node_id), Some(0));
}

#[tokio::test]
async fn test_admin_promote_demotes_old_primary() {
    let (runtime, _dir) = runtime_with_executor(2).await;
    let mut sync_rx = runtime.subscribe_control();

    runtime.post_request(FailoverRequest::node(
        1,
        NodeRequestKind::Promote,
        TransitionReason::Promote,
        RequestOrigin::Admin,
        runtime.status.generation(),
    ));

    wait_until(&runtime, |r| {
        let snapshot = r.status.snapshot();
        snapshot.primary().map(|e| e.node_id) == Some(1)
            && snapshot.entries[0].status == BackendStatus::Down
    })
    .await;

    // Workers are told to resynchronize their pool caches.
    let event = tokio::time::timeout(Duration::from_secs(1), sync_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ControlEvent::BackendStateSync);
}

#[test]
fn test_promotion_candidate_prefers_weight_then_lowest_id() {
    let config = test_config(3);
    let (runtime, _rx) = Runtime::new(config, None, "").unwrap();
    // Bring everything up directly through the table for this check.
    for node_id in 0..3 {
        runtime
            .status
            .apply(&pgrelay::core::status::Transition {
                node_id,
                new_status: BackendStatus::Up,
                quarantine: false,
                new_role: None,
                reason: TransitionReason::Failback,
            })
            .unwrap();
    }
    let snapshot = runtime.status.snapshot();
    // Node 1 has weight 2.0, node 2 weight 1.0.
    assert_eq!(promotion_candidate(&snapshot, 0), Some(1));
}
