use pgrelay::config::Config;
use pgrelay::core::state::Runtime;
use pgrelay::core::status::Transition;
use pgrelay::core::watchdog::messages::WdMessage;
use pgrelay::core::watchdog::state::Membership;
use pgrelay::core::watchdog::{WatchdogHandle, election};
use std::sync::Arc;
use tokio::sync::mpsc;

fn watchdog_config(num_peers: usize) -> Config {
    let mut toml = String::from(
        "port = 16432\nuse_watchdog = true\nwd_priority = 5\n[[backend]]\nhost = \"10.0.0.1\"\n",
    );
    for i in 0..num_peers {
        toml.push_str(&format!(
            "[[watchdog_peer]]\nhost = \"10.0.1.{i}\"\nwd_port = 9000\npgrelay_port = 16432\n"
        ));
    }
    let config: Config = toml::from_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

fn handle_with_peers(
    num_peers: usize,
) -> (
    Arc<WatchdogHandle>,
    Vec<mpsc::UnboundedReceiver<WdMessage>>,
    Arc<Runtime>,
) {
    let config = watchdog_config(num_peers);
    let (runtime, _rx) = Runtime::new(config.clone(), None, "").unwrap();
    let (handle, peer_rxs) = WatchdogHandle::new(&config, "aaaa");
    (handle, peer_rxs, runtime)
}

fn hello(handle: &Arc<WatchdogHandle>, runtime: &Arc<Runtime>, run_id: &str, priority: u32) {
    handle.process_message(
        WdMessage::Hello {
            run_id: run_id.to_string(),
            priority,
            pgrelay_port: 16432,
        },
        runtime,
    );
}

#[test]
fn test_two_peer_cluster_quorum_is_two() {
    let (handle, _rxs, _runtime) = handle_with_peers(2);
    assert_eq!(handle.quorum, 2);
    assert!(!handle.has_quorum());
}

#[test]
fn test_hello_identifies_peer_and_counts_towards_quorum() {
    let (handle, _rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 1);
    assert!(handle.has_quorum());
}

#[test]
fn test_election_elects_self_with_quorum_and_top_priority() {
    let (handle, mut rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 1);

    // Tick with quorum and no leader: this node (priority 5) outranks the
    // peer (priority 1), so it campaigns.
    election::tick(&handle);
    assert_eq!(handle.state.lock().membership, Membership::Candidate);
    let vote_request = rxs[0].try_recv().expect("vote request broadcast");
    assert!(matches!(vote_request, WdMessage::VoteRequest { .. }));

    // One vote plus our own reaches the quorum of 2.
    let epoch = handle.current_epoch();
    election::handle_vote_ack(&handle, "bbbb", "aaaa", epoch);
    assert!(handle.is_leader());
    assert_eq!(handle.leader().as_deref(), Some("aaaa"));
}

#[test]
fn test_vote_granted_to_higher_priority_candidate() {
    let (handle, mut rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 9);

    election::handle_vote_request(&handle, "bbbb", 1, 9);
    // The ack goes out to the candidate's link.
    let ack = rxs[0].try_recv().expect("vote ack sent");
    match ack {
        WdMessage::VoteAck { candidate, epoch, .. } => {
            assert_eq!(candidate, "bbbb");
            assert_eq!(epoch, 1);
        }
        other => panic!("expected vote ack, got {other:?}"),
    }
}

#[test]
fn test_vote_denied_to_lower_priority_candidate_when_we_can_campaign() {
    let (handle, mut rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 1);

    // Our priority 5 outranks the candidate's 1 and we have quorum, so no
    // vote is granted.
    election::handle_vote_request(&handle, "bbbb", 1, 1);
    assert!(rxs[0].try_recv().is_err());
}

#[test]
fn test_vote_not_granted_twice_for_same_epoch() {
    let (handle, mut rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 9);

    election::handle_vote_request(&handle, "bbbb", 3, 9);
    assert!(rxs[0].try_recv().is_ok());
    election::handle_vote_request(&handle, "bbbb", 3, 9);
    assert!(rxs[0].try_recv().is_err());
}

#[test]
fn test_heartbeat_adopts_newer_epoch_leader() {
    let (handle, _rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 9);

    election::observe_heartbeat(&handle, "bbbb", 7, Some("bbbb".to_string()));
    let state = handle.state.lock();
    assert_eq!(state.epoch, 7);
    assert_eq!(state.leader.as_deref(), Some("bbbb"));
    assert_eq!(state.membership, Membership::Follower);
}

#[test]
fn test_no_quorum_means_lost() {
    let (handle, _rxs, _runtime) = handle_with_peers(2);
    election::tick(&handle);
    assert_eq!(handle.state.lock().membership, Membership::Lost);
}

#[test]
fn test_stale_delta_rejected_by_epoch_fencing() {
    let (handle, _rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 9);
    election::observe_heartbeat(&handle, "bbbb", 7, Some("bbbb".to_string()));

    // A delta from a leader with an older epoch must not be applied; epochs
    // applied to any backend strictly increase.
    let generation_before = runtime.status.generation();
    handle.process_message(
        WdMessage::StatusDelta {
            leader: "cccc".to_string(),
            epoch: 3,
            generation: 99,
            transitions: Vec::<Transition>::new(),
        },
        &runtime,
    );
    assert_eq!(handle.state.lock().leader.as_deref(), Some("bbbb"));
    assert_eq!(runtime.status.generation(), generation_before);
}

#[test]
fn test_admin_stop_withdraws_from_cluster() {
    let (handle, _rxs, runtime) = handle_with_peers(2);
    hello(&handle, &runtime, "bbbb", 1);
    election::tick(&handle);
    let epoch = handle.current_epoch();
    election::handle_vote_ack(&handle, "bbbb", "aaaa", epoch);
    assert!(handle.is_leader());

    handle.set_active(false);
    assert!(!handle.is_active());
    assert!(!handle.is_leader());
    assert_eq!(handle.state.lock().membership, Membership::Lost);
}
