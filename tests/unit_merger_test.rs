use pgrelay::core::protocol::message::Message;
use pgrelay::core::router::merger::{MergeOutcome, ReplyMerger};

#[test]
fn test_agreed_replies_merge_to_one() {
    let mut merger = ReplyMerger::new(vec![0, 1, 2]);
    assert!(!merger.record(0, Message::command_complete("SET")));
    assert!(!merger.record(1, Message::command_complete("SET")));
    assert!(merger.record(2, Message::command_complete("SET")));

    match merger.finish().unwrap() {
        MergeOutcome::Agreed(reply) => {
            assert_eq!(reply.command_tag().unwrap(), "SET");
        }
        other => panic!("expected agreement, got {other:?}"),
    }
}

#[test]
fn test_first_error_wins_and_reports_completed_nodes() {
    let mut merger = ReplyMerger::new(vec![0, 1, 2]);
    merger.record(0, Message::command_complete("SET"));
    merger.record(1, Message::error_response("ERROR", "42704", "unrecognized parameter"));
    merger.record(2, Message::command_complete("SET"));

    match merger.finish().unwrap() {
        MergeOutcome::Errored {
            error,
            completed_nodes,
        } => {
            let (_, code, _) = error.error_fields().unwrap();
            assert_eq!(code, "42704");
            assert_eq!(completed_nodes, vec![0, 2]);
        }
        other => panic!("expected an error outcome, got {other:?}"),
    }
}

#[test]
fn test_incomplete_merge_is_rejected() {
    let mut merger = ReplyMerger::new(vec![0, 1]);
    merger.record(0, Message::command_complete("SET"));
    assert!(merger.finish().is_err());
}

#[test]
fn test_unexpected_node_is_ignored() {
    let mut merger = ReplyMerger::new(vec![0]);
    merger.record(9, Message::command_complete("SET"));
    assert!(!merger.is_complete());
    assert!(merger.record(0, Message::command_complete("SET")));
}
