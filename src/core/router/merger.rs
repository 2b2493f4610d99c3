// src/core/router/merger.rs

//! The reply merger for multicast statements: waits for the terminal reply
//! (`CommandComplete` or `ErrorResponse`) from every target, reconciles
//! them, and decides what single reply the frontend sees.

use crate::core::RelayError;
use crate::core::protocol::message::{Message, tags};
use std::collections::BTreeMap;
use tracing::warn;

/// Outcome of a completed merge.
#[derive(Debug)]
pub enum MergeOutcome {
    /// All targets agreed; forward this reply once.
    Agreed(Message),
    /// At least one target errored. Forward the first error; the listed
    /// nodes completed successfully and need a rollback at their next sync
    /// point.
    Errored {
        error: Message,
        completed_nodes: Vec<usize>,
    },
}

/// Collects terminal replies from the targets of one multicast statement.
/// Replies are recorded in arrival order; reconciliation happens by
/// `CommandComplete` tag once every target has answered.
#[derive(Debug)]
pub struct ReplyMerger {
    expected: Vec<usize>,
    replies: BTreeMap<usize, Message>,
}

impl ReplyMerger {
    pub fn new(targets: Vec<usize>) -> Self {
        Self {
            expected: targets,
            replies: BTreeMap::new(),
        }
    }

    pub fn targets(&self) -> &[usize] {
        &self.expected
    }

    /// Records one target's terminal reply. Returns true once every
    /// expected target has reported.
    pub fn record(&mut self, node_id: usize, reply: Message) -> bool {
        debug_assert!(reply.is_command_boundary());
        if self.expected.contains(&node_id) {
            self.replies.insert(node_id, reply);
        } else {
            warn!("Merger received a reply from unexpected node {node_id}");
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.replies.len() == self.expected.len()
    }

    /// Reconciles the collected replies.
    pub fn finish(self) -> Result<MergeOutcome, RelayError> {
        if !self.is_complete() {
            return Err(RelayError::Internal(
                "reply merger finished before all targets reported".into(),
            ));
        }

        // First error wins; every node that completed needs rolling back.
        let first_error = self
            .replies
            .iter()
            .find(|(_, m)| m.tag == tags::ERROR_RESPONSE)
            .map(|(node, m)| (*node, m.clone()));

        if let Some((_, error)) = first_error {
            let completed_nodes = self
                .replies
                .iter()
                .filter(|(_, m)| m.tag != tags::ERROR_RESPONSE)
                .map(|(node, _)| *node)
                .collect();
            return Ok(MergeOutcome::Errored {
                error,
                completed_nodes,
            });
        }

        let mut iter = self.replies.into_iter();
        let (_, first) = iter
            .next()
            .ok_or_else(|| RelayError::Internal("reply merger had no targets".into()))?;
        let first_tag = first.command_tag().unwrap_or_default().to_string();

        for (node, reply) in iter {
            let tag = reply.command_tag().unwrap_or_default();
            if tag != first_tag {
                // Divergent command tags across backends mean the statement
                // did not behave identically; surface it rather than guess.
                warn!(
                    "Multicast replies diverged: node {node} answered '{tag}', expected '{first_tag}'"
                );
            }
        }

        Ok(MergeOutcome::Agreed(first))
    }
}
