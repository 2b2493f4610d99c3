// src/core/watchdog/messages.rs

//! The watchdog wire protocol: length-delimited JSON messages exchanged
//! over the static peer links.

use crate::core::RelayError;
use crate::core::failover::FailoverRequest;
use crate::core::status::Transition;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Builds the shared length-delimited framing for peer links.
pub fn wire_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(1024 * 1024)
        .new_codec()
}

/// One watchdog message. The run id identifies the sender; epochs fence
/// stale leaders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WdMessage {
    /// Link opener: identifies this node to the peer.
    Hello {
        run_id: String,
        priority: u32,
        pgrelay_port: u16,
    },
    /// Periodic liveness beacon carrying the sender's view of the cluster.
    Heartbeat {
        run_id: String,
        epoch: u64,
        leader: Option<String>,
        status_generation: u64,
    },
    /// Election: a candidate asks for a vote in an epoch.
    VoteRequest {
        candidate: String,
        epoch: u64,
        priority: u32,
    },
    /// Election: a vote granted to a candidate for an epoch.
    VoteAck { voter: String, candidate: String, epoch: u64 },
    /// A non-leader forwards a failover request for adjudication.
    ForwardRequest {
        origin: String,
        request: FailoverRequest,
    },
    /// The leader replicates applied status transitions.
    StatusDelta {
        leader: String,
        epoch: u64,
        generation: u64,
        transitions: Vec<Transition>,
    },
    /// A follower confirms it applied a delta.
    DeltaAck {
        follower: String,
        epoch: u64,
        generation: u64,
    },
}

impl WdMessage {
    pub fn encode(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
