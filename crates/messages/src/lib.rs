//! Wire messages for the Palisade consensus protocol.
//!
//! All protocol traffic is a single tagged union, [`ConsensusMessage`],
//! with one variant per message kind, so dispatch at the engine is total
//! and exhaustive. Every message except the client [`Request`] is signed
//! by its sending replica over a domain-separated payload.

#![warn(missing_docs)]

mod codec;
mod protocol;
mod view_change;

pub use codec::{decode_message, encode_message, CodecError, WIRE_VERSION};
pub use protocol::{Checkpoint, Commit, PrePrepare, Prepare};
pub use view_change::{CheckpointEntry, NewView, PqEntry, ViewChange};

use palisade_types::{ReplicaId, Request};
use serde::{Deserialize, Serialize};

/// The protocol message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A client request (signed by the client, relayed between replicas).
    Request(Request),
    /// Primary's ordering proposal.
    PrePrepare(PrePrepare),
    /// Backup's echo of an accepted pre-prepare.
    Prepare(Prepare),
    /// Vote that a prepared certificate is held.
    Commit(Commit),
    /// Application state attestation at a checkpoint boundary.
    Checkpoint(Checkpoint),
    /// Vote to enter a new view.
    ViewChange(ViewChange),
    /// New primary's view installation proposal.
    NewView(NewView),
}

impl ConsensusMessage {
    /// The sending replica, if the message kind carries one.
    ///
    /// Client requests are not sent by a replica.
    pub fn sender(&self) -> Option<ReplicaId> {
        match self {
            ConsensusMessage::Request(_) => None,
            ConsensusMessage::PrePrepare(m) => Some(m.replica),
            ConsensusMessage::Prepare(m) => Some(m.replica),
            ConsensusMessage::Commit(m) => Some(m.replica),
            ConsensusMessage::Checkpoint(m) => Some(m.replica),
            ConsensusMessage::ViewChange(m) => Some(m.replica),
            ConsensusMessage::NewView(m) => Some(m.replica),
        }
    }

    /// Get the message type name for logging and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::Request(_) => "Request",
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Checkpoint(_) => "Checkpoint",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NewView(_) => "NewView",
        }
    }
}
