//! Action types for the deterministic state machine.

use crate::TimerId;
use palisade_messages::ConsensusMessage;
use palisade_types::{Digest, ReplicaId, Request};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do. The host
/// executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every replica.
    ///
    /// With `include_self` the host loops the message back to the sender,
    /// so a replica's own votes travel the same counting path as its
    /// peers' votes.
    Broadcast {
        /// The message to send.
        message: ConsensusMessage,
        /// Whether to also deliver the message to the local replica.
        include_self: bool,
    },

    /// Send a message to a single replica.
    Unicast {
        /// The message to send.
        message: ConsensusMessage,
        /// The destination replica.
        to: ReplicaId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    ///
    /// Setting a timer that is already armed re-arms it.
    SetTimer {
        /// Which timer to arm.
        id: TimerId,
        /// Time until it fires.
        duration: Duration,
    },

    /// Cancel a previously set timer.
    CancelTimer {
        /// Which timer to disarm.
        id: TimerId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Consumer
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver a committed request to the application.
    ///
    /// Emitted exactly once per sequence number, in strictly ascending
    /// order with no gaps.
    Deliver {
        /// The request's position in the total order.
        seq_no: u64,
        /// The committed request.
        request: Request,
    },

    /// Ask the host for the application state digest after `seq_no`.
    ///
    /// Emitted at checkpoint boundaries; answered with
    /// [`Event::StateDigest`](crate::Event).
    ComputeStateDigest {
        /// The checkpoint sequence number.
        seq_no: u64,
    },

    /// Notify the application that the replica entered a new view.
    ViewChanged {
        /// The now-active view.
        view: u64,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Missing-data hooks
    // ═══════════════════════════════════════════════════════════════════════
    /// Fetch a request body the replica does not hold.
    ///
    /// The host resolves this from peers and feeds the request back as
    /// a normal inbound message.
    FetchRequest {
        /// Digest of the missing request.
        digest: Digest,
    },

    /// Fetch the application state at a checkpoint the replica is missing.
    ///
    /// Answered with [`Event::CheckpointInstalled`](crate::Event) once
    /// the host has transferred state.
    FetchCheckpoint {
        /// The checkpoint sequence number to transfer to.
        seq_no: u64,
    },
}

impl Action {
    /// Get the action type name for logging and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Unicast { .. } => "Unicast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::Deliver { .. } => "Deliver",
            Action::ComputeStateDigest { .. } => "ComputeStateDigest",
            Action::ViewChanged { .. } => "ViewChanged",
            Action::FetchRequest { .. } => "FetchRequest",
            Action::FetchCheckpoint { .. } => "FetchCheckpoint",
        }
    }
}
