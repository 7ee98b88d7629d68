//! Event types for the deterministic state machine.

use palisade_messages::ConsensusMessage;
use palisade_types::{Digest, Request};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This preserves causality: internal events (consequences of processing
/// an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the replica itself.
    Timer = 1,

    /// Network events: inputs from other replicas.
    Network = 2,

    /// Client events: inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The per-request timeout expired without progress.
    RequestTimer,

    /// The new-view backoff timeout expired while view-changing.
    NewViewTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a protocol message from a peer.
    ///
    /// Sender identity comes from the signed message itself, not from the
    /// transport.
    MessageReceived {
        /// The decoded protocol message.
        message: ConsensusMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Host callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The host computed the application state digest at a checkpoint
    /// boundary.
    ///
    /// Callback for [`Action::ComputeStateDigest`](crate::Action).
    StateDigest {
        /// The checkpoint sequence number.
        seq_no: u64,
        /// Digest of the application state after delivering `seq_no`.
        digest: Digest,
    },

    /// The host finished installing a fetched base checkpoint.
    ///
    /// Callback for [`Action::FetchCheckpoint`](crate::Action): the
    /// application state now matches `digest` at `seq_no`.
    CheckpointInstalled {
        /// The installed checkpoint sequence number.
        seq_no: u64,
        /// The installed state digest.
        digest: Digest,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a request for ordering.
    RequestSubmitted {
        /// The signed client request.
        request: Request,
    },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::StateDigest { .. } | Event::CheckpointInstalled { .. } => {
                EventPriority::Internal
            }
            Event::RequestTimer | Event::NewViewTimer => EventPriority::Timer,
            Event::MessageReceived { .. } => EventPriority::Network,
            Event::RequestSubmitted { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for logging and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::RequestTimer => "RequestTimer",
            Event::NewViewTimer => "NewViewTimer",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::StateDigest { .. } => "StateDigest",
            Event::CheckpointInstalled { .. } => "CheckpointInstalled",
            Event::RequestSubmitted { .. } => "RequestSubmitted",
        }
    }
}
