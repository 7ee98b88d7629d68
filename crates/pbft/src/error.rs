//! Error taxonomy for the replica engine.

use palisade_core::InvariantViolation;
use palisade_types::{Digest, ReplicaId};
use thiserror::Error;

/// Why a protocol message or step was rejected.
///
/// Everything except [`ProtocolError::Invariant`] is recovered locally:
/// the offending message is dropped (or the step deferred) and the error
/// is logged. An invariant violation is surfaced to the host, which must
/// halt the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Signature verification failed.
    #[error("invalid signature on {kind} from replica {replica}")]
    InvalidSignature {
        /// Message kind.
        kind: &'static str,
        /// Claimed sender.
        replica: ReplicaId,
    },

    /// Sender id is not part of the replica set.
    #[error("message from unknown replica {0}")]
    UnknownReplica(ReplicaId),

    /// Sequence number outside the watermark window `(h, h+L]`.
    #[error("sequence number {seq_no} outside window ({low}, {high}]")]
    BadWatermarks {
        /// Offending sequence number.
        seq_no: u64,
        /// Low watermark `h`.
        low: u64,
        /// High watermark `h + L`.
        high: u64,
    },

    /// Message view does not match the local view.
    #[error("message view {got} does not match local view {local}")]
    ViewMismatch {
        /// View carried by the message.
        got: u64,
        /// Local view.
        local: u64,
    },

    /// Normal-case message received while the view change is in progress.
    #[error("view {0} is not active")]
    InactiveView(u64),

    /// Message kind does not match the sender's role in this view
    /// (pre-prepare from a backup, prepare from the primary).
    #[error("{kind} from unexpected sender {replica} in view {view}")]
    UnexpectedSender {
        /// Message kind.
        kind: &'static str,
        /// The out-of-role sender.
        replica: ReplicaId,
        /// The local view.
        view: u64,
    },

    /// Repeated prepare/commit/checkpoint vote from the same replica.
    #[error("duplicate {kind} from replica {replica} at seq {seq_no}")]
    DuplicateVote {
        /// Message kind.
        kind: &'static str,
        /// Repeating sender.
        replica: ReplicaId,
        /// Slot sequence number.
        seq_no: u64,
    },

    /// A pre-prepare for `(v, n)` with a different digest than the one
    /// already bound there.
    #[error("conflicting pre-prepare at view {view} seq {seq_no}")]
    ConflictingPrePrepare {
        /// Slot view.
        view: u64,
        /// Slot sequence number.
        seq_no: u64,
    },

    /// Cannot make progress without a request body.
    #[error("missing request {digest}")]
    MissingRequest {
        /// Digest of the missing request.
        digest: Digest,
    },

    /// The new view's base checkpoint is ahead of the local state.
    #[error("missing base checkpoint {seq_no}")]
    MissingCheckpoint {
        /// The checkpoint sequence number the replica lacks.
        seq_no: u64,
    },

    /// A NEW-VIEW failed validation against the local recomputation.
    #[error("bad new-view for view {view}: {reason}")]
    BadNewView {
        /// The proposed view.
        view: u64,
        /// Human-readable mismatch description.
        reason: &'static str,
    },

    /// A safety contradiction; irrecoverable.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Configuration rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Replica count is not of the form `3f+1` with `f ≥ 1`.
    #[error("replica count {0} is not 3f+1 with f >= 1")]
    InvalidReplicaCount(usize),

    /// Checkpoint period must be positive.
    #[error("checkpoint period must be at least 1")]
    ZeroCheckpointPeriod,
}
