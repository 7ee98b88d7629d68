//! View-change protocol messages and their evidence sets.

use palisade_types::{
    Digest, KeyPair, PublicKey, ReplicaId, Signature, DOMAIN_NEW_VIEW, DOMAIN_VIEW_CHANGE,
};
use serde::{Deserialize, Serialize};

/// One entry of a P or Q set: `(n, d, v)`.
///
/// In a P set: the sender held a prepared certificate for digest `d` at
/// sequence `seq_no` in view `view`. In a Q set: the sender pre-prepared
/// `d` at `seq_no` in `view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqEntry {
    /// Sequence number of the evidence.
    pub seq_no: u64,
    /// Request digest.
    pub digest: Digest,
    /// The view in which the certificate was formed.
    pub view: u64,
}

/// One entry of a C set: a stable checkpoint the sender holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Checkpoint sequence number.
    pub seq_no: u64,
    /// Application state digest at that sequence number.
    pub state_digest: Digest,
}

/// A replica's vote to move to view `view`, carrying its protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// The view the sender wants to enter.
    pub view: u64,
    /// The sender's low watermark (last stable checkpoint).
    pub h: u64,
    /// Stable checkpoints held, `h ≤ n ≤ h+L`.
    pub c_set: Vec<CheckpointEntry>,
    /// Prepared certificates, one entry per sequence number.
    pub p_set: Vec<PqEntry>,
    /// Pre-prepared slots, one entry per `(digest, seq_no)`.
    pub q_set: Vec<PqEntry>,
    /// The voting replica.
    pub replica: ReplicaId,
    /// Sender's signature over all fields above.
    pub signature: Signature,
}

impl ViewChange {
    /// Create and sign a view-change vote.
    ///
    /// The evidence sets are sorted into canonical order before signing so
    /// that equal evidence always produces equal messages.
    pub fn new(
        view: u64,
        h: u64,
        mut c_set: Vec<CheckpointEntry>,
        mut p_set: Vec<PqEntry>,
        mut q_set: Vec<PqEntry>,
        replica: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        c_set.sort_by_key(|c| (c.seq_no, c.state_digest));
        p_set.sort_by_key(|p| (p.seq_no, p.digest, p.view));
        q_set.sort_by_key(|q| (q.seq_no, q.digest, q.view));
        let signature = key.sign(&Self::signing_bytes(
            view, h, &c_set, &p_set, &q_set, replica,
        ));
        Self {
            view,
            h,
            c_set,
            p_set,
            q_set,
            replica,
            signature,
        }
    }

    /// Verify the sender's signature.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &Self::signing_bytes(
                self.view,
                self.h,
                &self.c_set,
                &self.p_set,
                &self.q_set,
                self.replica,
            ),
            &self.signature,
        )
    }

    fn signing_bytes(
        view: u64,
        h: u64,
        c_set: &[CheckpointEntry],
        p_set: &[PqEntry],
        q_set: &[PqEntry],
        replica: ReplicaId,
    ) -> Vec<u8> {
        let mut message = Vec::with_capacity(
            DOMAIN_VIEW_CHANGE.len() + 24 + c_set.len() * 40 + (p_set.len() + q_set.len()) * 48,
        );
        message.extend_from_slice(DOMAIN_VIEW_CHANGE);
        message.extend_from_slice(&view.to_le_bytes());
        message.extend_from_slice(&h.to_le_bytes());
        for c in c_set {
            message.extend_from_slice(&c.seq_no.to_le_bytes());
            message.extend_from_slice(c.state_digest.as_bytes());
        }
        for set in [p_set, q_set] {
            message.extend_from_slice(&(set.len() as u64).to_le_bytes());
            for e in set {
                message.extend_from_slice(&e.seq_no.to_le_bytes());
                message.extend_from_slice(e.digest.as_bytes());
                message.extend_from_slice(&e.view.to_le_bytes());
            }
        }
        message.extend_from_slice(&replica.0.to_le_bytes());
        message
    }
}

/// The new primary's proposal for entering `view`.
///
/// `v_set` justifies the change with `2f+1` view-change votes; `x_set`
/// assigns a digest (or `Digest::NULL`) to every sequence number in
/// `(cp, cp+L]` that still needs one, sorted by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    /// The view being entered.
    pub view: u64,
    /// The `2f+1` view-change votes justifying the new view.
    pub v_set: Vec<ViewChange>,
    /// Sequence-number assignments `(n, d)`, ascending in `n`.
    pub x_set: Vec<(u64, Digest)>,
    /// The new primary.
    pub replica: ReplicaId,
    /// Primary's signature over view, assignments and sender.
    pub signature: Signature,
}

impl NewView {
    /// Create and sign a new-view message.
    pub fn new(
        view: u64,
        v_set: Vec<ViewChange>,
        mut x_set: Vec<(u64, Digest)>,
        replica: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        x_set.sort_by_key(|(n, _)| *n);
        let signature = key.sign(&Self::signing_bytes(view, &x_set, replica));
        Self {
            view,
            v_set,
            x_set,
            replica,
            signature,
        }
    }

    /// Verify the primary's signature. The carried view-change votes are
    /// verified individually by the receiver.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &Self::signing_bytes(self.view, &self.x_set, self.replica),
            &self.signature,
        )
    }

    fn signing_bytes(view: u64, x_set: &[(u64, Digest)], replica: ReplicaId) -> Vec<u8> {
        let mut message = Vec::with_capacity(DOMAIN_NEW_VIEW.len() + 16 + x_set.len() * 40);
        message.extend_from_slice(DOMAIN_NEW_VIEW);
        message.extend_from_slice(&view.to_le_bytes());
        for (n, d) in x_set {
            message.extend_from_slice(&n.to_le_bytes());
            message.extend_from_slice(d.as_bytes());
        }
        message.extend_from_slice(&replica.0.to_le_bytes());
        message
    }
}
