//! Normal-case protocol messages: pre-prepare, prepare, commit, checkpoint.

use palisade_types::{
    checkpoint_message, vote_message, Digest, KeyPair, PublicKey, ReplicaId, Signature,
    DOMAIN_COMMIT, DOMAIN_PREPARE, DOMAIN_PRE_PREPARE,
};
use serde::{Deserialize, Serialize};

/// Primary's ordering proposal: binds digest `d` to slot `(v, n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    /// View in which the slot is assigned.
    pub view: u64,
    /// Assigned sequence number.
    pub seq_no: u64,
    /// Digest of the ordered request (`Digest::NULL` for a null request).
    pub digest: Digest,
    /// The proposing primary.
    pub replica: ReplicaId,
    /// Primary's signature.
    pub signature: Signature,
}

impl PrePrepare {
    /// Create and sign a pre-prepare.
    pub fn new(view: u64, seq_no: u64, digest: Digest, replica: ReplicaId, key: &KeyPair) -> Self {
        let signature = key.sign(&vote_message(
            DOMAIN_PRE_PREPARE,
            view,
            seq_no,
            &digest,
            replica,
        ));
        Self {
            view,
            seq_no,
            digest,
            replica,
            signature,
        }
    }

    /// Verify the primary's signature.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &vote_message(
                DOMAIN_PRE_PREPARE,
                self.view,
                self.seq_no,
                &self.digest,
                self.replica,
            ),
            &self.signature,
        )
    }
}

/// Backup's echo of a pre-prepare it accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    /// View of the slot.
    pub view: u64,
    /// Sequence number of the slot.
    pub seq_no: u64,
    /// Digest being prepared.
    pub digest: Digest,
    /// The preparing backup.
    pub replica: ReplicaId,
    /// Backup's signature.
    pub signature: Signature,
}

impl Prepare {
    /// Create and sign a prepare.
    pub fn new(view: u64, seq_no: u64, digest: Digest, replica: ReplicaId, key: &KeyPair) -> Self {
        let signature = key.sign(&vote_message(DOMAIN_PREPARE, view, seq_no, &digest, replica));
        Self {
            view,
            seq_no,
            digest,
            replica,
            signature,
        }
    }

    /// Verify the sender's signature.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &vote_message(
                DOMAIN_PREPARE,
                self.view,
                self.seq_no,
                &self.digest,
                self.replica,
            ),
            &self.signature,
        )
    }
}

/// Vote that a replica holds a prepared certificate for `(v, n, d)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// View of the slot.
    pub view: u64,
    /// Sequence number of the slot.
    pub seq_no: u64,
    /// Digest being committed.
    pub digest: Digest,
    /// The committing replica.
    pub replica: ReplicaId,
    /// Sender's signature.
    pub signature: Signature,
}

impl Commit {
    /// Create and sign a commit.
    pub fn new(view: u64, seq_no: u64, digest: Digest, replica: ReplicaId, key: &KeyPair) -> Self {
        let signature = key.sign(&vote_message(DOMAIN_COMMIT, view, seq_no, &digest, replica));
        Self {
            view,
            seq_no,
            digest,
            replica,
            signature,
        }
    }

    /// Verify the sender's signature.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &vote_message(
                DOMAIN_COMMIT,
                self.view,
                self.seq_no,
                &self.digest,
                self.replica,
            ),
            &self.signature,
        )
    }
}

/// Attestation of the application state digest at a checkpoint boundary.
///
/// Checkpoints carry no view: stability evidence accumulates across view
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence number of the snapshot (a multiple of the checkpoint period).
    pub seq_no: u64,
    /// Digest of the application state after delivering `seq_no`.
    pub state_digest: Digest,
    /// The attesting replica.
    pub replica: ReplicaId,
    /// Sender's signature.
    pub signature: Signature,
}

impl Checkpoint {
    /// Create and sign a checkpoint attestation.
    pub fn new(seq_no: u64, state_digest: Digest, replica: ReplicaId, key: &KeyPair) -> Self {
        let signature = key.sign(&checkpoint_message(seq_no, &state_digest, replica));
        Self {
            seq_no,
            state_digest,
            replica,
            signature,
        }
    }

    /// Verify the sender's signature.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &checkpoint_message(self.seq_no, &self.state_digest, self.replica),
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprepare_sign_verify() {
        let key = KeyPair::from_seed(&[1u8; 32]);
        let pp = PrePrepare::new(0, 1, Digest::hash(b"req"), ReplicaId(0), &key);
        assert!(pp.verify(&key.public_key()));

        let other = KeyPair::from_seed(&[2u8; 32]);
        assert!(!pp.verify(&other.public_key()));
    }

    #[test]
    fn test_prepare_not_valid_as_commit() {
        let key = KeyPair::from_seed(&[1u8; 32]);
        let d = Digest::hash(b"req");
        let prepare = Prepare::new(0, 1, d, ReplicaId(2), &key);

        // Graft the prepare signature onto a commit with identical fields.
        let forged = Commit {
            view: 0,
            seq_no: 1,
            digest: d,
            replica: ReplicaId(2),
            signature: prepare.signature,
        };
        assert!(!forged.verify(&key.public_key()));
    }

    #[test]
    fn test_checkpoint_sign_verify() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        let cp = Checkpoint::new(10, Digest::hash(b"state"), ReplicaId(1), &key);
        assert!(cp.verify(&key.public_key()));
    }
}
