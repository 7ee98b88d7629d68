//! Domain-separated signing payloads.
//!
//! Every protocol signature covers a domain tag followed by the message
//! fields, so a signature over one message kind can never be replayed as
//! another.

use crate::{Digest, ReplicaId};

/// Domain tag for pre-prepare signatures.
pub const DOMAIN_PRE_PREPARE: &[u8] = b"preprepare:";
/// Domain tag for prepare signatures.
pub const DOMAIN_PREPARE: &[u8] = b"prepare:";
/// Domain tag for commit signatures.
pub const DOMAIN_COMMIT: &[u8] = b"commit:";
/// Domain tag for checkpoint signatures.
pub const DOMAIN_CHECKPOINT: &[u8] = b"checkpoint:";
/// Domain tag for view-change signatures.
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"viewchange:";
/// Domain tag for new-view signatures.
pub const DOMAIN_NEW_VIEW: &[u8] = b"newview:";

/// Signing payload for the three normal-case vote messages.
///
/// Pre-prepare, prepare and commit all bind `(view, seq_no, digest)` plus
/// the sender; only the domain tag differs.
pub fn vote_message(
    domain: &[u8],
    view: u64,
    seq_no: u64,
    digest: &Digest,
    replica: ReplicaId,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(domain.len() + 56);
    message.extend_from_slice(domain);
    message.extend_from_slice(&view.to_le_bytes());
    message.extend_from_slice(&seq_no.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message.extend_from_slice(&replica.0.to_le_bytes());
    message
}

/// Signing payload for checkpoint messages.
pub fn checkpoint_message(seq_no: u64, state_digest: &Digest, replica: ReplicaId) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_CHECKPOINT.len() + 48);
    message.extend_from_slice(DOMAIN_CHECKPOINT);
    message.extend_from_slice(&seq_no.to_le_bytes());
    message.extend_from_slice(state_digest.as_bytes());
    message.extend_from_slice(&replica.0.to_le_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains_disambiguate() {
        let d = Digest::hash(b"req");
        let prepare = vote_message(DOMAIN_PREPARE, 1, 2, &d, ReplicaId(3));
        let commit = vote_message(DOMAIN_COMMIT, 1, 2, &d, ReplicaId(3));
        assert_ne!(prepare, commit);
    }

    #[test]
    fn test_fields_bound() {
        let d = Digest::hash(b"req");
        let a = vote_message(DOMAIN_PREPARE, 1, 2, &d, ReplicaId(3));
        let b = vote_message(DOMAIN_PREPARE, 1, 3, &d, ReplicaId(3));
        assert_ne!(a, b);
    }
}
