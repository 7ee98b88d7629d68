//! Checkpoint evidence and watermark bookkeeping.

use palisade_messages::CheckpointEntry;
use palisade_types::{Digest, ReplicaId};
use std::collections::BTreeMap;

/// Local state digests and remote checkpoint votes.
///
/// A checkpoint `(n, d)` becomes **stable** once `2f+1` replicas have
/// attested the same digest at `n`; the caller then advances the low
/// watermark to `n` and truncates the log.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    /// Our own state digests, one per checkpoint boundary.
    local: BTreeMap<u64, Digest>,
    /// Remote attestations: seq_no → replica → digest.
    remote: BTreeMap<u64, BTreeMap<ReplicaId, Digest>>,
}

impl CheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the locally computed state digest at a boundary.
    pub fn record_local(&mut self, seq_no: u64, digest: Digest) {
        self.local.insert(seq_no, digest);
    }

    /// The local state digest at `seq_no`, if computed.
    pub fn local(&self, seq_no: u64) -> Option<&Digest> {
        self.local.get(&seq_no)
    }

    /// All retained local checkpoints, for C-set construction.
    pub fn local_entries(&self) -> Vec<CheckpointEntry> {
        self.local
            .iter()
            .map(|(&seq_no, &state_digest)| CheckpointEntry {
                seq_no,
                state_digest,
            })
            .collect()
    }

    /// Record a remote attestation. Returns `false` if this replica
    /// already attested this sequence number (duplicates are ignored).
    pub fn record_remote(&mut self, seq_no: u64, replica: ReplicaId, digest: Digest) -> bool {
        let votes = self.remote.entry(seq_no).or_default();
        if votes.contains_key(&replica) {
            return false;
        }
        votes.insert(replica, digest);
        true
    }

    /// The digest with at least `quorum` matching attestations at
    /// `seq_no`, if any.
    pub fn stable_digest(&self, seq_no: u64, quorum: usize) -> Option<Digest> {
        let votes = self.remote.get(&seq_no)?;
        let mut counts: BTreeMap<Digest, usize> = BTreeMap::new();
        for digest in votes.values() {
            *counts.entry(*digest).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(digest, _)| digest)
    }

    /// Garbage-collect after the watermark moved to `stable`.
    ///
    /// The stable checkpoint itself stays: it is the base of the C set.
    pub fn prune(&mut self, stable: u64) {
        self.local.retain(|&n, _| n >= stable);
        self.remote.retain(|&n, _| n > stable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stability_needs_quorum_of_matching_digests() {
        let mut store = CheckpointStore::new();
        let d = Digest::hash(b"s10");
        let other = Digest::hash(b"bogus");

        assert!(store.record_remote(10, ReplicaId(0), d));
        assert!(store.record_remote(10, ReplicaId(1), d));
        assert!(store.record_remote(10, ReplicaId(2), other));
        assert_eq!(store.stable_digest(10, 3), None);

        assert!(store.record_remote(10, ReplicaId(3), d));
        assert_eq!(store.stable_digest(10, 3), Some(d));
    }

    #[test]
    fn test_duplicate_attestations_ignored() {
        let mut store = CheckpointStore::new();
        let d = Digest::hash(b"s10");

        assert!(store.record_remote(10, ReplicaId(1), d));
        assert!(!store.record_remote(10, ReplicaId(1), d));
        assert!(!store.record_remote(10, ReplicaId(1), Digest::hash(b"flip")));
        assert_eq!(store.stable_digest(10, 2), None);
    }

    #[test]
    fn test_prune_keeps_stable_base() {
        let mut store = CheckpointStore::new();
        store.record_local(10, Digest::hash(b"s10"));
        store.record_local(20, Digest::hash(b"s20"));
        store.record_remote(10, ReplicaId(1), Digest::hash(b"s10"));
        store.record_remote(20, ReplicaId(1), Digest::hash(b"s20"));

        store.prune(20);
        assert!(store.local(10).is_none());
        assert!(store.local(20).is_some());
        assert_eq!(store.stable_digest(20, 1), None);
        assert_eq!(store.local_entries().len(), 1);
    }
}
