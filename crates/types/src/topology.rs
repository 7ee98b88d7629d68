//! Replica set topology.

use crate::{PublicKey, ReplicaId};
use serde::{Deserialize, Serialize};

/// One entry of the replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// The replica's id, dense in `[0, N)`.
    pub replica_id: ReplicaId,
    /// Verification key for the replica's protocol signatures.
    pub public_key: PublicKey,
}

/// The fixed replica set of an ordering network.
///
/// `N = 3f+1` replicas tolerate `f` Byzantine faults. Membership is fixed
/// for the lifetime of the engine; reconfiguration happens outside it.
#[derive(Debug, Clone)]
pub struct Topology {
    local: ReplicaId,
    replicas: Vec<ReplicaInfo>,
}

impl Topology {
    /// Build a topology from an ordered replica set.
    ///
    /// Replica ids must be dense: `replicas[i].replica_id == i`.
    pub fn new(local: ReplicaId, replicas: Vec<ReplicaInfo>) -> Self {
        debug_assert!(replicas
            .iter()
            .enumerate()
            .all(|(i, r)| r.replica_id.0 == i as u64));
        Self { local, replicas }
    }

    /// The local replica's id.
    pub fn local_id(&self) -> ReplicaId {
        self.local
    }

    /// Total number of replicas, `N`.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Maximum number of tolerated Byzantine faults, `f = (N-1)/3`.
    pub fn max_faulty(&self) -> usize {
        (self.replicas.len() - 1) / 3
    }

    /// Quorum size, `2f+1`. Any two quorums intersect in a correct replica.
    pub fn quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    /// Weak certificate size, `f+1`. Contains at least one correct replica.
    pub fn weak_quorum(&self) -> usize {
        self.max_faulty() + 1
    }

    /// The primary of a view: `v mod N`.
    pub fn primary_of(&self, view: u64) -> ReplicaId {
        ReplicaId(view % self.replicas.len() as u64)
    }

    /// Whether the local replica is the primary of `view`.
    pub fn is_primary(&self, view: u64) -> bool {
        self.primary_of(view) == self.local
    }

    /// Look up a replica's public key.
    pub fn public_key(&self, replica_id: ReplicaId) -> Option<&PublicKey> {
        self.replicas
            .get(replica_id.0 as usize)
            .map(|r| &r.public_key)
    }

    /// Whether an id belongs to the replica set.
    pub fn is_member(&self, replica_id: ReplicaId) -> bool {
        (replica_id.0 as usize) < self.replicas.len()
    }

    /// Iterate over all replica ids.
    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.replicas.len() as u64).map(ReplicaId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn topology(n: usize) -> Topology {
        let replicas = (0..n)
            .map(|i| ReplicaInfo {
                replica_id: ReplicaId(i as u64),
                public_key: KeyPair::from_seed(&[i as u8; 32]).public_key(),
            })
            .collect();
        Topology::new(ReplicaId(0), replicas)
    }

    #[test]
    fn test_quorum_sizes() {
        let t = topology(4);
        assert_eq!(t.max_faulty(), 1);
        assert_eq!(t.quorum(), 3);
        assert_eq!(t.weak_quorum(), 2);

        let t = topology(7);
        assert_eq!(t.max_faulty(), 2);
        assert_eq!(t.quorum(), 5);
        assert_eq!(t.weak_quorum(), 3);
    }

    #[test]
    fn test_primary_rotation() {
        let t = topology(4);
        assert_eq!(t.primary_of(0), ReplicaId(0));
        assert_eq!(t.primary_of(1), ReplicaId(1));
        assert_eq!(t.primary_of(4), ReplicaId(0));
        assert!(t.is_primary(0));
        assert!(!t.is_primary(1));
    }

    #[test]
    fn test_membership() {
        let t = topology(4);
        assert!(t.is_member(ReplicaId(3)));
        assert!(!t.is_member(ReplicaId(4)));
        assert!(t.public_key(ReplicaId(4)).is_none());
    }
}
