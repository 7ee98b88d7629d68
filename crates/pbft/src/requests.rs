//! Request pool.
//!
//! Requests are content-addressed by digest. `outstanding` tracks those
//! received but not yet delivered; it drives the request timer and the
//! primary's re-proposal after a view change.

use palisade_types::{Digest, Request};
use std::collections::{BTreeMap, BTreeSet};

/// Pending and delivered client requests.
#[derive(Debug, Default)]
pub struct RequestStore {
    /// Every request body we hold, keyed by digest.
    requests: BTreeMap<Digest, Request>,
    /// Digests received but not yet delivered.
    outstanding: BTreeSet<Digest>,
    /// Delivered digests by sequence number, kept until checkpoint GC.
    delivered: BTreeMap<u64, Digest>,
}

impl RequestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request, returning its digest and whether it was new.
    ///
    /// A request that was already delivered is not re-added to the
    /// outstanding set.
    pub fn insert(&mut self, request: Request) -> (Digest, bool) {
        let digest = request.digest();
        let is_new = !self.requests.contains_key(&digest);
        if is_new {
            self.requests.insert(digest, request);
        }
        if is_new && !self.delivered.values().any(|d| *d == digest) {
            self.outstanding.insert(digest);
        }
        (digest, is_new)
    }

    /// Look up a request body by digest.
    pub fn lookup(&self, digest: &Digest) -> Option<&Request> {
        self.requests.get(digest)
    }

    /// Whether a digest is still awaiting delivery.
    pub fn is_outstanding(&self, digest: &Digest) -> bool {
        self.outstanding.contains(digest)
    }

    /// Whether nothing is awaiting delivery.
    pub fn outstanding_is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Digests awaiting delivery, in digest order (deterministic).
    pub fn outstanding_digests(&self) -> Vec<Digest> {
        self.outstanding.iter().copied().collect()
    }

    /// Mark a request delivered at `seq_no`.
    pub fn mark_delivered(&mut self, digest: Digest, seq_no: u64) {
        self.outstanding.remove(&digest);
        self.delivered.insert(seq_no, digest);
    }

    /// The digest delivered at `seq_no`, if any.
    pub fn delivered_at(&self, seq_no: u64) -> Option<&Digest> {
        self.delivered.get(&seq_no)
    }

    /// Evict requests delivered at or below the stable checkpoint.
    pub fn prune_delivered_through(&mut self, stable: u64) {
        let evicted: Vec<u64> = self
            .delivered
            .range(..=stable)
            .map(|(&n, _)| n)
            .collect();
        for n in evicted {
            if let Some(digest) = self.delivered.remove(&n) {
                self.requests.remove(&digest);
            }
        }
    }

    /// Number of request bodies held.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the pool holds no request bodies.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
