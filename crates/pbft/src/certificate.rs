//! Per-slot vote certificates.
//!
//! A certificate collects everything a replica has seen for one slot
//! `(view, seq_no)`: the primary's pre-prepare and the prepare and commit
//! votes from peers, deduplicated by sender.

use crate::error::ProtocolError;
use palisade_messages::{Commit, PrePrepare, Prepare};
use palisade_types::Digest;
use std::collections::BTreeMap;

/// Votes collected for one `(view, seq_no)` slot.
#[derive(Debug, Clone, Default)]
pub struct Certificate {
    /// The pre-prepare binding a digest to this slot, once accepted.
    pre_prepare: Option<PrePrepare>,
    /// Prepare votes, at most one per replica.
    prepares: Vec<Prepare>,
    /// Commit votes, at most one per replica.
    commits: Vec<Commit>,
    /// Whether the local replica has emitted its prepare for this slot.
    pub sent_prepare: bool,
    /// Whether the local replica has emitted its commit for this slot.
    pub sent_commit: bool,
}

impl Certificate {
    /// The digest bound to this slot, if a pre-prepare was accepted.
    pub fn digest(&self) -> Option<Digest> {
        self.pre_prepare.as_ref().map(|pp| pp.digest)
    }

    /// The accepted pre-prepare.
    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    /// Number of prepare votes matching `digest`.
    pub fn prepare_count(&self, digest: &Digest) -> usize {
        self.prepares.iter().filter(|p| p.digest == *digest).count()
    }

    /// Number of commit votes matching `digest`.
    pub fn commit_count(&self, digest: &Digest) -> usize {
        self.commits.iter().filter(|c| c.digest == *digest).count()
    }
}

/// All certificates, keyed by `(view, seq_no)`.
///
/// Entries are created lazily on first touch and garbage-collected when
/// their sequence number falls below the low watermark or their view is
/// left behind by a view change.
#[derive(Debug, Default)]
pub struct CertificateStore {
    certs: BTreeMap<(u64, u64), Certificate>,
}

impl CertificateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or lazily create the certificate for a slot.
    pub fn get_or_create(&mut self, view: u64, seq_no: u64) -> &mut Certificate {
        self.certs.entry((view, seq_no)).or_default()
    }

    /// Get the certificate for a slot, if it exists.
    pub fn get(&self, view: u64, seq_no: u64) -> Option<&Certificate> {
        self.certs.get(&(view, seq_no))
    }

    /// Record a pre-prepare.
    ///
    /// Rejects a different digest for an already-bound slot; re-recording
    /// the same digest is a no-op.
    pub fn record_pre_prepare(&mut self, pp: PrePrepare) -> Result<(), ProtocolError> {
        let cert = self.get_or_create(pp.view, pp.seq_no);
        match &cert.pre_prepare {
            Some(existing) if existing.digest != pp.digest => {
                Err(ProtocolError::ConflictingPrePrepare {
                    view: pp.view,
                    seq_no: pp.seq_no,
                })
            }
            Some(_) => Ok(()),
            None => {
                cert.pre_prepare = Some(pp);
                Ok(())
            }
        }
    }

    /// Bind a slot unconditionally.
    ///
    /// Used when installing a new view: the assignment comes from the
    /// X set, which overrides whatever the slot held before.
    pub fn install_pre_prepare(&mut self, pp: PrePrepare) {
        let (view, seq_no) = (pp.view, pp.seq_no);
        self.get_or_create(view, seq_no).pre_prepare = Some(pp);
    }

    /// Record a prepare vote, rejecting duplicates from the same replica.
    pub fn record_prepare(&mut self, prepare: Prepare) -> Result<(), ProtocolError> {
        let cert = self.get_or_create(prepare.view, prepare.seq_no);
        if cert.prepares.iter().any(|p| p.replica == prepare.replica) {
            return Err(ProtocolError::DuplicateVote {
                kind: "prepare",
                replica: prepare.replica,
                seq_no: prepare.seq_no,
            });
        }
        cert.prepares.push(prepare);
        Ok(())
    }

    /// Record a commit vote, rejecting duplicates from the same replica.
    pub fn record_commit(&mut self, commit: Commit) -> Result<(), ProtocolError> {
        let cert = self.get_or_create(commit.view, commit.seq_no);
        if cert.commits.iter().any(|c| c.replica == commit.replica) {
            return Err(ProtocolError::DuplicateVote {
                kind: "commit",
                replica: commit.replica,
                seq_no: commit.seq_no,
            });
        }
        cert.commits.push(commit);
        Ok(())
    }

    /// Whether a pre-prepare for `digest` is bound at `(view, seq_no)`.
    pub fn pre_prepared(&self, digest: &Digest, view: u64, seq_no: u64) -> bool {
        self.get(view, seq_no)
            .and_then(Certificate::digest)
            .map(|d| d == *digest)
            .unwrap_or(false)
    }

    /// The prepared predicate: a matching pre-prepare plus `required`
    /// (`2f`) matching prepares from distinct non-primary replicas.
    pub fn prepared(&self, digest: &Digest, view: u64, seq_no: u64, required: usize) -> bool {
        self.pre_prepared(digest, view, seq_no)
            && self
                .get(view, seq_no)
                .map(|c| c.prepare_count(digest) >= required)
                .unwrap_or(false)
    }

    /// The committed-local predicate: prepared plus `required` (`2f+1`)
    /// matching commits from any replicas, the local one included.
    pub fn committed(
        &self,
        digest: &Digest,
        view: u64,
        seq_no: u64,
        required_prepares: usize,
        required_commits: usize,
    ) -> bool {
        self.prepared(digest, view, seq_no, required_prepares)
            && self
                .get(view, seq_no)
                .map(|c| c.commit_count(digest) >= required_commits)
                .unwrap_or(false)
    }

    /// Drop every certificate from a view older than `view`.
    pub fn prune_below_view(&mut self, view: u64) {
        self.certs.retain(|(v, _), _| *v >= view);
    }

    /// Drop every certificate with `seq_no ≤ through` (checkpoint GC).
    pub fn prune_through_seq(&mut self, through: u64) {
        self.certs.retain(|(_, n), _| *n > through);
    }

    /// Iterate over all `(view, seq_no) → certificate` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&(u64, u64), &Certificate)> {
        self.certs.iter()
    }

    /// Number of live certificates.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}
