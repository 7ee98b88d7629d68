//! PBFT replica state machine.
//!
//! This module implements the normal-case three-phase protocol
//! (pre-prepare / prepare / commit), ordered delivery, and checkpoint
//! garbage collection as a synchronous, event-driven model. The
//! view-change protocol lives in [`crate::view_change`] as a second
//! `impl` block on the same state.

use palisade_core::{Action, Event, InvariantViolation, StateMachine, TimerId};
use palisade_messages::{
    Checkpoint, Commit, ConsensusMessage, NewView, PqEntry, PrePrepare, Prepare, ViewChange,
};
use palisade_types::{Digest, KeyPair, ReplicaId, Request, Topology};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::certificate::CertificateStore;
use crate::checkpoint::CheckpointStore;
use crate::config::PbftConfig;
use crate::error::{ConfigError, ProtocolError};
use crate::requests::RequestStore;

/// The well-known state digest at sequence number zero.
///
/// Every replica seeds its checkpoint store with `(0, genesis)` so the
/// first view change has a base checkpoint to select.
pub fn genesis_digest() -> Digest {
    Digest::hash(b"palisade-genesis")
}

/// PBFT replica state machine.
///
/// Totally orders client requests across `N = 3f+1` replicas while
/// tolerating up to `f` Byzantine faults. One instance runs per replica;
/// all I/O is performed by the host via returned [`Action`]s.
///
/// # State Machine Flow
///
/// 1. **Request** → primary assigns a sequence number, broadcasts pre-prepare
/// 2. **Pre-prepare** → backups validate and broadcast prepare
/// 3. **Prepare × 2f** → replica holds a prepared certificate, broadcasts commit
/// 4. **Commit × 2f+1** → committed-local; delivery in sequence order
/// 5. **Silence** → request timer fires, view change elects the next primary
pub struct PbftState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    /// This replica's id.
    pub(crate) id: ReplicaId,

    /// Signing key for protocol messages.
    pub(crate) signing_key: KeyPair,

    /// The fixed replica set.
    pub(crate) topology: Arc<Topology>,

    /// Engine configuration.
    pub(crate) config: PbftConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol State
    // ═══════════════════════════════════════════════════════════════════════
    /// Current view. The primary is `view mod N`.
    pub(crate) view: u64,

    /// False while a view change is in progress.
    pub(crate) active_view: bool,

    /// Highest sequence number assigned or adopted.
    pub(crate) seq_no: u64,

    /// Low watermark `h`: the last stable checkpoint.
    pub(crate) low_watermark: u64,

    /// Highest sequence number delivered to the consumer.
    pub(crate) last_exec: u64,

    // ═══════════════════════════════════════════════════════════════════════
    // Stores
    // ═══════════════════════════════════════════════════════════════════════
    /// Vote certificates per `(view, seq_no)`.
    pub(crate) certs: CertificateStore,

    /// Checkpoint evidence.
    pub(crate) checkpoints: CheckpointStore,

    /// Request pool.
    pub(crate) requests: RequestStore,

    // ═══════════════════════════════════════════════════════════════════════
    // View-Change Evidence
    // ═══════════════════════════════════════════════════════════════════════
    /// P set: per sequence number, the latest prepared certificate.
    pub(crate) pset: BTreeMap<u64, PqEntry>,

    /// Q set: per `(digest, seq_no)`, the latest pre-prepared slot.
    pub(crate) qset: BTreeMap<(Digest, u64), PqEntry>,

    /// Received VIEW-CHANGE messages per `(view, sender)`.
    pub(crate) view_change_store: BTreeMap<(u64, ReplicaId), ViewChange>,

    /// Received NEW-VIEW messages per view.
    pub(crate) new_view_store: BTreeMap<u64, NewView>,

    // ═══════════════════════════════════════════════════════════════════════
    // Execution Queue
    // ═══════════════════════════════════════════════════════════════════════
    /// Committed slots awaiting in-order delivery.
    pub(crate) pending_execution: BTreeMap<u64, Digest>,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Whether the request timer is armed.
    pub(crate) request_timer_armed: bool,

    /// Next new-view timeout; doubled on each arming.
    pub(crate) last_new_view_timeout: Duration,

    /// Checkpoint currently being fetched via the state-transfer hook.
    pub(crate) fetching_checkpoint: Option<u64>,

    /// Current time (set by the host before each handle call).
    pub(crate) now: Duration,
}

impl std::fmt::Debug for PbftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbftState")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("active_view", &self.active_view)
            .field("seq_no", &self.seq_no)
            .field("low_watermark", &self.low_watermark)
            .field("last_exec", &self.last_exec)
            .field("certs", &self.certs.len())
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl PbftState {
    /// Create a new replica state machine.
    ///
    /// Fails if the configuration is inconsistent with the topology
    /// (`N` not of the form `3f+1`, zero checkpoint period).
    pub fn new(
        signing_key: KeyPair,
        topology: Arc<Topology>,
        config: PbftConfig,
    ) -> Result<Self, ConfigError> {
        config.validate(topology.replica_count())?;
        let last_new_view_timeout = config.new_view_timeout;
        let mut checkpoints = CheckpointStore::new();
        checkpoints.record_local(0, genesis_digest());
        Ok(Self {
            id: topology.local_id(),
            signing_key,
            topology,
            config,
            view: 0,
            active_view: true,
            seq_no: 0,
            low_watermark: 0,
            last_exec: 0,
            certs: CertificateStore::new(),
            checkpoints,
            requests: RequestStore::new(),
            pset: BTreeMap::new(),
            qset: BTreeMap::new(),
            view_change_store: BTreeMap::new(),
            new_view_store: BTreeMap::new(),
            pending_execution: BTreeMap::new(),
            request_timer_armed: false,
            last_new_view_timeout,
            fetching_checkpoint: None,
            now: Duration::ZERO,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The engine configuration.
    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    /// The current view.
    pub fn view(&self) -> u64 {
        self.view
    }

    /// Whether the view is active (no view change in progress).
    pub fn is_active(&self) -> bool {
        self.active_view
    }

    /// The low watermark `h`.
    pub fn low_watermark(&self) -> u64 {
        self.low_watermark
    }

    /// The highest delivered sequence number.
    pub fn last_exec(&self) -> u64 {
        self.last_exec
    }

    /// The highest assigned or adopted sequence number.
    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    /// The digest delivered at `seq_no`, while retained in the log.
    pub fn delivered_digest(&self, seq_no: u64) -> Option<Digest> {
        self.requests.delivered_at(seq_no).copied()
    }

    /// Number of request bodies currently pooled.
    pub fn request_pool_len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the local replica is the primary of the current view.
    pub(crate) fn is_primary(&self) -> bool {
        self.topology.is_primary(self.view)
    }

    /// Maximum tolerated faults `f`.
    pub(crate) fn max_faulty(&self) -> usize {
        self.topology.max_faulty()
    }

    /// Quorum size `2f+1`.
    pub(crate) fn quorum(&self) -> usize {
        self.topology.quorum()
    }

    /// High watermark `h + L`.
    pub(crate) fn high_watermark(&self) -> u64 {
        self.low_watermark + self.config.log_size()
    }

    /// Watermark admission: `h < n ≤ h + L`.
    pub(crate) fn in_watermarks(&self, seq_no: u64) -> bool {
        seq_no > self.low_watermark && seq_no <= self.high_watermark()
    }

    fn check_watermarks(&self, seq_no: u64) -> Result<(), ProtocolError> {
        if self.in_watermarks(seq_no) {
            Ok(())
        } else {
            Err(ProtocolError::BadWatermarks {
                seq_no,
                low: self.low_watermark,
                high: self.high_watermark(),
            })
        }
    }

    /// The sender's verification key, or `UnknownReplica`.
    pub(crate) fn public_key_of(
        &self,
        replica: ReplicaId,
    ) -> Result<&palisade_types::PublicKey, ProtocolError> {
        self.topology
            .public_key(replica)
            .ok_or(ProtocolError::UnknownReplica(replica))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    /// Arm the request timer if it is not already running.
    pub(crate) fn soft_start_request_timer(&mut self) -> Vec<Action> {
        if self.request_timer_armed || !self.active_view {
            return vec![];
        }
        self.request_timer_armed = true;
        trace!(replica = %self.id, "Request timer armed");
        vec![Action::SetTimer {
            id: TimerId::Request,
            duration: self.config.request_timeout,
        }]
    }

    /// Re-arm the request timer (progress was made, outstanding remains).
    fn reset_request_timer(&mut self) -> Vec<Action> {
        if !self.active_view {
            return vec![];
        }
        self.request_timer_armed = true;
        vec![Action::SetTimer {
            id: TimerId::Request,
            duration: self.config.request_timeout,
        }]
    }

    /// Cancel the request timer if armed.
    pub(crate) fn stop_request_timer(&mut self) -> Vec<Action> {
        if !self.request_timer_armed {
            return vec![];
        }
        self.request_timer_armed = false;
        vec![Action::CancelTimer {
            id: TimerId::Request,
        }]
    }

    fn on_request_timer(&mut self) -> Result<Vec<Action>, ProtocolError> {
        self.request_timer_armed = false;
        if !self.active_view || self.requests.outstanding_is_empty() {
            // Stale fire: the view already changed or everything delivered.
            return Ok(vec![]);
        }
        warn!(
            replica = %self.id,
            view = self.view,
            outstanding = self.requests.outstanding_digests().len(),
            "Request timer expired, initiating view change"
        );
        self.send_view_change()
    }

    fn on_new_view_timer(&mut self) -> Result<Vec<Action>, ProtocolError> {
        if self.active_view {
            return Ok(vec![]);
        }
        warn!(
            replica = %self.id,
            view = self.view,
            "New-view timer expired, advancing view"
        );
        self.send_view_change()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests
    // ═══════════════════════════════════════════════════════════════════════

    fn on_request_submitted(&mut self, request: Request) -> Result<Vec<Action>, ProtocolError> {
        // Disseminate to peers, then take the same path as a relayed request.
        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::Request(request.clone()),
            include_self: false,
        }];
        actions.extend(self.accept_request(request)?);
        Ok(actions)
    }

    /// Common request intake for submitted and relayed requests.
    fn accept_request(&mut self, request: Request) -> Result<Vec<Action>, ProtocolError> {
        let (digest, is_new) = self.requests.insert(request);
        if is_new {
            debug!(replica = %self.id, %digest, "Accepted request");
        }

        let mut actions = vec![];
        if self.requests.is_outstanding(&digest) {
            actions.extend(self.soft_start_request_timer());
        }

        if self.active_view {
            if self.is_primary() {
                actions.extend(self.try_send_pre_prepare(digest)?);
            } else {
                // A buffered pre-prepare may be waiting for this body.
                actions.extend(self.maybe_send_prepare(self.view, digest)?);
            }
        } else {
            // A deferred new-view may be waiting for this body.
            actions.extend(self.process_new_view()?);
        }

        // The body may also unblock the delivery queue.
        actions.extend(self.drain_executions()?);
        Ok(actions)
    }

    /// Primary path: bind the next sequence number to `digest`.
    pub(crate) fn try_send_pre_prepare(&mut self, digest: Digest) -> Result<Vec<Action>, ProtocolError> {
        // Already assigned in this view?
        let bound = self
            .certs
            .iter()
            .any(|(&(v, _), c)| v == self.view && c.digest() == Some(digest));
        if bound {
            return Ok(vec![]);
        }

        let seq_no = self.seq_no + 1;
        if seq_no > self.high_watermark() {
            debug!(
                replica = %self.id,
                seq_no,
                high = self.high_watermark(),
                "Log full, deferring request until checkpoint"
            );
            return Ok(vec![]);
        }
        self.seq_no = seq_no;

        let pp = PrePrepare::new(self.view, seq_no, digest, self.id, &self.signing_key);
        self.certs.record_pre_prepare(pp.clone())?;

        info!(
            replica = %self.id,
            view = self.view,
            seq_no,
            %digest,
            "Primary assigned sequence number"
        );

        Ok(vec![Action::Broadcast {
            message: ConsensusMessage::PrePrepare(pp),
            include_self: false,
        }])
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal-Case Protocol
    // ═══════════════════════════════════════════════════════════════════════

    fn on_pre_prepare(&mut self, pp: PrePrepare) -> Result<Vec<Action>, ProtocolError> {
        if !self.active_view {
            return Err(ProtocolError::InactiveView(self.view));
        }
        if pp.view != self.view {
            return Err(ProtocolError::ViewMismatch {
                got: pp.view,
                local: self.view,
            });
        }
        if self.topology.primary_of(self.view) != pp.replica {
            return Err(ProtocolError::UnexpectedSender {
                kind: "pre-prepare",
                replica: pp.replica,
                view: self.view,
            });
        }
        let key = self.public_key_of(pp.replica)?;
        if !pp.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "pre-prepare",
                replica: pp.replica,
            });
        }
        self.check_watermarks(pp.seq_no)?;

        let (view, seq_no, digest) = (pp.view, pp.seq_no, pp.digest);
        if let Err(err) = self.certs.record_pre_prepare(pp) {
            // Equivocating primary: drop the conflict and let the request
            // timer force a view change.
            warn!(replica = %self.id, %err, "Rejected pre-prepare");
            return Ok(self.soft_start_request_timer());
        }

        debug!(replica = %self.id, view, seq_no, %digest, "Recorded pre-prepare");

        let mut actions = self.maybe_send_prepare_at(view, seq_no)?;
        // Prepares may have arrived ahead of the pre-prepare.
        actions.extend(self.maybe_send_commit(view, seq_no)?);
        Ok(actions)
    }

    /// Send our prepare for any current-view slot bound to `digest` whose
    /// body we now hold.
    fn maybe_send_prepare(
        &mut self,
        view: u64,
        digest: Digest,
    ) -> Result<Vec<Action>, ProtocolError> {
        let slots: Vec<u64> = self
            .certs
            .iter()
            .filter(|(&(v, _), c)| v == view && c.digest() == Some(digest) && !c.sent_prepare)
            .map(|(&(_, n), _)| n)
            .collect();

        let mut actions = vec![];
        for seq_no in slots {
            actions.extend(self.maybe_send_prepare_at(view, seq_no)?);
        }
        Ok(actions)
    }

    /// Send our prepare for `(view, seq_no)` once the slot is bound and
    /// the request body is known.
    fn maybe_send_prepare_at(
        &mut self,
        view: u64,
        seq_no: u64,
    ) -> Result<Vec<Action>, ProtocolError> {
        if self.is_primary() {
            return Ok(vec![]);
        }
        let Some(cert) = self.certs.get(view, seq_no) else {
            return Ok(vec![]);
        };
        let Some(digest) = cert.digest() else {
            return Ok(vec![]);
        };
        if cert.sent_prepare {
            return Ok(vec![]);
        }
        if !digest.is_null() && self.requests.lookup(&digest).is_none() {
            // Buffer until the request body arrives (or the view changes).
            debug!(replica = %self.id, view, seq_no, %digest, "Pre-prepared but request unknown");
            return Ok(vec![]);
        }

        self.certs.get_or_create(view, seq_no).sent_prepare = true;
        let prepare = Prepare::new(view, seq_no, digest, self.id, &self.signing_key);
        debug!(replica = %self.id, view, seq_no, %digest, "Broadcasting prepare");

        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::Prepare(prepare),
            include_self: true,
        }];
        actions.extend(self.maybe_send_commit(view, seq_no)?);
        Ok(actions)
    }

    fn on_prepare(&mut self, prepare: Prepare) -> Result<Vec<Action>, ProtocolError> {
        if !self.active_view {
            return Err(ProtocolError::InactiveView(self.view));
        }
        if prepare.view != self.view {
            return Err(ProtocolError::ViewMismatch {
                got: prepare.view,
                local: self.view,
            });
        }
        // The primary's pre-prepare stands in for its prepare.
        if self.topology.primary_of(prepare.view) == prepare.replica {
            return Err(ProtocolError::UnexpectedSender {
                kind: "prepare",
                replica: prepare.replica,
                view: self.view,
            });
        }
        let key = self.public_key_of(prepare.replica)?;
        if !prepare.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "prepare",
                replica: prepare.replica,
            });
        }
        self.check_watermarks(prepare.seq_no)?;

        let (view, seq_no) = (prepare.view, prepare.seq_no);
        self.certs.record_prepare(prepare)?;
        self.maybe_send_commit(view, seq_no)
    }

    /// Broadcast our commit once the prepared certificate holds.
    fn maybe_send_commit(&mut self, view: u64, seq_no: u64) -> Result<Vec<Action>, ProtocolError> {
        let Some(cert) = self.certs.get(view, seq_no) else {
            return Ok(vec![]);
        };
        let Some(digest) = cert.digest() else {
            return Ok(vec![]);
        };
        if cert.sent_commit {
            return Ok(vec![]);
        }
        if !self
            .certs
            .prepared(&digest, view, seq_no, 2 * self.max_faulty())
        {
            return Ok(vec![]);
        }

        self.certs.get_or_create(view, seq_no).sent_commit = true;
        let commit = Commit::new(view, seq_no, digest, self.id, &self.signing_key);
        debug!(replica = %self.id, view, seq_no, %digest, "Broadcasting commit");

        Ok(vec![Action::Broadcast {
            message: ConsensusMessage::Commit(commit),
            include_self: true,
        }])
    }

    fn on_commit(&mut self, commit: Commit) -> Result<Vec<Action>, ProtocolError> {
        if !self.active_view {
            return Err(ProtocolError::InactiveView(self.view));
        }
        if commit.view != self.view {
            return Err(ProtocolError::ViewMismatch {
                got: commit.view,
                local: self.view,
            });
        }
        let key = self.public_key_of(commit.replica)?;
        if !commit.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "commit",
                replica: commit.replica,
            });
        }
        self.check_watermarks(commit.seq_no)?;

        let (view, seq_no, digest) = (commit.view, commit.seq_no, commit.digest);
        self.certs.record_commit(commit)?;

        if self.certs.committed(
            &digest,
            view,
            seq_no,
            2 * self.max_faulty(),
            self.quorum(),
        ) {
            self.queue_committed(seq_no, digest)?;
            return self.drain_executions();
        }
        Ok(vec![])
    }

    /// Queue a committed slot for in-order delivery, checking agreement.
    pub(crate) fn queue_committed(
        &mut self,
        seq_no: u64,
        digest: Digest,
    ) -> Result<(), ProtocolError> {
        if seq_no <= self.last_exec {
            // Already delivered; a different digest here is a safety
            // contradiction.
            if let Some(prev) = self.requests.delivered_at(seq_no) {
                if *prev != digest {
                    return Err(InvariantViolation(format!(
                        "slot {seq_no} committed twice with different digests"
                    ))
                    .into());
                }
            }
            return Ok(());
        }
        match self.pending_execution.get(&seq_no) {
            Some(existing) if *existing != digest => Err(InvariantViolation(format!(
                "slot {seq_no} committed twice with different digests"
            ))
            .into()),
            _ => {
                self.pending_execution.insert(seq_no, digest);
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver committed slots in strict ascending order, no gaps.
    pub(crate) fn drain_executions(&mut self) -> Result<Vec<Action>, ProtocolError> {
        let mut actions = vec![];
        let mut progressed = false;

        loop {
            let next = self.last_exec + 1;
            let Some(&digest) = self.pending_execution.get(&next) else {
                break;
            };

            if digest.is_null() {
                // Null request: advance without delivering.
                self.pending_execution.remove(&next);
                self.last_exec = next;
            } else {
                let Some(request) = self.requests.lookup(&digest).cloned() else {
                    debug!(replica = %self.id, seq_no = next, %digest, "Committed but request unknown");
                    actions.push(Action::FetchRequest { digest });
                    break;
                };
                self.pending_execution.remove(&next);
                self.last_exec = next;
                self.requests.mark_delivered(digest, next);
                info!(replica = %self.id, seq_no = next, %digest, "Delivered request");
                actions.push(Action::Deliver {
                    seq_no: next,
                    request,
                });
            }
            progressed = true;

            if next % self.config.checkpoint_period == 0 {
                actions.push(Action::ComputeStateDigest { seq_no: next });
            }
        }

        if progressed {
            if self.requests.outstanding_is_empty() {
                actions.extend(self.stop_request_timer());
            } else {
                // Progress resets the timer for the remaining requests.
                actions.extend(self.reset_request_timer());
            }
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    fn on_state_digest(&mut self, seq_no: u64, digest: Digest) -> Result<Vec<Action>, ProtocolError> {
        if seq_no <= self.low_watermark {
            return Ok(vec![]);
        }
        self.checkpoints.record_local(seq_no, digest);
        info!(replica = %self.id, seq_no, %digest, "Broadcasting checkpoint");

        let checkpoint = Checkpoint::new(seq_no, digest, self.id, &self.signing_key);
        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::Checkpoint(checkpoint),
            include_self: true,
        }];
        // Peers may already have made this checkpoint stable.
        actions.extend(self.try_stabilize(seq_no)?);
        Ok(actions)
    }

    fn on_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<Vec<Action>, ProtocolError> {
        let key = self.public_key_of(checkpoint.replica)?;
        if !checkpoint.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "checkpoint",
                replica: checkpoint.replica,
            });
        }
        if checkpoint.seq_no <= self.low_watermark {
            trace!(replica = %self.id, seq_no = checkpoint.seq_no, "Stale checkpoint");
            return Ok(vec![]);
        }

        if !self.checkpoints.record_remote(
            checkpoint.seq_no,
            checkpoint.replica,
            checkpoint.state_digest,
        ) {
            return Err(ProtocolError::DuplicateVote {
                kind: "checkpoint",
                replica: checkpoint.replica,
                seq_no: checkpoint.seq_no,
            });
        }

        self.try_stabilize(checkpoint.seq_no)
    }

    /// Advance the watermark if `seq_no` has become stable.
    fn try_stabilize(&mut self, seq_no: u64) -> Result<Vec<Action>, ProtocolError> {
        let Some(stable) = self.checkpoints.stable_digest(seq_no, self.quorum()) else {
            return Ok(vec![]);
        };

        match self.checkpoints.local(seq_no) {
            Some(local) if *local == stable => self.move_watermarks(seq_no),
            Some(_) => Err(InvariantViolation(format!(
                "local state digest diverges from stable checkpoint {seq_no}"
            ))
            .into()),
            None if self.last_exec >= seq_no => {
                // Delivered it, digest computation still pending at the host.
                Ok(vec![])
            }
            None => {
                // Behind the network: simple state-transfer hook.
                if self.fetching_checkpoint == Some(seq_no) {
                    return Ok(vec![]);
                }
                self.fetching_checkpoint = Some(seq_no);
                let err = ProtocolError::MissingCheckpoint { seq_no };
                warn!(replica = %self.id, %err, "Requesting state transfer");
                Ok(vec![Action::FetchCheckpoint { seq_no }])
            }
        }
    }

    /// Move the low watermark to the stable checkpoint `stable` and
    /// truncate everything at or below it.
    pub(crate) fn move_watermarks(&mut self, stable: u64) -> Result<Vec<Action>, ProtocolError> {
        if stable <= self.low_watermark {
            return Ok(vec![]);
        }
        self.low_watermark = stable;
        self.certs.prune_through_seq(stable);
        self.checkpoints.prune(stable);
        self.requests.prune_delivered_through(stable);
        self.pset.retain(|&n, _| n > stable);
        self.qset.retain(|&(_, n), _| n > stable);
        self.pending_execution.retain(|&n, _| n > stable);
        if self.seq_no < stable {
            self.seq_no = stable;
        }
        if self.fetching_checkpoint.is_some_and(|n| n <= stable) {
            self.fetching_checkpoint = None;
        }

        info!(
            replica = %self.id,
            h = stable,
            high = self.high_watermark(),
            "Checkpoint stable, advanced watermarks"
        );

        // The higher base may unblock a deferred new-view.
        if !self.active_view {
            return self.process_new_view();
        }

        // The wider window may admit requests deferred on a full log.
        let mut actions = vec![];
        if self.is_primary() {
            for digest in self.requests.outstanding_digests() {
                let bound = self
                    .certs
                    .iter()
                    .any(|(_, cert)| cert.digest() == Some(digest));
                if !bound {
                    actions.extend(self.try_send_pre_prepare(digest)?);
                }
            }
        }
        Ok(actions)
    }

    fn on_checkpoint_installed(
        &mut self,
        seq_no: u64,
        digest: Digest,
    ) -> Result<Vec<Action>, ProtocolError> {
        if seq_no <= self.low_watermark {
            return Ok(vec![]);
        }
        info!(replica = %self.id, seq_no, %digest, "Installed fetched checkpoint");
        self.checkpoints.record_local(seq_no, digest);
        if self.last_exec < seq_no {
            self.last_exec = seq_no;
        }
        let mut actions = self.move_watermarks(seq_no)?;
        actions.extend(self.drain_executions()?);
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn on_message(&mut self, message: ConsensusMessage) -> Result<Vec<Action>, ProtocolError> {
        match message {
            ConsensusMessage::Request(request) => self.accept_request(request),
            ConsensusMessage::PrePrepare(pp) => self.on_pre_prepare(pp),
            ConsensusMessage::Prepare(prepare) => self.on_prepare(prepare),
            ConsensusMessage::Commit(commit) => self.on_commit(commit),
            ConsensusMessage::Checkpoint(checkpoint) => self.on_checkpoint(checkpoint),
            ConsensusMessage::ViewChange(vc) => self.on_view_change(vc),
            ConsensusMessage::NewView(nv) => self.on_new_view(nv),
        }
    }
}

impl StateMachine for PbftState {
    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Result<Vec<Action>, InvariantViolation> {
        let kind = event.type_name();
        let result = match event {
            Event::RequestSubmitted { request } => self.on_request_submitted(request),
            Event::MessageReceived { message } => self.on_message(message),
            Event::RequestTimer => self.on_request_timer(),
            Event::NewViewTimer => self.on_new_view_timer(),
            Event::StateDigest { seq_no, digest } => self.on_state_digest(seq_no, digest),
            Event::CheckpointInstalled { seq_no, digest } => {
                self.on_checkpoint_installed(seq_no, digest)
            }
        };

        match result {
            Ok(actions) => Ok(actions),
            Err(ProtocolError::Invariant(violation)) => {
                warn!(replica = %self.id, %violation, "Halting on invariant violation");
                Err(violation)
            }
            Err(err) => {
                debug!(replica = %self.id, event = kind, %err, "Dropped");
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use palisade_core::Event;

    #[test]
    fn test_primary_assigns_and_broadcasts_pre_prepare() {
        let mut harness = Harness::new(4, 0);
        let request = harness.request(1);

        let actions = harness.submit(request.clone());
        // Request dissemination plus the pre-prepare.
        let pp = find_pre_prepare(&actions).expect("pre-prepare");
        assert_eq!(pp.view, 0);
        assert_eq!(pp.seq_no, 1);
        assert_eq!(pp.digest, request.digest());
        assert_eq!(harness.state.seq_no(), 1);
        // The primary never emits a prepare for its own proposal.
        assert!(find_prepare(&actions).is_none());
        assert!(has_set_timer(&actions, TimerId::Request));
    }

    #[test]
    fn test_backup_prepares_once_request_known() {
        let mut harness = Harness::new(4, 1);
        let request = harness.request(1);
        let digest = request.digest();

        // Pre-prepare before the body: buffered.
        let actions = harness.deliver_pre_prepare(0, 1, digest);
        assert!(find_prepare(&actions).is_none());

        // Body arrives: prepare goes out.
        let actions = harness.relay_request(request);
        let prepare = find_prepare(&actions).expect("prepare");
        assert_eq!(prepare.seq_no, 1);
        assert_eq!(prepare.digest, digest);
    }

    #[test]
    fn test_backup_full_commit_path_delivers() {
        let mut harness = Harness::new(4, 1);
        let request = harness.request(1);
        let digest = request.digest();

        harness.relay_request(request.clone());
        let actions = harness.deliver_pre_prepare(0, 1, digest);
        assert!(find_prepare(&actions).is_some());
        harness.loopback_own(&actions);

        // Replica 2's prepare completes the prepared certificate
        // (2f = 2 with our own), so our commit goes out.
        let actions = harness.deliver_prepare(2, 0, 1, digest);
        let commit = find_commit(&actions).expect("commit");
        assert_eq!(commit.seq_no, 1);
        harness.loopback_own(&actions);
        // A third prepare is just another recorded vote.
        harness.deliver_prepare(3, 0, 1, digest);

        // Commits from 0 and 2 reach the 2f+1 quorum with our own.
        harness.deliver_commit(0, 0, 1, digest);
        let actions = harness.deliver_commit(2, 0, 1, digest);
        let delivered = find_deliver(&actions).expect("delivery");
        assert_eq!(delivered.0, 1);
        assert_eq!(delivered.1.digest(), digest);
        assert_eq!(harness.state.last_exec(), 1);
    }

    #[test]
    fn test_duplicate_votes_and_replays_are_noops() {
        let mut harness = Harness::new(4, 1);
        let request = harness.request(1);
        let digest = request.digest();

        harness.relay_request(request);
        let actions = harness.deliver_pre_prepare(0, 1, digest);
        harness.loopback_own(&actions);
        harness.deliver_prepare(2, 0, 1, digest);

        // Replay of the same prepare changes nothing.
        let replay = harness.deliver_prepare(2, 0, 1, digest);
        assert!(replay.is_empty());

        // Replay of the pre-prepare changes nothing either.
        let replay = harness.deliver_pre_prepare(0, 1, digest);
        assert!(replay.is_empty());
    }

    #[test]
    fn test_prepare_from_primary_rejected() {
        let mut harness = Harness::new(4, 1);
        let digest = Digest::hash(b"req");

        harness.deliver_pre_prepare(0, 1, digest);
        let actions = harness.deliver_prepare(0, 0, 1, digest);
        assert!(actions.is_empty());
        let cert = harness.state.certs.get(0, 1).expect("cert");
        assert_eq!(cert.prepare_count(&digest), 0);
    }

    #[test]
    fn test_watermark_boundaries() {
        let mut harness = Harness::new(4, 1);
        let digest = Digest::hash(b"req");
        // K = 10, L = 20, h = 0: admissible window is (0, 20].

        // n = h rejected.
        let actions = harness.deliver_prepare(2, 0, 0, digest);
        assert!(actions.is_empty());
        assert!(harness.state.certs.get(0, 0).is_none());

        // n = h + L accepted.
        harness.deliver_prepare(2, 0, 20, digest);
        assert!(harness.state.certs.get(0, 20).is_some());

        // n = h + L + 1 rejected.
        let actions = harness.deliver_prepare(2, 0, 21, digest);
        assert!(actions.is_empty());
        assert!(harness.state.certs.get(0, 21).is_none());
    }

    #[test]
    fn test_equivocating_pre_prepare_dropped_and_timer_armed() {
        let mut harness = Harness::new(4, 1);
        let d1 = Digest::hash(b"a");
        let d2 = Digest::hash(b"b");

        harness.deliver_pre_prepare(0, 1, d1);
        let actions = harness.deliver_pre_prepare(0, 1, d2);
        // Second binding dropped; the timer is running so the view change
        // will eventually fire.
        assert!(has_set_timer(&actions, TimerId::Request));
        assert_eq!(harness.state.certs.get(0, 1).unwrap().digest(), Some(d1));
    }

    #[test]
    fn test_invalid_signature_dropped() {
        let mut harness = Harness::new(4, 1);
        let digest = Digest::hash(b"req");

        // Prepare claiming to be from replica 2 but signed by replica 3.
        let forged = Prepare::new(0, 1, digest, ReplicaId(2), harness.key_of(3));
        let actions = harness.receive(ConsensusMessage::Prepare(forged));
        assert!(actions.is_empty());
        assert!(harness.state.certs.get(0, 1).is_none());
    }

    #[test]
    fn test_view_mismatch_dropped() {
        let mut harness = Harness::new(4, 1);
        let digest = Digest::hash(b"req");

        let actions = harness.deliver_prepare(2, 3, 1, digest);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_checkpoint_stability_advances_watermarks() {
        let mut harness = Harness::new(4, 1);
        harness.commit_through(10);
        assert_eq!(harness.state.last_exec(), 10);

        // Host answers the state-digest request.
        let state_digest = Digest::hash(b"state@10");
        let actions = harness.state_digest(10, state_digest);
        assert!(matches!(
            find_broadcast(&actions),
            Some(ConsensusMessage::Checkpoint(_))
        ));
        harness.loopback_own(&actions);

        // Two more matching attestations make it stable (2f+1 = 3).
        harness.deliver_checkpoint(0, 10, state_digest);
        harness.deliver_checkpoint(2, 10, state_digest);

        assert_eq!(harness.state.low_watermark(), 10);
        // Certificates at or below the watermark are pruned.
        assert!(harness.state.certs.iter().all(|(&(_, n), _)| n > 10));
        // Delivered requests below the watermark are evicted.
        assert!(harness.state.delivered_digest(10).is_none());
    }

    #[test]
    fn test_mismatched_checkpoint_digests_do_not_stabilize() {
        let mut harness = Harness::new(4, 1);
        harness.commit_through(10);
        let actions = harness.state_digest(10, Digest::hash(b"state@10"));
        harness.loopback_own(&actions);

        harness.deliver_checkpoint(0, 10, Digest::hash(b"other"));
        harness.deliver_checkpoint(2, 10, Digest::hash(b"other2"));
        assert_eq!(harness.state.low_watermark(), 0);
    }

    #[test]
    fn test_lagging_replica_fetches_stable_checkpoint() {
        let mut harness = Harness::new(4, 1);
        let state_digest = Digest::hash(b"state@10");

        // The rest of the network checkpointed 10; we delivered nothing.
        harness.deliver_checkpoint(0, 10, state_digest);
        harness.deliver_checkpoint(2, 10, state_digest);
        let actions = harness.deliver_checkpoint(3, 10, state_digest);
        assert!(matches!(
            actions.as_slice(),
            [Action::FetchCheckpoint { seq_no: 10 }]
        ));

        // Host completes the transfer.
        let actions = harness
            .state
            .handle(Event::CheckpointInstalled {
                seq_no: 10,
                digest: state_digest,
            })
            .unwrap();
        assert_eq!(harness.state.low_watermark(), 10);
        assert_eq!(harness.state.last_exec(), 10);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_conflicting_commit_quorums_violate_invariant() {
        let mut harness = Harness::new(4, 1);
        harness.state.queue_committed(1, Digest::hash(b"a")).unwrap();
        let err = harness
            .state
            .queue_committed(1, Digest::hash(b"b"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Invariant(_)));
    }

    #[test]
    fn test_delivery_is_gap_free() {
        let mut harness = Harness::new(4, 1);
        let r1 = harness.request(1);
        let r2 = harness.request(2);

        harness.relay_request(r1.clone());
        harness.relay_request(r2.clone());

        // Commit slot 2 first: nothing is delivered.
        let actions = harness.commit_slot(2, r2.digest());
        assert!(find_deliver(&actions).is_none());
        assert_eq!(harness.state.last_exec(), 0);

        // Slot 1 unblocks both, in order.
        let actions = harness.commit_slot(1, r1.digest());
        let delivered: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Deliver { seq_no, .. } => Some(*seq_no),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2]);
    }
}
