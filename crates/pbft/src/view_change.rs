//! View-change protocol.
//!
//! When the primary of a view stops making progress, the backups elect
//! its successor: each broadcasts a VIEW-CHANGE carrying its protocol
//! state (C/P/Q sets), the prospective primary assembles `2f+1` of them
//! into a NEW-VIEW with a sequence-number assignment (the X set), and
//! every replica independently re-derives that assignment before
//! accepting the view.
//!
//! The X set computation is the safety centerpiece: for any slot that was
//! committed-local at a correct replica before the change, quorum
//! intersection forces the same digest to be re-assigned in the new view.

use palisade_core::{Action, InvariantViolation, TimerId};
use palisade_messages::{
    CheckpointEntry, ConsensusMessage, NewView, PqEntry, PrePrepare, Prepare, ViewChange,
};
use palisade_types::{Digest, ReplicaId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::state::PbftState;

impl PbftState {
    // ═══════════════════════════════════════════════════════════════════════
    // Sending VIEW-CHANGE
    // ═══════════════════════════════════════════════════════════════════════

    /// Abandon the current view: advance to the next one and broadcast our
    /// VIEW-CHANGE carrying the C/P/Q evidence sets.
    pub(crate) fn send_view_change(&mut self) -> Result<Vec<Action>, ProtocolError> {
        let mut actions = self.stop_request_timer();

        self.new_view_store.remove(&self.view);
        self.view += 1;
        self.active_view = false;

        // P set: slots with a prepared certificate here, keeping only the
        // entry from the latest view per sequence number.
        let two_f = 2 * self.max_faulty();
        let mut prepared: Vec<(u64, u64, Digest)> = vec![];
        let mut pre_prepared: Vec<(u64, u64, Digest)> = vec![];
        for (&(view, seq_no), cert) in self.certs.iter() {
            let Some(digest) = cert.digest() else { continue };
            if self.certs.prepared(&digest, view, seq_no, two_f) {
                prepared.push((view, seq_no, digest));
            }
            if self.certs.pre_prepared(&digest, view, seq_no) {
                pre_prepared.push((view, seq_no, digest));
            }
        }
        for (view, seq_no, digest) in prepared {
            if self.pset.get(&seq_no).is_some_and(|p| p.view > view) {
                continue;
            }
            self.pset.insert(
                seq_no,
                PqEntry {
                    seq_no,
                    digest,
                    view,
                },
            );
        }

        // Q set: slots pre-prepared here, per (digest, seq_no).
        for (view, seq_no, digest) in pre_prepared {
            if self
                .qset
                .get(&(digest, seq_no))
                .is_some_and(|q| q.view > view)
            {
                continue;
            }
            self.qset.insert(
                (digest, seq_no),
                PqEntry {
                    seq_no,
                    digest,
                    view,
                },
            );
        }

        // Clear state from abandoned views.
        let view = self.view;
        self.certs.prune_below_view(view);
        self.view_change_store.retain(|&(v, _), _| v >= view);

        let vc = ViewChange::new(
            self.view,
            self.low_watermark,
            self.checkpoints.local_entries(),
            self.pset.values().copied().collect(),
            self.qset.values().copied().collect(),
            self.id,
            &self.signing_key,
        );

        info!(
            replica = %self.id,
            view = vc.view,
            h = vc.h,
            c = vc.c_set.len(),
            p = vc.p_set.len(),
            q = vc.q_set.len(),
            "Sending view-change"
        );

        // Our own vote is counted through the loopback path, like any
        // peer's.
        actions.push(Action::Broadcast {
            message: ConsensusMessage::ViewChange(vc),
            include_self: true,
        });
        Ok(actions)
    }

    /// Validity of a received VIEW-CHANGE: every P/Q entry prepared in an
    /// older view and inside the sender's window, every C entry inside
    /// the window (the stable base itself included).
    pub(crate) fn correct_view_change(&self, vc: &ViewChange) -> bool {
        let log_size = self.config.log_size();
        for entry in vc.p_set.iter().chain(vc.q_set.iter()) {
            if !(entry.view < vc.view && entry.seq_no > vc.h && entry.seq_no <= vc.h + log_size) {
                debug!(
                    replica = %self.id,
                    vc_view = vc.view,
                    vc_h = vc.h,
                    entry_view = entry.view,
                    entry_seq = entry.seq_no,
                    "Invalid P/Q entry in view-change"
                );
                return false;
            }
        }
        for c in &vc.c_set {
            if !(c.seq_no >= vc.h && c.seq_no <= vc.h + log_size) {
                debug!(
                    replica = %self.id,
                    vc_view = vc.view,
                    vc_h = vc.h,
                    entry_seq = c.seq_no,
                    "Invalid C entry in view-change"
                );
                return false;
            }
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving VIEW-CHANGE
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_view_change(&mut self, vc: ViewChange) -> Result<Vec<Action>, ProtocolError> {
        let key = self.public_key_of(vc.replica)?;
        if !vc.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "view-change",
                replica: vc.replica,
            });
        }

        info!(
            replica = %self.id,
            from = %vc.replica,
            view = vc.view,
            h = vc.h,
            "Received view-change"
        );

        if vc.view < self.view || !self.correct_view_change(&vc) {
            warn!(replica = %self.id, from = %vc.replica, view = vc.view, "View-change message incorrect");
            return Ok(vec![]);
        }
        if self.view_change_store.contains_key(&(vc.view, vc.replica)) {
            return Err(ProtocolError::DuplicateVote {
                kind: "view-change",
                replica: vc.replica,
                seq_no: vc.view,
            });
        }
        self.view_change_store.insert((vc.view, vc.replica), vc.clone());

        // Liveness amplification: f+1 distinct replicas ahead of us pull
        // us to the smallest of their views without waiting for a timer.
        let mut ahead: BTreeSet<ReplicaId> = BTreeSet::new();
        let mut min_view = u64::MAX;
        for &(view, replica) in self.view_change_store.keys() {
            if view > self.view {
                ahead.insert(replica);
                min_view = min_view.min(view);
            }
        }
        if ahead.len() >= self.topology.weak_quorum() {
            info!(
                replica = %self.id,
                target_view = min_view,
                "Received f+1 view-changes for higher views, amplifying"
            );
            // Minus one: send_view_change increments.
            self.view = min_view - 1;
            return self.send_view_change();
        }

        // Quorum of view-changes at our view: arm the new-view timer with
        // exponential backoff, guarding against a faulty next primary.
        let mut actions = vec![];
        let quorum = self
            .view_change_store
            .keys()
            .filter(|(view, _)| *view == self.view)
            .count();
        if vc.view == self.view && quorum == self.quorum() && !self.active_view {
            let timeout = self.last_new_view_timeout;
            self.last_new_view_timeout *= 2;
            actions.push(Action::SetTimer {
                id: TimerId::NewView,
                duration: timeout,
            });
        }

        if self.topology.is_primary(self.view) {
            actions.extend(self.send_new_view()?);
        } else {
            actions.extend(self.process_new_view()?);
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NEW-VIEW
    // ═══════════════════════════════════════════════════════════════════════

    /// Prospective-primary path: assemble the NEW-VIEW once enough
    /// evidence is stored.
    pub(crate) fn send_new_view(&mut self) -> Result<Vec<Action>, ProtocolError> {
        if self.new_view_store.contains_key(&self.view) {
            return Ok(vec![]);
        }

        let v_set: Vec<ViewChange> = self
            .view_change_store
            .iter()
            .filter(|((view, _), _)| *view == self.view)
            .map(|(_, vc)| vc.clone())
            .collect();
        if v_set.len() < self.quorum() {
            return Ok(vec![]);
        }

        let Some(base) = self.select_initial_checkpoint(&v_set)? else {
            debug!(replica = %self.id, view = self.view, "Cannot determine initial checkpoint yet");
            return Ok(vec![]);
        };
        let Some(x_set) = self.assign_sequence_numbers(&v_set, base.seq_no) else {
            debug!(replica = %self.id, view = self.view, "Cannot assign sequence numbers yet");
            return Ok(vec![]);
        };

        let nv = NewView::new(self.view, v_set, x_set, self.id, &self.signing_key);
        info!(
            replica = %self.id,
            view = nv.view,
            assignments = nv.x_set.len(),
            base = base.seq_no,
            "New primary sending new-view"
        );

        self.new_view_store.insert(self.view, nv.clone());
        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::NewView(nv),
            include_self: false,
        }];
        actions.extend(self.process_new_view()?);
        Ok(actions)
    }

    pub(crate) fn on_new_view(&mut self, nv: NewView) -> Result<Vec<Action>, ProtocolError> {
        let acceptable = nv.view > 0
            && nv.view >= self.view
            && self.topology.primary_of(nv.view) == nv.replica
            && !self.new_view_store.contains_key(&nv.view);
        if !acceptable {
            debug!(
                replica = %self.id,
                from = %nv.replica,
                view = nv.view,
                "Rejecting new-view"
            );
            return Ok(vec![]);
        }

        let key = self.public_key_of(nv.replica)?;
        if !nv.verify(key) {
            return Err(ProtocolError::InvalidSignature {
                kind: "new-view",
                replica: nv.replica,
            });
        }

        // Every carried view-change must be a verified vote for this view,
        // one per sender.
        let mut senders = BTreeSet::new();
        for vc in &nv.v_set {
            if vc.view != nv.view || !senders.insert(vc.replica) {
                return Err(ProtocolError::BadNewView {
                    view: nv.view,
                    reason: "malformed v-set",
                });
            }
            let key = self.public_key_of(vc.replica)?;
            if !vc.verify(key) {
                return Err(ProtocolError::InvalidSignature {
                    kind: "view-change",
                    replica: vc.replica,
                });
            }
        }
        if nv.v_set.len() < self.quorum() {
            return Err(ProtocolError::BadNewView {
                view: nv.view,
                reason: "v-set below quorum",
            });
        }

        info!(replica = %self.id, view = nv.view, "Received new-view");
        self.new_view_store.insert(nv.view, nv);
        self.process_new_view()
    }

    /// Try to complete the transition into the current view.
    ///
    /// Idempotent and re-entrant: every return before activation leaves
    /// state untouched except for fetch bookkeeping, and the next relevant
    /// event (arriving request, installed checkpoint, another view-change)
    /// drives it again.
    pub(crate) fn process_new_view(&mut self) -> Result<Vec<Action>, ProtocolError> {
        let Some(nv) = self.new_view_store.get(&self.view).cloned() else {
            return Ok(vec![]);
        };
        if self.active_view {
            debug!(
                replica = %self.id,
                view = self.view,
                "Ignoring new-view, already active"
            );
            return Ok(vec![]);
        }

        // Independently re-derive the primary's computation.
        let Some(base) = self.select_initial_checkpoint(&nv.v_set)? else {
            let err = ProtocolError::BadNewView {
                view: nv.view,
                reason: "no initial checkpoint",
            };
            warn!(replica = %self.id, %err, "Rejecting new-view");
            return self.send_view_change();
        };
        let Some(x_set) = self.assign_sequence_numbers(&nv.v_set, base.seq_no) else {
            let err = ProtocolError::BadNewView {
                view: nv.view,
                reason: "sequence numbers unassignable",
            };
            warn!(replica = %self.id, %err, "Rejecting new-view");
            return self.send_view_change();
        };
        if x_set != nv.x_set {
            let err = ProtocolError::BadNewView {
                view: nv.view,
                reason: "x-set mismatch",
            };
            warn!(replica = %self.id, %err, "Rejecting new-view");
            return self.send_view_change();
        }

        // Base checkpoint ahead of us: state transfer, then retry.
        if self.low_watermark < base.seq_no {
            let err = ProtocolError::MissingCheckpoint {
                seq_no: base.seq_no,
            };
            warn!(replica = %self.id, %err, "Deferring new-view");
            if self.fetching_checkpoint == Some(base.seq_no) {
                return Ok(vec![]);
            }
            self.fetching_checkpoint = Some(base.seq_no);
            return Ok(vec![Action::FetchCheckpoint {
                seq_no: base.seq_no,
            }]);
        }

        // Every assigned request must be available before we can prepare.
        let mut fetches = vec![];
        for (seq_no, digest) in &nv.x_set {
            if *seq_no > self.low_watermark
                && !digest.is_null()
                && self.requests.lookup(digest).is_none()
            {
                let err = ProtocolError::MissingRequest { digest: *digest };
                warn!(replica = %self.id, seq_no, %err, "Deferring new-view");
                fetches.push(Action::FetchRequest { digest: *digest });
            }
        }
        if !fetches.is_empty() {
            return Ok(fetches);
        }

        info!(replica = %self.id, view = self.view, "Accepting new-view");
        self.active_view = true;
        self.new_view_store.remove(&self.view.saturating_sub(1));
        self.last_new_view_timeout = self.config.new_view_timeout;
        let mut actions = vec![Action::CancelTimer { id: TimerId::NewView }];

        // Install the assignment as pre-prepares in the new view.
        for &(seq_no, digest) in &nv.x_set {
            let pp = PrePrepare::new(self.view, seq_no, digest, self.id, &self.signing_key);
            self.certs.install_pre_prepare(pp);
            if seq_no > self.seq_no {
                self.seq_no = seq_no;
            }
        }

        if !self.topology.is_primary(self.view) {
            // Backups immediately prepare every assigned slot.
            for &(seq_no, digest) in &nv.x_set {
                self.certs.get_or_create(self.view, seq_no).sent_prepare = true;
                let prepare = Prepare::new(self.view, seq_no, digest, self.id, &self.signing_key);
                actions.push(Action::Broadcast {
                    message: ConsensusMessage::Prepare(prepare),
                    include_self: true,
                });
            }
        } else {
            // The new primary re-proposes requests left without a slot.
            for digest in self.requests.outstanding_digests() {
                let bound = self
                    .certs
                    .iter()
                    .any(|(_, cert)| cert.digest() == Some(digest));
                if bound {
                    continue;
                }
                actions.extend(self.try_send_pre_prepare(digest)?);
            }
        }

        if !self.requests.outstanding_is_empty() {
            actions.extend(self.soft_start_request_timer());
        }

        actions.push(Action::ViewChanged { view: self.view });
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // X-Set Computation
    // ═══════════════════════════════════════════════════════════════════════

    /// Choose the base checkpoint for the new view.
    ///
    /// A candidate `(n, d)` needs a weak certificate (more than `f`
    /// view-changes attest it) and a quorum whose windows admit it
    /// (`2f+1` view-changes with `h ≤ n`); the highest such `n` wins.
    pub(crate) fn select_initial_checkpoint(
        &self,
        v_set: &[ViewChange],
    ) -> Result<Option<CheckpointEntry>, ProtocolError> {
        let mut attesters: BTreeMap<(u64, Digest), BTreeSet<ReplicaId>> = BTreeMap::new();
        for vc in v_set {
            for c in &vc.c_set {
                attesters
                    .entry((c.seq_no, c.state_digest))
                    .or_default()
                    .insert(vc.replica);
            }
        }
        if attesters.is_empty() {
            debug!(replica = %self.id, "No checkpoints to select from");
            return Ok(None);
        }

        let mut best: Option<CheckpointEntry> = None;
        for ((seq_no, state_digest), who) in &attesters {
            if who.len() < self.topology.weak_quorum() {
                debug!(replica = %self.id, seq_no, "No weak certificate");
                continue;
            }
            let quorum = v_set.iter().filter(|vc| vc.h <= *seq_no).count();
            if quorum < self.quorum() {
                debug!(replica = %self.id, seq_no, "No quorum admitting checkpoint");
                continue;
            }

            // Ascending iteration: an equal sequence number with a second
            // qualifying digest means two weak certificates contradict,
            // which a correct quorum cannot produce.
            if let Some(chosen) = &best {
                if chosen.seq_no == *seq_no && chosen.state_digest != *state_digest {
                    return Err(InvariantViolation(format!(
                        "two qualifying checkpoint digests at seq {seq_no}"
                    ))
                    .into());
                }
            }
            best = Some(CheckpointEntry {
                seq_no: *seq_no,
                state_digest: *state_digest,
            });
        }
        Ok(best)
    }

    /// Compute the X set: one assignment per `n ∈ (base, base+L]`.
    ///
    /// Rule A picks a digest some view-change prepared when a quorum does
    /// not contradict it (A1) and a weak certificate pre-prepared it (A2);
    /// Rule B assigns the null request when a quorum never prepared `n`.
    /// Returns `None` when neither rule applies at some slot.
    pub(crate) fn assign_sequence_numbers(
        &self,
        v_set: &[ViewChange],
        base: u64,
    ) -> Option<Vec<(u64, Digest)>> {
        let quorum = self.quorum();
        let weak = self.topology.weak_quorum();

        let mut x_set: Vec<(u64, Digest)> = vec![];
        let mut max_assigned = base;

        'slots: for seq_no in base + 1..=base + self.config.log_size() {
            // Rule A: adopt a prepared digest.
            for m in v_set {
                for em in m.p_set.iter().filter(|e| e.seq_no == seq_no) {
                    // A1: 2f+1 view-changes agree or have checkpointed past.
                    let mut agree = 0;
                    'peers: for mp in v_set {
                        if mp.h >= seq_no {
                            agree += 1;
                            continue;
                        }
                        for emp in mp.p_set.iter().filter(|e| e.seq_no == seq_no) {
                            if !(emp.view < em.view
                                || (emp.view == em.view && emp.digest == em.digest))
                            {
                                continue 'peers;
                            }
                        }
                        agree += 1;
                    }
                    if agree < quorum {
                        continue;
                    }

                    // A2: f+1 view-changes pre-prepared this digest at or
                    // after the prepared view.
                    let witnesses = v_set
                        .iter()
                        .filter(|mp| {
                            mp.q_set.iter().any(|e| {
                                e.seq_no == seq_no
                                    && e.digest == em.digest
                                    && e.view >= em.view
                            })
                        })
                        .count();
                    if witnesses < weak {
                        continue;
                    }

                    x_set.push((seq_no, em.digest));
                    max_assigned = seq_no;
                    continue 'slots;
                }
            }

            // Rule B: a quorum never prepared this slot.
            let vacant = v_set
                .iter()
                .filter(|m| m.p_set.iter().all(|e| e.seq_no != seq_no))
                .count();
            if vacant >= quorum {
                x_set.push((seq_no, Digest::NULL));
                continue 'slots;
            }

            debug!(replica = %self.id, seq_no, "No assignment possible");
            return None;
        }

        // Trailing null assignments carry no information.
        x_set.retain(|&(seq_no, digest)| seq_no <= max_assigned || !digest.is_null());
        Some(x_set)
    }
}
