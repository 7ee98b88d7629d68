//! Deterministic simulation runner.
//!
//! Drives one `PbftState` per replica through a global, totally ordered
//! event queue. All action side effects (message delivery, timers,
//! state-digest computation, fetch hooks) are executed inline, so a given
//! seed always produces an identical run.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::ReplicaIndex;
use palisade_core::{Action, Event, StateMachine, TimerId};
use palisade_messages::{ConsensusMessage, PrePrepare};
use palisade_pbft::{PbftConfig, PbftState};
use palisade_types::{Digest, KeyPair, ReplicaId, ReplicaInfo, Request, Topology};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Misbehavior the runner can inject for a replica flagged `byzantine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByzantineMode {
    /// Outbound messages are suppressed entirely.
    Silent,
    /// Pre-prepares are re-signed with a different request digest for
    /// half of the recipients (primary equivocation).
    EquivocatePrePrepare,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages scheduled for delivery.
    pub messages_sent: u64,
    /// Messages dropped (partition or packet loss).
    pub messages_dropped: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
}

/// Deterministic multi-replica simulation.
///
/// Given the same seed and the same script of injected events, every run
/// produces identical delivery logs on every replica.
pub struct SimulationRunner {
    /// One state machine per replica.
    replicas: Vec<PbftState>,

    /// Signing keys, index-aligned with `replicas`. Needed to re-sign
    /// equivocating pre-prepares.
    keys: Vec<KeyPair>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, (ReplicaIndex, Event)>,

    /// Sequence counter for FIFO tie-breaking.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    /// Network simulator.
    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Timer registry for cancellation: (replica, timer) → queued key.
    timers: HashMap<(ReplicaIndex, TimerId), EventKey>,

    /// Per-replica injected misbehavior.
    byzantine: HashMap<ReplicaIndex, ByzantineMode>,

    /// Every request body seen, for serving fetch hooks.
    request_bodies: BTreeMap<Digest, Request>,

    /// Per-replica application state: the delivered `(seq_no, digest)`
    /// log, including prefixes adopted via state transfer.
    app_log: Vec<Vec<(u64, Digest)>>,

    /// Per-replica `Deliver` actions observed, for assertions.
    delivered: Vec<Vec<(u64, Digest)>>,

    /// Per-replica computed state digests, for serving checkpoint fetches.
    state_digests: Vec<BTreeMap<u64, Digest>>,

    /// Per-replica view-change notifications.
    view_changes: Vec<Vec<u64>>,

    /// Replicas halted by an invariant violation.
    halted: Vec<Option<String>>,

    /// Statistics.
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a runner with `config.num_replicas` fresh replicas.
    pub fn new(config: NetworkConfig, pbft_config: PbftConfig, seed: u64) -> Self {
        let num_replicas = config.num_replicas as usize;
        let rng = ChaCha8Rng::seed_from_u64(seed);

        // Deterministic per-replica keys derived from the seed.
        let keys: Vec<KeyPair> = (0..num_replicas)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed.wrapping_add(i as u64).wrapping_mul(0x517cc1b727220a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();

        let replica_set: Vec<ReplicaInfo> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| ReplicaInfo {
                replica_id: ReplicaId(i as u64),
                public_key: key.public_key(),
            })
            .collect();

        let replicas: Vec<PbftState> = (0..num_replicas)
            .map(|i| {
                let topology = Arc::new(Topology::new(ReplicaId(i as u64), replica_set.clone()));
                PbftState::new(keys[i].clone(), topology, pbft_config.clone())
                    .expect("valid simulation config")
            })
            .collect();

        info!(num_replicas, seed, "Created simulation runner");

        Self {
            replicas,
            keys,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(config),
            rng,
            timers: HashMap::new(),
            byzantine: HashMap::new(),
            request_bodies: BTreeMap::new(),
            app_log: vec![vec![]; num_replicas],
            delivered: vec![vec![]; num_replicas],
            state_digests: vec![BTreeMap::new(); num_replicas],
            view_changes: vec![vec![]; num_replicas],
            halted: vec![None; num_replicas],
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Test Controls
    // ═══════════════════════════════════════════════════════════════════════

    /// Inspect a replica's state machine.
    pub fn replica(&self, index: ReplicaIndex) -> &PbftState {
        &self.replicas[index as usize]
    }

    /// The `Deliver` log of a replica.
    pub fn delivered(&self, index: ReplicaIndex) -> &[(u64, Digest)] {
        &self.delivered[index as usize]
    }

    /// Views a replica was notified of entering.
    pub fn view_changes(&self, index: ReplicaIndex) -> &[u64] {
        &self.view_changes[index as usize]
    }

    /// The invariant violation that halted a replica, if any.
    pub fn halted(&self, index: ReplicaIndex) -> Option<&str> {
        self.halted[index as usize].as_deref()
    }

    /// Mutable access to the network (partitions, healing).
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Run statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Current simulation time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Flag a replica as Byzantine with the given injected misbehavior.
    ///
    /// Panics unless the engine was configured with the `byzantine`
    /// testing flag.
    pub fn set_byzantine(&mut self, index: ReplicaIndex, mode: ByzantineMode) {
        assert!(
            self.replicas[index as usize].config().byzantine,
            "byzantine injection requires the byzantine config flag"
        );
        self.byzantine.insert(index, mode);
    }

    /// Submit a client request to one replica.
    pub fn submit_request(&mut self, index: ReplicaIndex, request: Request) {
        self.request_bodies.insert(request.digest(), request.clone());
        self.schedule(index, Duration::ZERO, Event::RequestSubmitted { request });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event Loop
    // ═══════════════════════════════════════════════════════════════════════

    fn schedule(&mut self, replica: ReplicaIndex, delay: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time: self.now + delay,
            priority: event.priority(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.event_queue.insert(key, (replica, event));
        key
    }

    /// Process events until the queue is empty or `until` is reached.
    pub fn run_until(&mut self, until: Duration) {
        while let Some((&key, _)) = self.event_queue.iter().next() {
            if key.time > until {
                break;
            }
            let (replica, event) = self.event_queue.remove(&key).expect("queued");
            self.now = key.time;

            // A fired timer leaves the registry; a cancelled or re-armed
            // one was already removed from the queue.
            match &event {
                Event::RequestTimer => {
                    self.timers.remove(&(replica, TimerId::Request));
                }
                Event::NewViewTimer => {
                    self.timers.remove(&(replica, TimerId::NewView));
                }
                _ => {}
            }

            if self.halted[replica as usize].is_some() {
                continue;
            }

            self.stats.events_processed += 1;
            trace!(replica, event = event.type_name(), now = ?self.now, "Processing event");

            self.replicas[replica as usize].set_time(self.now);
            match self.replicas[replica as usize].handle(event) {
                Ok(actions) => {
                    self.stats.actions_generated += actions.len() as u64;
                    for action in actions {
                        self.execute_action(replica, action);
                    }
                }
                Err(violation) => {
                    warn!(replica, %violation, "Replica halted");
                    self.halted[replica as usize] = Some(violation.to_string());
                }
            }
        }
        self.now = until.max(self.now);
    }

    /// Advance the simulation by `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        self.run_until(until);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action Execution
    // ═══════════════════════════════════════════════════════════════════════

    fn execute_action(&mut self, from: ReplicaIndex, action: Action) {
        match action {
            Action::Broadcast {
                message,
                include_self,
            } => {
                if include_self {
                    self.schedule(
                        from,
                        Duration::ZERO,
                        Event::MessageReceived {
                            message: message.clone(),
                        },
                    );
                }
                for to in 0..self.network.num_replicas() {
                    if to == from {
                        continue;
                    }
                    self.send(from, to, message.clone());
                }
            }
            Action::Unicast { message, to } => {
                let to = to.0 as ReplicaIndex;
                if to == from {
                    self.schedule(from, Duration::ZERO, Event::MessageReceived { message });
                } else {
                    self.send(from, to, message);
                }
            }
            Action::SetTimer { id, duration } => {
                self.stats.timers_set += 1;
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let event = match id {
                    TimerId::Request => Event::RequestTimer,
                    TimerId::NewView => Event::NewViewTimer,
                };
                let key = self.schedule(from, duration, event);
                self.timers.insert((from, id), key);
            }
            Action::CancelTimer { id } => {
                self.stats.timers_cancelled += 1;
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
            }
            Action::Deliver { seq_no, request } => {
                let digest = request.digest();
                self.request_bodies.insert(digest, request);
                self.app_log[from as usize].push((seq_no, digest));
                self.delivered[from as usize].push((seq_no, digest));
            }
            Action::ComputeStateDigest { seq_no } => {
                let digest = Self::state_digest(&self.app_log[from as usize], seq_no);
                self.state_digests[from as usize].insert(seq_no, digest);
                self.schedule(from, Duration::ZERO, Event::StateDigest { seq_no, digest });
            }
            Action::ViewChanged { view } => {
                debug!(replica = from, view, "Replica entered view");
                self.view_changes[from as usize].push(view);
            }
            Action::FetchRequest { digest } => {
                // Served from the global request registry with one network
                // round-trip of latency.
                if let Some(request) = self.request_bodies.get(&digest).cloned() {
                    let delay = self.network.should_deliver(from, from, &mut self.rng);
                    let delay = delay.unwrap_or_default() * 2;
                    self.schedule(
                        from,
                        delay,
                        Event::MessageReceived {
                            message: ConsensusMessage::Request(request),
                        },
                    );
                } else {
                    debug!(replica = from, %digest, "Fetch failed: unknown request");
                }
            }
            Action::FetchCheckpoint { seq_no } => {
                // State transfer from any replica that computed the digest.
                let provider = (0..self.network.num_replicas())
                    .find(|&r| self.state_digests[r as usize].contains_key(&seq_no));
                let Some(provider) = provider else {
                    debug!(replica = from, seq_no, "Fetch failed: no checkpoint provider");
                    return;
                };
                let digest = self.state_digests[provider as usize][&seq_no];
                // Adopt the provider's application state up to seq_no.
                let prefix: Vec<(u64, Digest)> = self.app_log[provider as usize]
                    .iter()
                    .copied()
                    .filter(|(n, _)| *n <= seq_no)
                    .collect();
                self.app_log[from as usize] = prefix;
                let delay = self
                    .network
                    .should_deliver(from, from, &mut self.rng)
                    .unwrap_or_default()
                    * 2;
                self.schedule(from, delay, Event::CheckpointInstalled { seq_no, digest });
            }
        }
    }

    /// Schedule a peer-to-peer message, applying Byzantine mutation,
    /// partitions, loss and latency.
    fn send(&mut self, from: ReplicaIndex, to: ReplicaIndex, message: ConsensusMessage) {
        let message = match self.byzantine.get(&from) {
            Some(ByzantineMode::Silent) => {
                trace!(from, to, "Suppressed outbound message (silent)");
                return;
            }
            Some(ByzantineMode::EquivocatePrePrepare) => self.equivocate(from, to, message),
            None => message,
        };

        match self.network.should_deliver(from, to, &mut self.rng) {
            Some(latency) => {
                self.stats.messages_sent += 1;
                self.schedule(to, latency, Event::MessageReceived { message });
            }
            None => {
                self.stats.messages_dropped += 1;
            }
        }
    }

    /// Equivocation: for odd recipients, re-sign the pre-prepare with a
    /// different pooled request digest.
    fn equivocate(
        &mut self,
        from: ReplicaIndex,
        to: ReplicaIndex,
        message: ConsensusMessage,
    ) -> ConsensusMessage {
        let ConsensusMessage::PrePrepare(pp) = &message else {
            return message;
        };
        if to % 2 == 0 {
            return message;
        }
        let Some((&other, _)) = self
            .request_bodies
            .iter()
            .find(|(digest, _)| **digest != pp.digest)
        else {
            return message;
        };
        warn!(from, to, seq_no = pp.seq_no, "Injecting equivocating pre-prepare");
        ConsensusMessage::PrePrepare(PrePrepare::new(
            pp.view,
            pp.seq_no,
            other,
            pp.replica,
            &self.keys[from as usize],
        ))
    }

    /// Application state digest: a chain hash over the delivered log up
    /// to `seq_no`. Identical logs produce identical digests on every
    /// replica.
    fn state_digest(log: &[(u64, Digest)], seq_no: u64) -> Digest {
        let mut acc = palisade_pbft::genesis_digest();
        for (n, digest) in log.iter().filter(|(n, _)| *n <= seq_no) {
            acc = Digest::hash_parts(&[acc.as_bytes(), &n.to_le_bytes(), digest.as_bytes()]);
        }
        acc
    }
}
