//! Shared helpers for engine unit tests.

use crate::config::PbftConfig;
use crate::state::{genesis_digest, PbftState};
use palisade_core::{Action, Event, StateMachine, TimerId};
use palisade_messages::{
    Checkpoint, CheckpointEntry, Commit, ConsensusMessage, NewView, PqEntry, PrePrepare, Prepare,
    ViewChange,
};
use palisade_types::{ClientId, Digest, KeyPair, ReplicaId, ReplicaInfo, Request, Topology};
use std::sync::Arc;
use std::time::Duration;

/// One replica under test plus the key material of its whole network.
pub struct Harness {
    pub state: PbftState,
    pub keys: Vec<KeyPair>,
}

impl Harness {
    /// A fresh replica `id` of an `n`-replica network with `K = 10`.
    pub fn new(n: usize, id: u64) -> Self {
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let replicas: Vec<ReplicaInfo> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| ReplicaInfo {
                replica_id: ReplicaId(i as u64),
                public_key: key.public_key(),
            })
            .collect();
        let topology = Arc::new(Topology::new(ReplicaId(id), replicas));
        let config = PbftConfig {
            checkpoint_period: 10,
            request_timeout: Duration::from_secs(5),
            new_view_timeout: Duration::from_secs(5),
            byzantine: false,
        };
        let state = PbftState::new(keys[id as usize].clone(), topology, config).unwrap();
        Self { state, keys }
    }

    pub fn key_of(&self, id: u64) -> &KeyPair {
        &self.keys[id as usize]
    }

    /// A client request with a deterministic payload.
    pub fn request(&self, seed: u8) -> Request {
        let client_key = KeyPair::from_seed(&[100 + seed; 32]);
        Request::new(vec![seed], ClientId(seed as u64), seed as u64, &client_key)
    }

    pub fn receive(&mut self, message: ConsensusMessage) -> Vec<Action> {
        self.state
            .handle(Event::MessageReceived { message })
            .unwrap()
    }

    pub fn submit(&mut self, request: Request) -> Vec<Action> {
        self.state
            .handle(Event::RequestSubmitted { request })
            .unwrap()
    }

    pub fn relay_request(&mut self, request: Request) -> Vec<Action> {
        self.receive(ConsensusMessage::Request(request))
    }

    pub fn state_digest(&mut self, seq_no: u64, digest: Digest) -> Vec<Action> {
        self.state
            .handle(Event::StateDigest { seq_no, digest })
            .unwrap()
    }

    pub fn deliver_pre_prepare(&mut self, view: u64, seq_no: u64, digest: Digest) -> Vec<Action> {
        let primary = view % self.keys.len() as u64;
        let pp = PrePrepare::new(view, seq_no, digest, ReplicaId(primary), self.key_of(primary));
        self.receive(ConsensusMessage::PrePrepare(pp))
    }

    pub fn deliver_prepare(
        &mut self,
        from: u64,
        view: u64,
        seq_no: u64,
        digest: Digest,
    ) -> Vec<Action> {
        let prepare = Prepare::new(view, seq_no, digest, ReplicaId(from), self.key_of(from));
        self.receive(ConsensusMessage::Prepare(prepare))
    }

    pub fn deliver_commit(
        &mut self,
        from: u64,
        view: u64,
        seq_no: u64,
        digest: Digest,
    ) -> Vec<Action> {
        let commit = Commit::new(view, seq_no, digest, ReplicaId(from), self.key_of(from));
        self.receive(ConsensusMessage::Commit(commit))
    }

    pub fn deliver_checkpoint(&mut self, from: u64, seq_no: u64, digest: Digest) -> Vec<Action> {
        let checkpoint = Checkpoint::new(seq_no, digest, ReplicaId(from), self.key_of(from));
        self.receive(ConsensusMessage::Checkpoint(checkpoint))
    }

    /// Build a signed VIEW-CHANGE from another replica.
    pub fn view_change_from(
        &self,
        from: u64,
        view: u64,
        h: u64,
        c_set: Vec<CheckpointEntry>,
        p_set: Vec<PqEntry>,
        q_set: Vec<PqEntry>,
    ) -> ViewChange {
        ViewChange::new(
            view,
            h,
            c_set,
            p_set,
            q_set,
            ReplicaId(from),
            self.key_of(from),
        )
    }

    /// Push the replica into a view change directly.
    pub fn force_view_change(&mut self) -> Vec<Action> {
        self.state.send_view_change().unwrap()
    }

    /// Feed back every broadcast with `include_self` as an inbound message,
    /// the way a host loops a replica's own votes. Returns the actions the
    /// loopbacks produced.
    pub fn loopback_own(&mut self, actions: &[Action]) -> Vec<Action> {
        let own: Vec<ConsensusMessage> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast {
                    message,
                    include_self: true,
                } => Some(message.clone()),
                _ => None,
            })
            .collect();
        let mut produced = vec![];
        for message in own {
            produced.extend(self.receive(message));
        }
        produced
    }

    /// Drive a full commit of `(seq_no, digest)` at this backup.
    ///
    /// Assumes a four-replica network with the harness replica as id 1 and
    /// the request body already pooled. Returns the actions of the final
    /// commit (which include the delivery once the queue drains).
    pub fn commit_slot(&mut self, seq_no: u64, digest: Digest) -> Vec<Action> {
        let view = self.state.view();
        let primary = view % 4;
        assert_ne!(primary, 1, "commit_slot drives a backup");

        let actions = self.deliver_pre_prepare(view, seq_no, digest);
        self.loopback_own(&actions); // our prepare

        let other_backup = (0..4).find(|r| *r != 1 && *r != primary).unwrap();
        let actions = self.deliver_prepare(other_backup, view, seq_no, digest);
        self.loopback_own(&actions); // our commit

        self.deliver_commit(primary, view, seq_no, digest);
        self.deliver_commit(other_backup, view, seq_no, digest)
    }

    /// Commit and deliver slots `1..=through` with fresh requests.
    pub fn commit_through(&mut self, through: u64) {
        for seq_no in 1..=through {
            let request = self.request(seq_no as u8);
            let digest = request.digest();
            self.relay_request(request);
            self.commit_slot(seq_no, digest);
        }
        assert_eq!(self.state.last_exec(), through);
    }
}

/// The genesis C-set entry every replica starts from.
pub fn genesis_entry() -> CheckpointEntry {
    CheckpointEntry {
        seq_no: 0,
        state_digest: genesis_digest(),
    }
}

pub fn find_broadcast(actions: &[Action]) -> Option<&ConsensusMessage> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast { message, .. } => Some(message),
        _ => None,
    })
}

pub fn find_pre_prepare(actions: &[Action]) -> Option<&PrePrepare> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast {
            message: ConsensusMessage::PrePrepare(pp),
            ..
        } => Some(pp),
        _ => None,
    })
}

pub fn find_prepare(actions: &[Action]) -> Option<&Prepare> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast {
            message: ConsensusMessage::Prepare(p),
            ..
        } => Some(p),
        _ => None,
    })
}

pub fn find_commit(actions: &[Action]) -> Option<&Commit> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast {
            message: ConsensusMessage::Commit(c),
            ..
        } => Some(c),
        _ => None,
    })
}

pub fn find_view_change(actions: &[Action]) -> Option<&ViewChange> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast {
            message: ConsensusMessage::ViewChange(vc),
            ..
        } => Some(vc),
        _ => None,
    })
}

pub fn find_new_view(actions: &[Action]) -> Option<&NewView> {
    actions.iter().find_map(|a| match a {
        Action::Broadcast {
            message: ConsensusMessage::NewView(nv),
            ..
        } => Some(nv),
        _ => None,
    })
}

pub fn find_deliver(actions: &[Action]) -> Option<(u64, Request)> {
    actions.iter().find_map(|a| match a {
        Action::Deliver { seq_no, request } => Some((*seq_no, request.clone())),
        _ => None,
    })
}

pub fn has_set_timer(actions: &[Action], id: TimerId) -> bool {
    actions
        .iter()
        .any(|a| matches!(a, Action::SetTimer { id: timer, .. } if *timer == id))
}
