//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::ReplicaIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of replicas (must be `3f+1`).
    pub num_replicas: u32,
    /// Base one-way message latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_replicas: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Network partitions (blocking communication between replica pairs)
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned pairs. If (a, b) is in this set, messages from a to b
    /// are dropped. Partitions are directional - both (a, b) and (b, a)
    /// make a bidirectional cut.
    partitions: HashSet<(ReplicaIndex, ReplicaIndex)>,
}

impl SimulatedNetwork {
    /// Create a new simulated network.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    /// Number of replicas in the network.
    pub fn num_replicas(&self) -> u32 {
        self.config.num_replicas
    }

    // ─── Partition Management ───

    /// Check if a message from `from` to `to` would be dropped.
    pub fn is_partitioned(&self, from: ReplicaIndex, to: ReplicaIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Create a unidirectional partition: messages from `from` to `to`
    /// are dropped.
    pub fn partition_unidirectional(&mut self, from: ReplicaIndex, to: ReplicaIndex) {
        self.partitions.insert((from, to));
    }

    /// Create a bidirectional partition between two replicas.
    pub fn partition_bidirectional(&mut self, a: ReplicaIndex, b: ReplicaIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Isolate a replica from every other replica.
    pub fn isolate_replica(&mut self, replica: ReplicaIndex) {
        for other in 0..self.config.num_replicas {
            if other != replica {
                self.partitions.insert((replica, other));
                self.partitions.insert((other, replica));
            }
        }
    }

    /// Heal a bidirectional partition between two replicas.
    pub fn heal_bidirectional(&mut self, a: ReplicaIndex, b: ReplicaIndex) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Heal all partitions.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    // ─── Message Delivery Decision ───

    /// Determine if a message should be delivered from `from` to `to`.
    ///
    /// Returns `None` if the message is dropped (partition or loss),
    /// `Some(latency)` otherwise.
    pub fn should_deliver(
        &self,
        from: ReplicaIndex,
        to: ReplicaIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }

        let base = self.config.latency.as_secs_f64();
        let jitter = base * self.config.jitter_fraction * (rng.gen::<f64>() * 2.0 - 1.0);
        Some(Duration::from_secs_f64((base + jitter).max(0.0)))
    }
}
