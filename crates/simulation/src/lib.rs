//! Deterministic multi-replica simulation for the Palisade engine.
//!
//! The runner owns one [`palisade_pbft::PbftState`] per replica and a
//! single totally ordered event queue. Network latency, jitter, packet
//! loss, partitions and Byzantine misbehavior are all driven by a seeded
//! RNG, so every run is reproducible: same seed, same script, same
//! delivery logs.
//!
//! Integration tests under `tests/` exercise the end-to-end protocol
//! scenarios: the happy path, checkpoint garbage collection, silent and
//! equivocating primaries, and recovery through view changes.

#![warn(missing_docs)]

mod event_queue;
mod network;
mod runner;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{ByzantineMode, SimulationRunner, SimulationStats};

/// Index of a replica in the simulation (equals its `ReplicaId`).
pub type ReplicaIndex = u32;
