//! Deterministic event ordering.

use palisade_core::EventPriority;
use std::time::Duration;

/// Total order over simulation events.
///
/// Events are processed by time, then by priority within the same
/// timestamp (internal → timer → network → client), then FIFO by
/// insertion sequence. The sequence also makes every key unique, so the
/// queue can be a plain `BTreeMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    /// Simulation time at which the event fires.
    pub time: Duration,
    /// Priority within the timestamp.
    pub priority: EventPriority,
    /// Insertion sequence, for FIFO tie-breaking and uniqueness.
    pub sequence: u64,
}
