//! Core vocabulary for the Palisade replica state machine.
//!
//! This crate defines the event-driven model shared by the engine and its
//! hosts:
//!
//! - [`Event`]: all possible inputs to the state machine
//! - [`Action`]: all possible outputs from the state machine
//! - [`EventPriority`]: ordering priority for events at the same timestamp
//! - [`StateMachine`]: the trait the replica engine implements
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no .await
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates self, but performs no I/O
//!
//! All I/O is handled by the host (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

#![warn(missing_docs)]

mod action;
mod event;

pub use action::Action;
pub use event::{Event, EventPriority};

use std::time::Duration;

/// Type alias for timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Per-request progress timer; expiry triggers a view change.
    Request,
    /// New-view backoff timer; guards against a faulty prospective primary.
    NewView,
}

/// A detected safety contradiction.
///
/// This is the only irrecoverable error: the engine's state can no longer
/// be trusted and the host must halt it. Everything else is recovered
/// locally by dropping or deferring the offending message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// The interface between a replica state machine and its host.
pub trait StateMachine {
    /// Advance the machine's clock. Called by the host before handling
    /// each event.
    fn set_time(&mut self, now: Duration);

    /// Process one event to completion, returning the actions to execute.
    ///
    /// An `Err` means a safety invariant was violated; the host must stop
    /// driving the machine.
    fn handle(&mut self, event: Event) -> Result<Vec<Action>, InvariantViolation>;
}
