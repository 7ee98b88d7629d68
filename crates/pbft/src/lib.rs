//! PBFT replica state machine.
//!
//! This crate implements a Practical Byzantine Fault Tolerance ordering
//! engine: `N = 3f+1` replicas totally order client requests while up to
//! `f` of them misbehave arbitrarily.
//!
//! # Architecture
//!
//! The engine is a synchronous state machine driven by events:
//!
//! - `Event::RequestSubmitted` → the primary assigns a sequence number and
//!   broadcasts a pre-prepare
//! - `Event::MessageReceived` → normal-case voting (prepare, commit),
//!   checkpointing, or the view-change protocol
//! - `Event::RequestTimer` / `Event::NewViewTimer` → liveness: abandon a
//!   silent primary, back off a faulty prospective one
//!
//! All I/O is performed by the host via returned `Action`s: broadcasts,
//! ordered delivery, state-digest requests, and missing-data fetches.
//!
//! # Protocol
//!
//! ```text
//! Request → PrePrepare → Prepare ×2f → Commit ×2f+1 → Deliver
//!                                                       │
//!                        every K deliveries:            ▼
//!                        Checkpoint ×2f+1  →  watermarks advance, log GC
//! ```
//!
//! A replica that sees no progress moves to view `v+1` and broadcasts a
//! VIEW-CHANGE carrying its prepared (P), pre-prepared (Q) and stable
//! checkpoint (C) evidence. The new primary assembles `2f+1` of those
//! into a NEW-VIEW whose X set re-assigns every in-flight sequence
//! number; each backup re-derives the X set before accepting it.
//!
//! # Safety
//!
//! - **Agreement**: no two correct replicas deliver different requests at
//!   the same sequence number, in any view.
//! - **Ordered delivery**: each replica delivers exactly once per
//!   sequence number, gap-free and ascending.
//! - **View-change safety**: a request committed-local anywhere survives
//!   into every later view with the same sequence number.

#![warn(missing_docs)]

mod certificate;
mod checkpoint;
mod config;
mod error;
mod requests;
mod state;
mod view_change;

#[cfg(test)]
pub(crate) mod test_util;

pub use certificate::{Certificate, CertificateStore};
pub use checkpoint::CheckpointStore;
pub use config::PbftConfig;
pub use error::{ConfigError, ProtocolError};
pub use requests::RequestStore;
pub use state::{genesis_digest, PbftState};
