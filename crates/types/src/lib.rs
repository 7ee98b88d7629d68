//! Foundational types for the Palisade ordering engine.
//!
//! This crate provides the types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: [`Digest`], cryptographic keys and signatures
//! - **Identifiers**: [`ReplicaId`], [`ClientId`]
//! - **Requests**: the client-signed, content-addressed [`Request`]
//! - **Topology**: the fixed `N = 3f+1` replica set and its quorum sizes
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crate, making it the foundation layer.

#![warn(missing_docs)]

mod crypto;
mod hash;
mod identifiers;
mod request;
mod signing;
mod topology;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Digest, HexError};
pub use identifiers::{ClientId, ReplicaId};
pub use request::Request;
pub use signing::{
    checkpoint_message, vote_message, DOMAIN_CHECKPOINT, DOMAIN_COMMIT, DOMAIN_NEW_VIEW,
    DOMAIN_PREPARE, DOMAIN_PRE_PREPARE, DOMAIN_VIEW_CHANGE,
};
pub use topology::{ReplicaInfo, Topology};
