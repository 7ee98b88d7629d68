//! Client requests.

use crate::{ClientId, Digest, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// A client-signed request payload.
///
/// Requests are content-addressed: the digest covers the payload, client
/// id and timestamp, and is the key under which the request travels
/// through the ordering protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Submitting client.
    pub client: ClientId,
    /// Client-supplied timestamp (milliseconds since epoch). Used only to
    /// distinguish repeated submissions of the same payload.
    pub timestamp: u64,
    /// Client signature over the digested fields.
    pub signature: Signature,
}

impl Request {
    /// Create and sign a request.
    pub fn new(payload: Vec<u8>, client: ClientId, timestamp: u64, key: &KeyPair) -> Self {
        let signature = key.sign(&Self::signing_bytes(&payload, client, timestamp));
        Self {
            payload,
            client,
            timestamp,
            signature,
        }
    }

    /// The content digest identifying this request.
    pub fn digest(&self) -> Digest {
        Digest::hash_parts(&[
            b"request:",
            &self.payload,
            &self.client.0.to_le_bytes(),
            &self.timestamp.to_le_bytes(),
        ])
    }

    /// Verify the client signature.
    pub fn verify(&self, client_key: &PublicKey) -> bool {
        client_key.verify(
            &Self::signing_bytes(&self.payload, self.client, self.timestamp),
            &self.signature,
        )
    }

    fn signing_bytes(payload: &[u8], client: ClientId, timestamp: u64) -> Vec<u8> {
        let mut message = Vec::with_capacity(payload.len() + 24);
        message.extend_from_slice(b"request:");
        message.extend_from_slice(payload);
        message.extend_from_slice(&client.0.to_le_bytes());
        message.extend_from_slice(&timestamp.to_le_bytes());
        message
    }
}
