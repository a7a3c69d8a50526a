//! Peer identities and the node key used to authenticate messages.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque network identity derived from a participant's public key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id that belongs to `pubkey`.
    /// Every node computes the same id for the same key.
    pub fn from_pubkey(pubkey: &str) -> Self {
        let digest = Sha256::digest(pubkey.as_bytes());
        PeerId(hex::encode(&digest[..20]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local node key. Signing and verification are provided by the
/// validator's keyring; this core only moves signatures around.
pub trait Signer: Send + Sync {
    /// public key of the local node
    fn pubkey(&self) -> &str;
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    fn verify(&self, pubkey: &str, data: &[u8], signature: &[u8]) -> bool;
}
