//! Wire types exchanged between session peers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{p2p::PeerId, TssResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    KeygenMsg,
    KeysignMsg,
    KeygenVerMsg,
    KeysignVerMsg,
}

impl MessageType {
    /// The type that carries broadcast confirmations for this protocol type
    pub fn verification(self) -> Self {
        match self {
            MessageType::KeygenMsg | MessageType::KeygenVerMsg => MessageType::KeygenVerMsg,
            MessageType::KeysignMsg | MessageType::KeysignVerMsg => MessageType::KeysignVerMsg,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::KeygenMsg => "keygen",
            MessageType::KeysignMsg => "keysign",
            MessageType::KeygenVerMsg => "keygen verification",
            MessageType::KeysignVerMsg => "keysign verification",
        };
        f.write_str(name)
    }
}

/// Outer envelope of everything sent on a Tss stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWrapper {
    pub message_type: MessageType,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRouting {
    pub from: PeerId,
    /// `None` for broadcasts
    pub to: Option<Vec<PeerId>>,
    pub round: String,
}

/// A protocol message produced by an engine, signed by its sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub routing: MessageRouting,
    pub msg_id: String,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WireMessage {
    pub fn is_broadcast(&self) -> bool {
        self.routing.to.is_none()
    }

    /// Echo-cache key: one broadcast per sender and round
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.routing.from, self.routing.round)
    }

    /// The bytes covered by [WireMessage::signature]
    pub fn signing_bytes(&self) -> TssResult<Vec<u8>> {
        Ok(bincode::serialize(&(
            &self.msg_id,
            &self.routing,
            &self.payload,
        ))?)
    }

    pub fn payload_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.payload))
    }
}

/// Echo of the hash of a received broadcast, signed by the echoing peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfirm {
    pub from: PeerId,
    pub msg_id: String,
    /// [WireMessage::cache_key] of the echoed broadcast
    pub key: String,
    pub round: String,
    pub hash: String,
    pub signature: Vec<u8>,
}

impl BroadcastConfirm {
    /// The bytes covered by [BroadcastConfirm::signature]
    pub fn signing_bytes(&self) -> TssResult<Vec<u8>> {
        Ok(bincode::serialize(&(
            &self.msg_id,
            &self.from,
            &self.key,
            &self.round,
            &self.hash,
        ))?)
    }
}
