//! Boundary to the external multi-party computation engine.
//!
//! The core never looks inside protocol payloads. An engine instance is
//! started per session and talks to the session driver through channels:
//! it emits [EngineMessage]s, consumes [InboundShare]s and finally reports
//! its output or an [EngineError] on the `done` channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::types::{Party, RoundSchedule};
use crate::kv_manager::KeygenLocalState;

/// Capacity of the channels between the driver and an engine instance
pub const ENGINE_CHANNEL_SIZE: usize = 256;

/// Session parameters handed to an engine instance
#[derive(Debug, Clone)]
pub struct PartyContext {
    pub msg_id: String,
    pub party: Arc<Party>,
    pub threshold: usize,
}

/// A message produced by the local engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMessage {
    pub round: String,
    /// party indices of the recipients, `None` for a broadcast
    pub to: Option<Vec<usize>>,
    pub payload: Vec<u8>,
}

/// An accepted message from another party, in arrival order per round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundShare {
    pub from: usize,
    pub round: String,
    pub is_broadcast: bool,
    pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("parties {culprits:?} sent invalid shares in round {round}")]
    Culprits {
        culprits: Vec<usize>,
        round: String,
        is_unicast: bool,
    },
    #[error("engine failure: {0}")]
    Internal(String),
}
pub type EngineResult<Success> = Result<Success, EngineError>;

pub struct EngineChannels<Output> {
    pub outbound: mpsc::Receiver<EngineMessage>,
    pub inbound: mpsc::Sender<InboundShare>,
    pub done: oneshot::Receiver<EngineResult<Output>>,
}

pub trait MpcEngine: Send + Sync {
    type Input: Send;
    type Output: Send + 'static;

    fn rounds(&self) -> RoundSchedule;
    fn start(&self, ctx: PartyContext, input: Self::Input)
        -> EngineResult<EngineChannels<Self::Output>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenOutput {
    pub pub_key: Vec<u8>,
    /// the engine's local share, opaque to the core
    pub local_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct KeysignInput {
    pub local_state: KeygenLocalState,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub msg: String,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub recovery_id: Vec<u8>,
}

pub type KeygenEngine = dyn MpcEngine<Input = (), Output = KeygenOutput>;
pub type KeysignEngine = dyn MpcEngine<Input = KeysignInput, Output = Vec<Signature>>;
