//! Peer-to-peer plumbing: peer identities, the network abstraction the core
//! runs on, the framed stream transport and per-session stream bookkeeping.

mod communication;
pub mod error;
pub mod identity;
pub mod memory;
pub mod stream;
mod stream_mgr;

#[cfg(test)]
mod tests;

pub use communication::Communication;
pub use error::{TransportError, TransportResult};
pub use identity::{PeerId, Signer};
pub use stream::PeerStream;
pub use stream_mgr::{StreamMgr, UNKNOWN_STREAM};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Protocols multiplexed over the peer network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// leaderless join-party handshake
    JoinParty,
    /// leader-based join-party handshake
    JoinPartyLeader,
    /// keygen/keysign protocol and verification messages
    Tss,
}

/// A peer currently known to the network together with its dialable addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<String>,
}

/// A stream opened by a remote peer
pub struct InboundStream {
    pub protocol: ProtocolId,
    pub stream: Box<dyn PeerStream>,
}

/// Authenticated peer network. Implementations guarantee that
/// [PeerStream::remote_peer] is the authenticated identity of the other end.
/// Inbound streams are handed to the core through the channel the network
/// was constructed with.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    fn local_peer_id(&self) -> &PeerId;
    fn connected_peers(&self) -> Vec<PeerInfo>;
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: ProtocolId,
    ) -> TransportResult<Box<dyn PeerStream>>;
}
