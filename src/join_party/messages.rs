use serde::{Deserialize, Serialize};

use crate::p2p::PeerId;

/// Messages of the join-party handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPartyMsg {
    /// signed "ready" for `msg_id`
    Request { msg_id: String, signature: Vec<u8> },
    /// leaderless: the sender has registered the session and counted the requester
    Ack { msg_id: String },
    /// the session is unknown to the sender, or the sender does not lead it
    NotReady { msg_id: String },
    /// leader decision: `peers` take part in the session
    Start { msg_id: String, peers: Vec<PeerId> },
    /// leader decision: quorum was not reached; `peers` were online
    Abort { msg_id: String, peers: Vec<PeerId> },
}
