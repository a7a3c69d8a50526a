//! Custom error types for [crate::join_party]

use crate::p2p::PeerId;

use super::NO_LEADER;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinPartyError {
    #[error("timed out with {} peers online", online.len())]
    Timeout { online: Vec<PeerId> },
    #[error("leader {leader} did not reach quorum, {} peers online", online.len())]
    InsufficientQuorum { online: Vec<PeerId>, leader: PeerId },
    #[error("leader {leader} is unreachable")]
    LeaderUnreachable { leader: PeerId },
    #[error("leader {leader} started the session without the local peer")]
    NotSelected { online: Vec<PeerId>, leader: PeerId },
    #[error("stopped")]
    Stopped { leader: Option<PeerId> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
pub type JoinPartyResult<Success> = Result<Success, JoinPartyError>;

impl JoinPartyError {
    /// Peers known to be online when the join failed
    pub fn online(&self) -> &[PeerId] {
        match self {
            JoinPartyError::Timeout { online }
            | JoinPartyError::InsufficientQuorum { online, .. }
            | JoinPartyError::NotSelected { online, .. } => online,
            _ => &[],
        }
    }

    pub fn leader(&self) -> Option<&PeerId> {
        match self {
            JoinPartyError::InsufficientQuorum { leader, .. }
            | JoinPartyError::LeaderUnreachable { leader }
            | JoinPartyError::NotSelected { leader, .. } => Some(leader),
            JoinPartyError::Stopped { leader } => leader.as_ref(),
            _ => None,
        }
    }

    /// Leader for log output, [NO_LEADER] if the join had none
    pub fn leader_label(&self) -> String {
        self.leader()
            .map_or_else(|| NO_LEADER.to_string(), PeerId::to_string)
    }
}
