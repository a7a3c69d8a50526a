//! Fault attribution for failed keygen and keysign sessions.
//!
//! [compute] holds the pure blame functions; [BlameManager] records what a
//! session saw and runs them in priority order when the session fails.

pub mod compute;
mod manager;

#[cfg(test)]
mod tests;

pub use compute::{
    broadcast_blame, missing_share_blame, node_sync_blame, threshold_guard, unicast_blame,
    MissingShare,
};
pub use manager::{BlameManager, SessionRecord};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailReason {
    HashCheckFail,
    Timeout,
    SyncFail,
    BrokenShare,
    InternalError,
    NotSelected,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::HashCheckFail => "hash check failed",
            FailReason::Timeout => "timeout",
            FailReason::SyncFail => "signers fail to sync before keygen/keysign",
            FailReason::BrokenShare => "tss share verification failed",
            FailReason::InternalError => "internal error",
            FailReason::NotSelected => "not selected for this signing party",
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed message that proves a peer misbehaved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub round: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNode {
    pub pubkey: String,
    pub blame_data: Vec<u8>,
    pub blame_signature: Vec<u8>,
}

impl BlameNode {
    pub fn new(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            blame_data: vec![],
            blame_signature: vec![],
        }
    }

    pub fn with_evidence(pubkey: &str, evidence: &Evidence) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            blame_data: evidence.data.clone(),
            blame_signature: evidence.signature.clone(),
        }
    }
}

/// Outcome attached to every failed session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: Option<FailReason>,
    pub round: String,
    pub is_unicast: bool,
    pub blame_nodes: Vec<BlameNode>,
}

impl Blame {
    pub fn new(fail_reason: FailReason, blame_nodes: Vec<BlameNode>) -> Self {
        let mut blame = Self {
            fail_reason: Some(fail_reason),
            ..Default::default()
        };
        blame.add_blame_nodes(blame_nodes);
        blame
    }

    pub fn set_blame(
        &mut self,
        blame_nodes: Vec<BlameNode>,
        round: &str,
        is_unicast: bool,
    ) {
        self.blame_nodes.clear();
        self.add_blame_nodes(blame_nodes);
        self.round = round.to_string();
        self.is_unicast = is_unicast;
    }

    /// Append `nodes`, skipping pubkeys that are already blamed.
    pub fn add_blame_nodes(&mut self, nodes: Vec<BlameNode>) {
        for node in nodes {
            if !self.blame_nodes.iter().any(|n| n.pubkey == node.pubkey) {
                self.blame_nodes.push(node);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blame_nodes.is_empty()
    }

    pub fn pubkeys(&self) -> Vec<&str> {
        self.blame_nodes.iter().map(|n| n.pubkey.as_str()).collect()
    }
}

impl fmt::Display for Blame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.fail_reason.map_or("", |r| r.as_str());
        write!(
            f,
            "reason: {}, round: {}, nodes: {:?}",
            reason,
            self.round,
            self.pubkeys()
        )
    }
}
