//! Chooses the join-party variant for a request.

use anyhow::anyhow;
use tracing::warn;

use crate::TssResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPartyMode {
    Leaderless,
    Leader,
}

pub trait JoinPartyPolicy: Send + Sync {
    fn mode(&self, version: &str) -> JoinPartyMode;
}

/// Requests at or above `leader_since` use the leader-based join, older ones the leaderless one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGate {
    leader_since: Vec<u64>,
}

impl VersionGate {
    pub fn new(leader_since: &str) -> TssResult<Self> {
        let leader_since = parse_version(leader_since)
            .ok_or_else(|| anyhow!("invalid version {}", leader_since))?;
        Ok(Self { leader_since })
    }
}

impl JoinPartyPolicy for VersionGate {
    fn mode(&self, version: &str) -> JoinPartyMode {
        match parse_version(version) {
            Some(v) if v >= self.leader_since => JoinPartyMode::Leader,
            Some(_) => JoinPartyMode::Leaderless,
            None => {
                warn!("unparsable request version {:?}, joining without leader", version);
                JoinPartyMode::Leaderless
            }
        }
    }
}

/// "v1.2" and "1.2.0" parse to the same version
fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches('v');
    let mut parts = version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.resize(3, 0);
    Some(parts)
}
