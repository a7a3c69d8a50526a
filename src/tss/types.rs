//! Party membership, round schedules and request identities.

use std::collections::BTreeSet;

use anyhow::anyhow;
use sha2::{Digest, Sha256};

use super::{keygen::KeygenRequest, keysign::KeysignRequest};
use crate::{p2p::PeerId, TssResult};

/// Maximum number of faulty parties tolerated in a party of `n`: ceil(2n/3) - 1
pub fn get_threshold(n: usize) -> TssResult<usize> {
    if n == 0 {
        return Err(anyhow!("party must not be empty"));
    }
    Ok((2 * n + 2) / 3 - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyMember {
    pub index: usize,
    pub pubkey: String,
    pub peer_id: PeerId,
}

/// Participants of a session, sorted by public key. A member's index is its
/// position in that order and is the same on every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    members: Vec<PartyMember>,
    local_index: usize,
}

impl Party {
    pub fn new(keys: &[String], local_pubkey: &str) -> TssResult<Self> {
        let sorted: BTreeSet<&String> = keys.iter().collect();
        if sorted.len() != keys.len() {
            return Err(anyhow!("duplicate keys among {} participants", keys.len()));
        }
        let members: Vec<PartyMember> = sorted
            .into_iter()
            .enumerate()
            .map(|(index, key)| PartyMember {
                index,
                pubkey: key.clone(),
                peer_id: PeerId::from_pubkey(key),
            })
            .collect();
        let local_index = members
            .iter()
            .position(|m| m.pubkey == local_pubkey)
            .ok_or_else(|| anyhow!("local key is not among the participants"))?;
        Ok(Self {
            members,
            local_index,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[PartyMember] {
        &self.members
    }

    /// All members but the local one
    pub fn others(&self) -> impl Iterator<Item = &PartyMember> {
        let local = self.local_index;
        self.members.iter().filter(move |m| m.index != local)
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn local_member(&self) -> &PartyMember {
        &self.members[self.local_index]
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_member().peer_id
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.index_of(peer).is_some()
    }

    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.members.iter().position(|m| &m.peer_id == peer)
    }

    pub fn peer_id_of(&self, index: usize) -> Option<&PeerId> {
        self.members.get(index).map(|m| &m.peer_id)
    }

    pub fn pubkey_of(&self, peer: &PeerId) -> Option<&str> {
        self.members
            .iter()
            .find(|m| &m.peer_id == peer)
            .map(|m| m.pubkey.as_str())
    }

    pub fn pubkey_at(&self, index: usize) -> Option<&str> {
        self.members.get(index).map(|m| m.pubkey.as_str())
    }

    pub fn pubkeys(&self) -> Vec<String> {
        self.members.iter().map(|m| m.pubkey.clone()).collect()
    }

    pub fn peers_except_local(&self) -> Vec<PeerId> {
        self.others().map(|m| m.peer_id.clone()).collect()
    }
}

/// Identifies the accepted-share slot of one round of one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundInfo {
    pub index: usize,
    pub round: String,
    pub msg_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSpec {
    pub name: String,
    pub is_unicast: bool,
}

/// Ordered rounds of an engine's protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSchedule {
    rounds: Vec<RoundSpec>,
}

impl RoundSchedule {
    /// `(name, is_unicast)` pairs in protocol order
    pub fn new(rounds: &[(&str, bool)]) -> Self {
        Self {
            rounds: rounds
                .iter()
                .map(|(name, is_unicast)| RoundSpec {
                    name: name.to_string(),
                    is_unicast: *is_unicast,
                })
                .collect(),
        }
    }

    pub fn rounds(&self) -> &[RoundSpec] {
        &self.rounds
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn index_of(&self, round: &str) -> Option<usize> {
        self.rounds.iter().position(|r| r.name == round)
    }

    pub fn is_unicast(&self, round: &str) -> bool {
        self.rounds
            .iter()
            .any(|r| r.name == round && r.is_unicast)
    }

    /// The latest unicast round at or before `index`
    pub fn last_unicast_round_up_to(&self, index: usize) -> Option<&RoundSpec> {
        self.rounds
            .iter()
            .take(index + 1)
            .filter(|r| r.is_unicast)
            .last()
    }
}

/// A request whose digest is the session id all participants agree on
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    Keygen(&'a KeygenRequest),
    Keysign(&'a KeysignRequest),
}

impl Request<'_> {
    /// Hex-encoded sha256 over the order-independent content of the request
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Request::Keygen(req) => {
                hasher.update(b"keygen");
                for key in sorted(&req.keys) {
                    hasher.update(key.as_bytes());
                    hasher.update(b",");
                }
                hasher.update(req.block_height.to_le_bytes());
            }
            Request::Keysign(req) => {
                hasher.update(b"keysign");
                hasher.update(req.pool_pub_key.as_bytes());
                for msg in sorted(&req.messages) {
                    hasher.update(msg.as_bytes());
                    hasher.update(b",");
                }
                hasher.update(req.block_height.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

fn sorted(items: &[String]) -> Vec<&String> {
    let mut items: Vec<&String> = items.iter().collect();
    items.sort();
    items
}
