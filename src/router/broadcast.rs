//! Echo-based consistency check for broadcast messages.
//!
//! Every receiver of a broadcast echoes the hash of the copy it got to all
//! other peers. A broadcast is applied only once a quorum of receivers
//! (self included) report the same hash as the local copy. Once settled, the
//! consensus hash is kept so that late echoes are still checked against it.

use std::collections::{BTreeMap, HashMap};

use crate::p2p::PeerId;

use super::{BroadcastConfirm, WireMessage};

#[derive(Debug, Default)]
pub(super) struct EchoItem {
    pub(super) msg: Option<WireMessage>,
    local_hash: Option<String>,
    confirmations: BTreeMap<PeerId, String>,
    // signed echoes of remote peers, kept as evidence
    echoes: BTreeMap<PeerId, BroadcastConfirm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Consensus {
    /// not enough echoes yet
    Pending,
    /// a quorum agrees with the local copy; `divergent` echoed something else
    Agreed { hash: String, divergent: Vec<PeerId> },
    /// a quorum agrees on a hash different from the local copy
    LocalMismatch { hash: String, divergent: Vec<PeerId> },
    /// everybody echoed and no hash reached the quorum
    NoMajority,
}

/// Outcome of a broadcast whose echo check is over
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Settled {
    Hash(String),
    NoMajority,
}

impl EchoItem {
    fn consensus(&self, local: &PeerId, quorum: usize, receivers: usize) -> Consensus {
        let Some(local_hash) = &self.local_hash else {
            return Consensus::Pending;
        };
        if self.confirmations.len() < quorum {
            return Consensus::Pending;
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for hash in self.confirmations.values() {
            *counts.entry(hash.as_str()).or_default() += 1;
        }
        // ties resolve to the smallest hash
        let (top_hash, top_count) = counts
            .iter()
            .fold(("", 0), |best, (hash, count)| {
                if *count > best.1 {
                    (*hash, *count)
                } else {
                    best
                }
            });

        if top_count >= quorum {
            let divergent = self
                .confirmations
                .iter()
                .filter(|(peer, hash)| *peer != local && hash.as_str() != top_hash)
                .map(|(peer, _)| peer.clone())
                .collect();
            let hash = top_hash.to_string();
            if local_hash == top_hash {
                Consensus::Agreed { hash, divergent }
            } else {
                Consensus::LocalMismatch { hash, divergent }
            }
        } else if self.confirmations.len() >= receivers {
            Consensus::NoMajority
        } else {
            Consensus::Pending
        }
    }

    /// The signed echo `peer` sent, if it was a remote one
    pub(super) fn echo_of(&self, peer: &PeerId) -> Option<&BroadcastConfirm> {
        self.echoes.get(peer)
    }
}

#[derive(Debug, Default)]
pub(super) struct EchoCache {
    items: HashMap<String, EchoItem>,
    settled: HashMap<String, Settled>,
}

impl EchoCache {
    /// Store the local copy of a broadcast and count the local echo.
    /// Returns false if a copy for `key` was already stored or settled.
    pub(super) fn set_message(&mut self, key: &str, local: &PeerId, msg: WireMessage) -> bool {
        if self.settled.contains_key(key) {
            return false;
        }
        let item = self.items.entry(key.to_string()).or_default();
        if item.msg.is_some() {
            return false;
        }
        let hash = msg.payload_hash();
        item.confirmations.insert(local.clone(), hash.clone());
        item.local_hash = Some(hash);
        item.msg = Some(msg);
        true
    }

    /// Record a remote echo. Returns false for a repeated echo. Echoes of
    /// settled broadcasts are not counted, see [EchoCache::settled].
    pub(super) fn add_confirmation(&mut self, confirm: BroadcastConfirm) -> bool {
        let item = self.items.entry(confirm.key.clone()).or_default();
        if item.confirmations.contains_key(&confirm.from) {
            return false;
        }
        item.confirmations
            .insert(confirm.from.clone(), confirm.hash.clone());
        item.echoes.insert(confirm.from.clone(), confirm);
        true
    }

    pub(super) fn consensus(
        &self,
        key: &str,
        local: &PeerId,
        quorum: usize,
        receivers: usize,
    ) -> Consensus {
        self.items
            .get(key)
            .map_or(Consensus::Pending, |item| item.consensus(local, quorum, receivers))
    }

    pub(super) fn settled(&self, key: &str) -> Option<&Settled> {
        self.settled.get(key)
    }

    /// End the echo check of `key` and hand back what was collected for it.
    pub(super) fn settle(&mut self, key: &str, outcome: Settled) -> Option<EchoItem> {
        self.settled.insert(key.to_string(), outcome);
        self.items.remove(key)
    }
}

/// Number of matching echoes, self included, required before a broadcast is applied
pub(crate) fn echo_quorum(threshold: usize, party_size: usize) -> usize {
    threshold.clamp(1, party_size.saturating_sub(1).max(1))
}
