//! Pure blame computations over what a session recorded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{BlameNode, Evidence};
use crate::{
    p2p::PeerId,
    tss::types::{Party, RoundInfo, RoundSchedule},
};

/// Blaming more than `threshold` peers is not trustworthy: drop the whole set.
pub fn threshold_guard(nodes: Vec<BlameNode>, threshold: usize) -> Vec<BlameNode> {
    if nodes.len() > threshold {
        vec![]
    } else {
        nodes
    }
}

/// Members other than the local peer that did not send their unicast share.
pub fn unicast_blame(party: &Party, senders: &BTreeSet<PeerId>) -> Vec<BlameNode> {
    party
        .others()
        .filter(|member| !senders.contains(&member.peer_id))
        .map(|member| BlameNode::new(&member.pubkey))
        .collect()
}

/// Members other than the local peer that delivered no accepted broadcast,
/// with the signed message attached for peers caught equivocating.
pub fn broadcast_blame(
    party: &Party,
    delivered: &BTreeSet<PeerId>,
    equivocators: &BTreeMap<PeerId, Evidence>,
) -> Vec<BlameNode> {
    party
        .others()
        .filter_map(|member| match equivocators.get(&member.peer_id) {
            Some(evidence) => Some(BlameNode::with_evidence(&member.pubkey, evidence)),
            None if !delivered.contains(&member.peer_id) => Some(BlameNode::new(&member.pubkey)),
            None => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingShare {
    pub round: String,
    pub is_unicast: bool,
    pub nodes: Vec<BlameNode>,
}

/// Find the first round in which not every other member had a share
/// accepted and blame those that contributed to the previous round but not
/// to this one. For the first round every other member counts as a
/// contributor of the "previous" round.
pub fn missing_share_blame(
    party: &Party,
    schedule: &RoundSchedule,
    accepted: &HashMap<RoundInfo, BTreeSet<PeerId>>,
) -> Option<MissingShare> {
    let mut per_round: BTreeMap<usize, BTreeSet<&PeerId>> = BTreeMap::new();
    for (info, peers) in accepted {
        per_round.entry(info.index).or_default().extend(peers.iter());
    }

    let others: BTreeSet<&PeerId> = party.others().map(|m| &m.peer_id).collect();
    let empty: BTreeSet<&PeerId> = BTreeSet::new();
    let mut previous = others.clone();

    for (index, info) in schedule.rounds().iter().enumerate() {
        let current: BTreeSet<&PeerId> = per_round
            .get(&index)
            .unwrap_or(&empty)
            .intersection(&others)
            .copied()
            .collect();
        if current.len() < others.len() {
            let nodes = previous
                .difference(&current)
                .filter_map(|peer| party.pubkey_of(peer))
                .map(BlameNode::new)
                .collect();
            return Some(MissingShare {
                round: info.name.clone(),
                is_unicast: info.is_unicast,
                nodes,
            });
        }
        previous = current;
    }
    None
}

/// Keys whose peers are not among the `online` peers of a join-party attempt.
pub fn node_sync_blame(keys: &[String], online: &[PeerId]) -> Vec<BlameNode> {
    keys.iter()
        .filter(|key| !online.contains(&PeerId::from_pubkey(key)))
        .map(|key| BlameNode::new(key))
        .collect()
}
