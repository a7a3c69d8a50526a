use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, info};

use super::{
    broadcast_blame, missing_share_blame, threshold_guard, unicast_blame, Blame, BlameNode,
    Evidence, FailReason,
};
use crate::{
    p2p::PeerId,
    router::WireMessage,
    tss::types::{Party, RoundInfo, RoundSchedule},
};

/// What a session observed, as far as blame is concerned
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    /// last message the local engine produced
    pub last_msg: Option<WireMessage>,
    /// accepted messages per round and sender
    pub round_msgs: HashMap<String, BTreeMap<PeerId, WireMessage>>,
    /// write-once set of senders per round
    pub accepted_shares: HashMap<RoundInfo, BTreeSet<PeerId>>,
    /// senders of accepted unicast messages per round
    pub last_unicast_peer: HashMap<String, BTreeSet<PeerId>>,
    pub equivocations: BTreeMap<PeerId, Evidence>,
    pub fail_reason: Option<FailReason>,
}

/// Records a session's progress and turns it into a [Blame] when the session fails.
/// Shared by the session's dispatcher and driver.
pub struct BlameManager {
    party: Arc<Party>,
    schedule: RoundSchedule,
    threshold: usize,
    record: Mutex<SessionRecord>,
}

impl BlameManager {
    pub fn new(party: Arc<Party>, schedule: RoundSchedule, threshold: usize) -> Self {
        Self {
            party,
            schedule,
            threshold,
            record: Mutex::new(SessionRecord::default()),
        }
    }

    pub fn set_last_msg(&self, msg: WireMessage) {
        self.lock().last_msg = Some(msg);
    }

    /// Mark the share of `peer` in `round` as accepted.
    /// Returns false if a share of `peer` was already accepted for that round.
    pub fn update_accepted_share(&self, round: RoundInfo, peer: &PeerId) -> bool {
        self.lock()
            .accepted_shares
            .entry(round)
            .or_default()
            .insert(peer.clone())
    }

    pub fn set_round_msg(&self, msg: WireMessage) {
        let mut record = self.lock();
        let from = msg.routing.from.clone();
        let round = msg.routing.round.clone();
        if !msg.is_broadcast() {
            record
                .last_unicast_peer
                .entry(round.clone())
                .or_default()
                .insert(from.clone());
        }
        record.round_msgs.entry(round).or_default().insert(from, msg);
    }

    pub fn record_equivocation(&self, peer: PeerId, evidence: Evidence) {
        let mut record = self.lock();
        record.equivocations.entry(peer).or_insert(evidence);
        record.fail_reason = Some(FailReason::HashCheckFail);
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        self.lock().fail_reason
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.lock().clone()
    }

    /// Members that did not send their unicast share for `round`
    pub fn unicast_blame(&self, round: &str) -> Vec<BlameNode> {
        let record = self.lock();
        match record.last_unicast_peer.get(round) {
            Some(senders) => unicast_blame(&self.party, senders),
            None => {
                debug!("no unicast share was accepted for {}", round);
                vec![]
            }
        }
    }

    /// Members that delivered no accepted broadcast for `round`, plus equivocators
    pub fn broadcast_blame(&self, round: &str) -> Vec<BlameNode> {
        let record = self.lock();
        let delivered: BTreeSet<PeerId> = record
            .round_msgs
            .get(round)
            .map(|msgs| msgs.keys().cloned().collect())
            .unwrap_or_default();
        let equivocators: BTreeMap<PeerId, Evidence> = record
            .equivocations
            .iter()
            .filter(|(_, evidence)| evidence.round == round)
            .map(|(peer, evidence)| (peer.clone(), evidence.clone()))
            .collect();
        broadcast_blame(&self.party, &delivered, &equivocators)
    }

    /// Blame for a session that stopped making progress. Tries unicast,
    /// broadcast and missing-share blame in that order; the first non-empty
    /// set within the threshold wins. `default_reason` applies unless the
    /// session already recorded a more specific one.
    pub fn stalled_session_blame(&self, default_reason: FailReason) -> Blame {
        let (last_msg, fail_reason, accepted) = {
            let record = self.lock();
            (
                record.last_msg.clone(),
                record.fail_reason,
                record.accepted_shares.clone(),
            )
        };
        let reason = fail_reason.unwrap_or(default_reason);
        let mut blame = Blame::new(reason, vec![]);

        // nothing was produced locally, there is no round to attribute
        let Some(last_msg) = last_msg else {
            info!("session failed before the first round: {}", reason);
            return blame;
        };
        let last_round = &last_msg.routing.round;
        let last_index = self.schedule.index_of(last_round).unwrap_or(0);

        if let Some(info) = self.schedule.last_unicast_round_up_to(last_index) {
            let nodes = self.unicast_blame(&info.name);
            if self.acceptable(&nodes) {
                blame.set_blame(nodes, &info.name, true);
                return blame;
            }
        }

        let nodes = self.broadcast_blame(last_round);
        if self.acceptable(&nodes) {
            blame.set_blame(nodes, last_round, false);
            return blame;
        }

        if let Some(missing) = missing_share_blame(&self.party, &self.schedule, &accepted) {
            if self.acceptable(&missing.nodes) {
                blame.set_blame(missing.nodes, &missing.round, missing.is_unicast);
                return blame;
            }
        }

        blame.round = last_round.clone();
        blame
    }

    /// Blame for peers the engine itself identified as culprits
    pub fn culprit_blame(&self, culprits: &[usize], round: &str, is_unicast: bool) -> Blame {
        let nodes = culprits
            .iter()
            .filter_map(|index| self.party.pubkey_at(*index))
            .map(BlameNode::new)
            .collect();
        let mut blame = Blame::new(FailReason::BrokenShare, vec![]);
        blame.set_blame(threshold_guard(nodes, self.threshold), round, is_unicast);
        blame
    }

    fn acceptable(&self, nodes: &[BlameNode]) -> bool {
        !nodes.is_empty() && nodes.len() <= self.threshold
    }

    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
