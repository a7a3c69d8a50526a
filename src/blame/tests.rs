use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use super::*;
use crate::{
    p2p::PeerId,
    router::{MessageRouting, WireMessage},
    tests::mock::{test_keys, KEYGEN_ROUNDS},
    tss::types::{Party, RoundInfo, RoundSchedule},
};

const MSG_ID: &str = "session";

fn party(n: usize) -> (Vec<String>, Party) {
    let keys = test_keys(n);
    let party = Party::new(&keys, &keys[0]).unwrap();
    (keys, party)
}

fn peer(key: &str) -> PeerId {
    PeerId::from_pubkey(key)
}

fn round_info(index: usize) -> RoundInfo {
    RoundInfo {
        index,
        round: KEYGEN_ROUNDS[index].0.to_string(),
        msg_id: MSG_ID.to_string(),
    }
}

fn wire(from: &str, unicast_to: Option<&str>, round: &str) -> WireMessage {
    WireMessage {
        routing: MessageRouting {
            from: peer(from),
            to: unicast_to.map(|to| vec![peer(to)]),
            round: round.to_string(),
        },
        msg_id: MSG_ID.to_string(),
        payload: vec![1, 2, 3],
        signature: vec![4, 5, 6],
    }
}

fn manager(threshold: usize) -> (Vec<String>, BlameManager) {
    let (keys, party) = party(4);
    let manager = BlameManager::new(
        Arc::new(party),
        RoundSchedule::new(&KEYGEN_ROUNDS),
        threshold,
    );
    (keys, manager)
}

#[test]
fn guard_drops_oversized_sets() {
    let nodes: Vec<BlameNode> = ["a", "b", "c"].iter().map(|k| BlameNode::new(k)).collect();
    assert_eq!(threshold_guard(nodes.clone(), 3).len(), 3);
    assert!(threshold_guard(nodes, 2).is_empty());
}

#[test]
fn absent_nodes_are_blamed_for_sync_failure() {
    let keys = test_keys(3);
    let online = vec![peer(&keys[0]), peer(&keys[2])];
    let nodes = node_sync_blame(&keys, &online);
    assert_eq!(nodes, vec![BlameNode::new(&keys[1])]);
    assert!(node_sync_blame(&keys, &[peer(&keys[0]), peer(&keys[1]), peer(&keys[2])]).is_empty());
}

#[test]
fn missing_share_in_later_round() {
    let (keys, party) = party(4);
    let schedule = RoundSchedule::new(&KEYGEN_ROUNDS);
    let mut accepted: HashMap<RoundInfo, BTreeSet<PeerId>> = HashMap::new();
    accepted.insert(
        round_info(0),
        [1, 2, 3].iter().map(|i| peer(&keys[*i])).collect(),
    );
    accepted.insert(round_info(1), [1, 2].iter().map(|i| peer(&keys[*i])).collect());

    let missing = missing_share_blame(&party, &schedule, &accepted).unwrap();
    assert_eq!(missing.round, KEYGEN_ROUNDS[1].0);
    assert!(missing.is_unicast);
    assert_eq!(missing.nodes, vec![BlameNode::new(&keys[3])]);
}

#[test]
fn missing_share_in_first_round() {
    let (keys, party) = party(4);
    let schedule = RoundSchedule::new(&KEYGEN_ROUNDS);
    let mut accepted: HashMap<RoundInfo, BTreeSet<PeerId>> = HashMap::new();
    accepted.insert(round_info(0), BTreeSet::from([peer(&keys[1])]));

    let missing = missing_share_blame(&party, &schedule, &accepted).unwrap();
    assert_eq!(missing.round, KEYGEN_ROUNDS[0].0);
    assert!(!missing.is_unicast);
    assert_eq!(
        missing.nodes.iter().map(|n| n.pubkey.as_str()).collect::<Vec<_>>(),
        vec![keys[2].as_str(), keys[3].as_str()]
    );
}

#[test]
fn no_missing_share_when_complete() {
    let (keys, party) = party(3);
    let schedule = RoundSchedule::new(&KEYGEN_ROUNDS);
    let all: BTreeSet<PeerId> = keys[1..].iter().map(|k| peer(k)).collect();
    let accepted: HashMap<RoundInfo, BTreeSet<PeerId>> = (0..KEYGEN_ROUNDS.len())
        .map(|i| (round_info(i), all.clone()))
        .collect();
    assert!(missing_share_blame(&party, &schedule, &accepted).is_none());
}

#[test]
fn equivocators_carry_evidence() {
    let (keys, party) = party(4);
    let delivered = BTreeSet::from([peer(&keys[1]), peer(&keys[2])]);
    let evidence = Evidence {
        round: KEYGEN_ROUNDS[0].0.to_string(),
        data: vec![9],
        signature: vec![8],
    };
    let equivocators = BTreeMap::from([(peer(&keys[2]), evidence.clone())]);

    let nodes = broadcast_blame(&party, &delivered, &equivocators);
    assert_eq!(
        nodes,
        vec![
            BlameNode::with_evidence(&keys[2], &evidence),
            BlameNode::new(&keys[3]),
        ]
    );

    let senders = BTreeSet::from([peer(&keys[3])]);
    assert_eq!(
        unicast_blame(&party, &senders),
        vec![BlameNode::new(&keys[1]), BlameNode::new(&keys[2])]
    );
}

#[test]
fn nothing_sent_blames_nobody() {
    let (_, manager) = manager(2);
    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.fail_reason, Some(FailReason::Timeout));
    assert!(blame.is_empty());
    assert!(blame.round.is_empty());
}

#[test]
fn stalled_unicast_round() {
    let (keys, manager) = manager(2);
    let round = KEYGEN_ROUNDS[1].0;
    manager.set_last_msg(wire(&keys[0], Some(&keys[1]), round));
    manager.set_round_msg(wire(&keys[1], Some(&keys[0]), round));
    manager.set_round_msg(wire(&keys[2], Some(&keys[0]), round));

    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.fail_reason, Some(FailReason::Timeout));
    assert_eq!(blame.round, round);
    assert!(blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[3].as_str()]);
}

#[test]
fn stalled_broadcast_round() {
    let (keys, manager) = manager(2);
    let round = KEYGEN_ROUNDS[0].0;
    manager.set_last_msg(wire(&keys[0], None, round));
    manager.set_round_msg(wire(&keys[1], None, round));

    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.round, round);
    assert!(!blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[2].as_str(), keys[3].as_str()]);
}

#[test]
fn falls_back_to_missing_shares() {
    let (keys, manager) = manager(2);
    // everybody delivered the broadcast of round 3, but B skipped round 2
    let round = KEYGEN_ROUNDS[2].0;
    manager.set_last_msg(wire(&keys[0], None, round));
    for i in 1..4 {
        assert!(manager.update_accepted_share(round_info(0), &peer(&keys[i])));
        manager.set_round_msg(wire(&keys[i], None, round));
    }
    for i in 1..4 {
        manager.set_round_msg(wire(&keys[i], Some(&keys[0]), KEYGEN_ROUNDS[1].0));
    }
    for i in [2, 3] {
        manager.update_accepted_share(round_info(1), &peer(&keys[i]));
    }

    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.round, KEYGEN_ROUNDS[1].0);
    assert!(blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[1].as_str()]);
}

#[test]
fn too_many_culprits_blame_nobody() {
    let (keys, manager) = manager(1);
    let round = KEYGEN_ROUNDS[1].0;
    manager.set_last_msg(wire(&keys[0], Some(&keys[1]), round));
    manager.set_round_msg(wire(&keys[1], Some(&keys[0]), round));

    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.fail_reason, Some(FailReason::Timeout));
    assert_eq!(blame.round, round);
    assert!(blame.is_empty());
}

#[test]
fn equivocation_sets_reason() {
    let (keys, manager) = manager(2);
    let round = KEYGEN_ROUNDS[0].0;
    manager.set_last_msg(wire(&keys[0], None, round));
    manager.set_round_msg(wire(&keys[1], None, round));
    manager.set_round_msg(wire(&keys[3], None, round));
    let evidence = Evidence {
        round: round.to_string(),
        data: vec![7],
        signature: vec![7],
    };
    manager.record_equivocation(peer(&keys[2]), evidence.clone());

    let blame = manager.stalled_session_blame(FailReason::Timeout);
    assert_eq!(blame.fail_reason, Some(FailReason::HashCheckFail));
    assert_eq!(
        blame.blame_nodes,
        vec![BlameNode::with_evidence(&keys[2], &evidence)]
    );
}

#[test]
fn culprits_map_to_pubkeys() {
    let (keys, manager) = manager(2);
    let blame = manager.culprit_blame(&[1, 3], KEYGEN_ROUNDS[1].0, true);
    assert_eq!(blame.fail_reason, Some(FailReason::BrokenShare));
    assert!(blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[1].as_str(), keys[3].as_str()]);

    // out of range indices are skipped, more than `threshold` are dropped
    assert_eq!(manager.culprit_blame(&[1, 9], "r", false).pubkeys().len(), 1);
    assert!(manager.culprit_blame(&[1, 2, 3], "r", false).is_empty());
}

#[test]
fn blame_nodes_are_unique() {
    let mut blame = Blame::new(FailReason::SyncFail, vec![BlameNode::new("a")]);
    blame.add_blame_nodes(vec![BlameNode::new("a"), BlameNode::new("b")]);
    assert_eq!(blame.pubkeys(), vec!["a", "b"]);
    assert!(blame.to_string().contains(FailReason::SyncFail.as_str()));
}
