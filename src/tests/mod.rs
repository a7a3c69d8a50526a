// End-to-end tests: every node runs a full TssServer on an in-memory peer
// network, with mock engines that exchange placeholder shares. Nodes are
// addressed by the pubkeys of `mock::test_keys`, so party A has index 0,
// B index 1 and so on.


use std::{path::Path, sync::Arc, time::Duration};

use futures_util::future::join_all;
use testdir::testdir;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use crate::{
    blame::FailReason,
    config::TssConfig,
    join_party::leader_node,
    kv_manager::{KvStateManager, StateManager},
    p2p::{
        memory::{MemoryHub, MemoryNetwork},
        InboundStream, PeerId,
    },
    tss::{
        types::Request, Engines, KeygenRequest, KeygenResponse, KeysignRequest, Status, TssServer,
    },
};
use mock::{equivocate_to, test_keys, Behaviour, MockKeygen, MockKeysign, MockSigner};

const LEADERLESS_VERSION: &str = "0.13.0";
const LEADER_VERSION: &str = "0.14.0";

fn test_config() -> TssConfig {
    TssConfig {
        keygen_timeout: Duration::from_secs(20),
        keysign_timeout: Duration::from_secs(20),
        round_timeout: Duration::from_secs(2),
        party_timeout: Duration::from_secs(3),
        stream_timeout: Duration::from_secs(1),
        leader_join_version: LEADER_VERSION.to_string(),
    }
}

struct TestNode {
    server: TssServer,
    state_manager: Arc<KvStateManager>,
}

fn start_node(
    key: &str,
    behaviour: Behaviour,
    network: MemoryNetwork,
    incoming: mpsc::UnboundedReceiver<InboundStream>,
    root: &Path,
) -> TestNode {
    let state_manager = Arc::new(KvStateManager::new(root.join(key).to_str().unwrap()).unwrap());
    let engines = Engines {
        keygen: Arc::new(MockKeygen::new(behaviour)),
        keysign: Arc::new(MockKeysign::new(behaviour)),
    };
    let server = TssServer::new(
        test_config(),
        Arc::new(network),
        incoming,
        Arc::new(MockSigner::new(key)),
        state_manager.clone(),
        engines,
    )
    .unwrap();
    server.start().unwrap();
    TestNode {
        server,
        state_manager,
    }
}

/// Start a node for every key in `keys`. Keys without a behaviour are honest.
fn spawn_nodes(
    hub: &MemoryHub,
    keys: &[String],
    behaviours: &[(usize, Behaviour)],
    root: &Path,
) -> Vec<TestNode> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            let behaviour = behaviours
                .iter()
                .find(|(index, _)| *index == i)
                .map_or(Behaviour::Honest, |(_, behaviour)| *behaviour);
            let (network, incoming) = hub.join(PeerId::from_pubkey(key));
            start_node(key, behaviour, network, incoming, root)
        })
        .collect()
}

fn keygen_request(keys: &[String], block_height: i64, version: &str) -> KeygenRequest {
    KeygenRequest {
        keys: keys.to_vec(),
        block_height,
        version: version.to_string(),
    }
}

async fn keygen_all(nodes: &[TestNode], req: &KeygenRequest) -> Vec<KeygenResponse> {
    join_all(nodes.iter().map(|node| node.server.keygen(req.clone()))).await
}

fn assert_same_key(responses: &[KeygenResponse]) -> String {
    let pub_key = responses[0].pub_key.clone();
    assert!(!pub_key.is_empty());
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status, Status::Success, "party {} failed", i);
        assert!(response.blame.is_empty());
        assert_eq!(response.pub_key, pub_key, "party {} disagrees on the key", i);
    }
    pub_key
}

fn sorted(mut keys: Vec<&str>) -> Vec<&str> {
    keys.sort_unstable();
    keys
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn keygen_without_leader() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(&hub, &keys, &[], &dir);

    let responses = keygen_all(&nodes, &keygen_request(&keys, 10, LEADERLESS_VERSION)).await;
    let pub_key = assert_same_key(&responses);

    for (node, key) in nodes.iter().zip(&keys) {
        let state = node.state_manager.get_local_state(&pub_key).await.unwrap();
        assert_eq!(&state.local_party_key, key);
        assert_eq!(state.participant_keys, keys);

        let address_book = node.state_manager.retrieve_address_book().await.unwrap();
        assert_eq!(address_book.len(), keys.len() - 1);
        assert!(!address_book.contains_key(node.server.local_peer_id()));
    }
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn keygen_with_leader() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(&hub, &keys, &[], &dir);

    let responses = keygen_all(&nodes, &keygen_request(&keys, 11, LEADER_VERSION)).await;
    assert_same_key(&responses);
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn keygen_then_keysign_with_subset() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(&hub, &keys, &[], &dir);

    let responses = keygen_all(&nodes, &keygen_request(&keys, 12, LEADER_VERSION)).await;
    let pub_key = assert_same_key(&responses);

    // threshold 2 needs three signers; D is not asked
    let req = KeysignRequest {
        pool_pub_key: pub_key,
        messages: vec!["bWVzc2FnZSAx".to_string(), "bWVzc2FnZSAy".to_string()],
        signer_pub_keys: keys[..3].to_vec(),
        block_height: 13,
        version: LEADER_VERSION.to_string(),
    };
    let responses = join_all(
        nodes[..3]
            .iter()
            .map(|node| node.server.keysign(req.clone())),
    )
    .await;

    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status, Status::Success, "party {} failed", i);
        assert_eq!(response.signatures.len(), req.messages.len());
        assert_eq!(response.signatures, responses[0].signatures);
    }
    assert_eq!(responses[0].signatures[0].msg, req.messages[0]);
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn withheld_unicast_share_is_blamed() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(
        &hub,
        &keys,
        &[(3, Behaviour::Withhold(mock::KEYGEN_ROUNDS[1].0))],
        &dir,
    );

    let responses = keygen_all(&nodes, &keygen_request(&keys, 14, LEADERLESS_VERSION)).await;

    for response in &responses[..3] {
        assert_eq!(response.status, Status::Fail);
        assert!(response.pub_key.is_empty());
        let blame = &response.blame;
        assert_eq!(blame.fail_reason, Some(FailReason::Timeout));
        assert_eq!(blame.round, mock::KEYGEN_ROUNDS[1].0);
        assert!(blame.is_unicast);
        assert_eq!(blame.pubkeys(), vec![keys[3].as_str()]);
    }
    assert_eq!(responses[3].status, Status::Fail);
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn engine_culprits_are_blamed() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(&hub, &keys, &[(0, Behaviour::Accuse(2))], &dir);

    let responses = keygen_all(&nodes, &keygen_request(&keys, 15, LEADERLESS_VERSION)).await;

    let blame = &responses[0].blame;
    assert_eq!(responses[0].status, Status::Fail);
    assert_eq!(blame.fail_reason, Some(FailReason::BrokenShare));
    assert_eq!(blame.round, mock::KEYGEN_ROUNDS[0].0);
    assert!(!blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[2].as_str()]);

    // A stops after the first round, the others wait for its unicast share
    for response in &responses[1..] {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, Some(FailReason::Timeout));
        assert_eq!(response.blame.pubkeys(), vec![keys[0].as_str()]);
    }
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn equivocating_broadcast_is_blamed() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let round = mock::KEYGEN_ROUNDS[0].0;

    // D shows A a different round 1 commitment than everybody else
    let nodes: Vec<TestNode> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let (network, incoming) = hub.join(PeerId::from_pubkey(key));
            let incoming = if i == 0 {
                equivocate_to(incoming, &keys[3], round, b"forged commitment")
            } else {
                incoming
            };
            start_node(key, Behaviour::Honest, network, incoming, &dir)
        })
        .collect();

    let responses = keygen_all(&nodes, &keygen_request(&keys, 18, LEADERLESS_VERSION)).await;
    for response in &responses {
        assert_eq!(response.status, Status::Fail);
    }

    // A holds the copy the others did not echo and blames D with it
    let blame = &responses[0].blame;
    assert_eq!(blame.fail_reason, Some(FailReason::HashCheckFail));
    assert_eq!(blame.round, round);
    assert!(!blame.is_unicast);
    assert_eq!(blame.pubkeys(), vec![keys[3].as_str()]);
    assert_eq!(blame.blame_nodes[0].blame_data, b"forged commitment".to_vec());
    assert!(!blame.blame_nodes[0].blame_signature.is_empty());

    // B and C saw A echo a hash nobody else did; A never sends its round 2 share
    for response in &responses[1..3] {
        let blame = &response.blame;
        assert_eq!(blame.fail_reason, Some(FailReason::HashCheckFail));
        assert_eq!(blame.round, mock::KEYGEN_ROUNDS[1].0);
        assert_eq!(blame.pubkeys(), vec![keys[0].as_str()]);
    }
    assert_eq!(responses[3].blame.fail_reason, Some(FailReason::Timeout));
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn absent_peer_is_blamed_without_leader() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    // D never comes online
    let nodes = spawn_nodes(&hub, &keys[..3], &[], &dir);

    let responses = keygen_all(&nodes, &keygen_request(&keys, 16, LEADERLESS_VERSION)).await;

    for response in &responses {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, Some(FailReason::SyncFail));
        assert_eq!(response.blame.pubkeys(), vec![keys[3].as_str()]);
    }
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
async fn absent_peer_and_leader_are_blamed() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(4);
    let nodes = spawn_nodes(&hub, &keys[..3], &[], &dir);

    // pick a height whose leader is online
    let mut peers: Vec<PeerId> = keys.iter().map(|k| PeerId::from_pubkey(k)).collect();
    peers.sort();
    let absent = PeerId::from_pubkey(&keys[3]);
    let (req, leader) = (17..)
        .map(|height| {
            let req = keygen_request(&keys, height, LEADER_VERSION);
            let msg_id = Request::Keygen(&req).digest();
            let leader = leader_node(&msg_id, height, &peers).unwrap();
            (req, leader)
        })
        .find(|(_, leader)| leader != &absent)
        .unwrap();
    let leader_key = keys
        .iter()
        .find(|k| PeerId::from_pubkey(k) == leader)
        .unwrap();

    let responses = keygen_all(&nodes, &req).await;

    for response in &responses {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, Some(FailReason::SyncFail));
        assert_eq!(
            sorted(response.blame.pubkeys()),
            sorted(vec![keys[3].as_str(), leader_key.as_str()])
        );
    }
}

#[traced_test]
#[tokio::test]
async fn keysign_with_unknown_key_fails() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(1);
    let nodes = spawn_nodes(&hub, &keys, &[], &dir);

    let req = KeysignRequest {
        pool_pub_key: "deadbeef".to_string(),
        messages: vec!["bWVzc2FnZQ==".to_string()],
        signer_pub_keys: keys.clone(),
        block_height: 1,
        version: LEADER_VERSION.to_string(),
    };
    let response = nodes[0].server.keysign(req).await;
    assert_eq!(response.status, Status::Fail);
    assert_eq!(response.blame.fail_reason, Some(FailReason::InternalError));
    assert!(response.signatures.is_empty());
}

#[traced_test]
#[tokio::test]
async fn server_starts_once_and_stops() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(2);
    let nodes = spawn_nodes(&hub, &keys, &[], &dir);

    assert!(nodes[0].server.start().is_err());
    nodes[0].server.stop();

    // a stopped node fails its sessions instead of hanging
    let response = nodes[0]
        .server
        .keygen(keygen_request(&keys, 1, LEADERLESS_VERSION))
        .await;
    assert_eq!(response.status, Status::Fail);
    assert_eq!(response.blame.fail_reason, Some(FailReason::InternalError));
}

#[tokio::test]
async fn mismatched_identity_is_rejected() {
    let dir = testdir!();
    let hub = MemoryHub::new();
    let keys = test_keys(2);
    let (network, incoming) = hub.join(PeerId::from_pubkey(&keys[0]));
    let engines = Engines {
        keygen: Arc::new(MockKeygen::new(Behaviour::Honest)),
        keysign: Arc::new(MockKeysign::new(Behaviour::Honest)),
    };
    let state_manager = KvStateManager::new(dir.to_str().unwrap()).unwrap();
    assert!(TssServer::new(
        test_config(),
        Arc::new(network),
        incoming,
        Arc::new(MockSigner::new(&keys[1])),
        Arc::new(state_manager),
        engines,
    )
    .is_err());
}
