//! Assembles the set of online peers for a session before any protocol
//! message is exchanged.
//!
//! Two variants exist. In the leaderless one every node pings every expected
//! peer until all of them have acknowledged. In the leader-based one a leader
//! derived from the session id collects signed ready requests and decides,
//! once a quorum is present or its timeout fires, who takes part.

mod error;
mod leader;
mod leaderless;
mod messages;
mod policy;


pub use error::{JoinPartyError, JoinPartyResult};
pub use leader::leader_node;
pub use messages::JoinPartyMsg;
pub use policy::{JoinPartyMode, JoinPartyPolicy, VersionGate};

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::p2p::{
    stream::{read_stream_cancellable, write_stream_cancellable},
    PeerId, PeerNetwork, PeerStream, ProtocolId, Signer, TransportResult,
};

/// Leader field of a join without leader
pub const NO_LEADER: &str = "NONE";
/// The leader starts a session once `threshold + LEADER_QUORUM_EXTRA` peers are ready
pub const LEADER_QUORUM_EXTRA: usize = 1;

const RETRY_INTERVAL_START: Duration = Duration::from_millis(100);
const RETRY_INTERVAL_MAX: Duration = Duration::from_secs(2);
/// number of decided sessions remembered for late requests
const FINISHED_CACHE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPartyRequest {
    pub msg_id: String,
    /// public keys of all expected participants, the local one included
    pub keys: Vec<String>,
    pub threshold: usize,
    pub block_height: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPartyOutcome {
    /// peers taking part in the session, sorted
    pub online: Vec<PeerId>,
    pub leader: Option<PeerId>,
}

impl JoinPartyOutcome {
    pub fn leader_label(&self) -> String {
        self.leader
            .as_ref()
            .map_or_else(|| NO_LEADER.to_string(), PeerId::to_string)
    }
}

/// Join state of one session on this node
struct PeerStatus {
    mode: JoinPartyMode,
    /// expected peer -> its public key
    expected: HashMap<PeerId, String>,
    joined: BTreeSet<PeerId>,
    notify: Arc<Notify>,
    /// pending leader decisions for followers
    responders: HashMap<PeerId, oneshot::Sender<JoinPartyMsg>>,
}

pub struct PartyCoordinator {
    network: Arc<dyn PeerNetwork>,
    signer: Arc<dyn Signer>,
    party_timeout: Duration,
    stream_timeout: Duration,
    groups: Mutex<HashMap<String, PeerStatus>>,
    finished: Mutex<VecDeque<(String, Vec<PeerId>)>>,
}

/// Removes the session's join state when the join attempt ends
struct GroupGuard<'a> {
    coordinator: &'a PartyCoordinator,
    msg_id: String,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock_groups().remove(&self.msg_id);
    }
}

impl PartyCoordinator {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        signer: Arc<dyn Signer>,
        party_timeout: Duration,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            network,
            signer,
            party_timeout,
            stream_timeout,
            groups: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn join_party(
        &self,
        req: &JoinPartyRequest,
        mode: JoinPartyMode,
        stop: &CancellationToken,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let local = PeerId::from_pubkey(self.signer.pubkey());
        if &local != self.network.local_peer_id() {
            return Err(JoinPartyError::InvalidRequest(
                "node key does not match the network identity".to_string(),
            ));
        }
        if !req.keys.iter().any(|key| key == self.signer.pubkey()) {
            return Err(JoinPartyError::InvalidRequest(
                "local key is not among the expected participants".to_string(),
            ));
        }

        info!(
            "join party {} with {} peers ({:?})",
            req.msg_id,
            req.keys.len(),
            mode
        );
        let res = match mode {
            JoinPartyMode::Leaderless => self.join_party_leaderless(req, stop).await,
            JoinPartyMode::Leader => self.join_party_with_leader(req, stop).await,
        };
        match &res {
            Ok(outcome) => info!(
                "joined party {}: {} peers online, leader {}",
                req.msg_id,
                outcome.online.len(),
                outcome.leader_label()
            ),
            Err(err) => warn!(
                "join party {} failed: {}, leader {}",
                req.msg_id,
                err,
                err.leader_label()
            ),
        }
        res
    }

    /// Serve a join-party stream opened by a remote peer.
    pub async fn handle_stream(
        &self,
        protocol: ProtocolId,
        stream: Box<dyn PeerStream>,
        stop: &CancellationToken,
    ) {
        match protocol {
            ProtocolId::JoinParty => self.handle_leaderless_stream(stream, stop).await,
            ProtocolId::JoinPartyLeader => self.handle_leader_stream(stream, stop).await,
            ProtocolId::Tss => warn!("join party got a {:?} stream", protocol),
        }
    }

    fn register_group(
        &self,
        req: &JoinPartyRequest,
        mode: JoinPartyMode,
    ) -> JoinPartyResult<(Arc<Notify>, GroupGuard<'_>)> {
        let mut groups = self.lock_groups();
        if groups.contains_key(&req.msg_id) {
            return Err(JoinPartyError::InvalidRequest(format!(
                "already joining party {}",
                req.msg_id
            )));
        }
        let notify = Arc::new(Notify::new());
        let expected = req
            .keys
            .iter()
            .map(|key| (PeerId::from_pubkey(key), key.clone()))
            .collect();
        groups.insert(
            req.msg_id.clone(),
            PeerStatus {
                mode,
                expected,
                joined: BTreeSet::new(),
                notify: notify.clone(),
                responders: HashMap::new(),
            },
        );
        let guard = GroupGuard {
            coordinator: self,
            msg_id: req.msg_id.clone(),
        };
        Ok((notify, guard))
    }

    fn mark_joined(&self, msg_id: &str, peer: &PeerId) {
        if let Some(status) = self.lock_groups().get_mut(msg_id) {
            if status.expected.contains_key(peer) && status.joined.insert(peer.clone()) {
                debug!("{} joined party {}", peer, msg_id);
                status.notify.notify_one();
            }
        }
    }

    fn joined(&self, msg_id: &str) -> Vec<PeerId> {
        self.lock_groups()
            .get(msg_id)
            .map(|status| status.joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn pending(&self, msg_id: &str) -> Vec<PeerId> {
        let groups = self.lock_groups();
        let Some(status) = groups.get(msg_id) else {
            return vec![];
        };
        let mut pending: Vec<PeerId> = status
            .expected
            .keys()
            .filter(|peer| !status.joined.contains(*peer))
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// Check that `from` is expected in a `mode` join of `msg_id` and signed the session id.
    fn verify_request(
        &self,
        msg_id: &str,
        mode: JoinPartyMode,
        from: &PeerId,
        signature: &[u8],
    ) -> bool {
        let pubkey = {
            let groups = self.lock_groups();
            match groups.get(msg_id) {
                Some(status) if status.mode == mode => status.expected.get(from).cloned(),
                _ => None,
            }
        };
        match pubkey {
            Some(pubkey) => {
                let valid = self.signer.verify(&pubkey, msg_id.as_bytes(), signature);
                if !valid {
                    warn!("invalid join request signature from {}", from);
                }
                valid
            }
            None => false,
        }
    }

    fn finish(&self, msg_id: &str, peers: Vec<PeerId>) {
        let mut finished = self.lock_finished();
        if finished.len() >= FINISHED_CACHE_SIZE {
            finished.pop_front();
        }
        finished.push_back((msg_id.to_string(), peers));
    }

    fn finished_peers(&self, msg_id: &str) -> Option<Vec<PeerId>> {
        self.lock_finished()
            .iter()
            .find(|(id, _)| id == msg_id)
            .map(|(_, peers)| peers.clone())
    }

    /// Send a signed ready request for `msg_id` to `peer` and wait for the reply.
    async fn request_join(
        &self,
        peer: &PeerId,
        protocol: ProtocolId,
        msg_id: &str,
        timeout: Duration,
        stop: &CancellationToken,
    ) -> TransportResult<JoinPartyMsg> {
        let mut stream = self.network.open_stream(peer, protocol).await?;
        let request = JoinPartyMsg::Request {
            msg_id: msg_id.to_string(),
            signature: self.signer.sign(msg_id.as_bytes()),
        };
        let payload = bincode::serialize(&request)?;
        write_stream_cancellable(
            &mut *stream,
            &payload,
            self.stream_timeout.min(timeout),
            stop,
        )
        .await?;
        let reply = read_stream_cancellable(&mut *stream, timeout, stop).await?;
        Ok(bincode::deserialize(&reply)?)
    }

    /// Read the ready request of an inbound stream, returning `(msg_id, signature)`.
    async fn read_request(
        &self,
        stream: &mut dyn PeerStream,
        stop: &CancellationToken,
    ) -> Option<(String, Vec<u8>)> {
        let payload = match read_stream_cancellable(stream, self.stream_timeout, stop).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!("failed to read join request: {}", err);
                return None;
            }
        };
        match bincode::deserialize(&payload) {
            Ok(JoinPartyMsg::Request { msg_id, signature }) => Some((msg_id, signature)),
            Ok(other) => {
                warn!("expected a join request from {}, got {:?}", stream.remote_peer(), other);
                stream.reset();
                None
            }
            Err(err) => {
                warn!("undecodable join request from {}: {}", stream.remote_peer(), err);
                stream.reset();
                None
            }
        }
    }

    async fn write_reply(
        &self,
        stream: &mut dyn PeerStream,
        reply: &JoinPartyMsg,
        stop: &CancellationToken,
    ) {
        let payload = match bincode::serialize(reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot encode join reply: {}", err);
                stream.reset();
                return;
            }
        };
        if let Err(err) =
            write_stream_cancellable(stream, &payload, self.stream_timeout, stop).await
        {
            debug!("failed to reply to {}: {}", stream.remote_peer(), err);
        }
    }

    fn lock_groups(&self) -> MutexGuard<'_, HashMap<String, PeerStatus>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_finished(&self) -> MutexGuard<'_, VecDeque<(String, Vec<PeerId>)>> {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn next_interval(interval: Duration) -> Duration {
    (interval * 2).min(RETRY_INTERVAL_MAX)
}
