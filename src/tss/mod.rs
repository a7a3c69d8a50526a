//! Keygen and keysign orchestration.
//!
//! [TssServer] owns the long-lived pieces of a validator's tss core: the
//! message router, the join-party coordinator, the stream bookkeeping and the
//! engines. Every request runs as a session: join party, run the engine
//! rounds over the peer network, persist or return the result, and compute a
//! [Blame] if anything fails.

pub mod engine;
mod keygen;
mod keysign;
mod protocol;
pub mod session;
pub mod types;

pub use keygen::{KeygenRequest, KeygenResponse};
pub use keysign::{KeysignRequest, KeysignResponse};

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::{
    engine::{KeygenEngine, KeysignEngine},
    types::Party,
};
use crate::{
    blame::{node_sync_blame, threshold_guard, Blame, BlameNode, FailReason},
    config::TssConfig,
    join_party::{
        JoinPartyError, JoinPartyOutcome, JoinPartyPolicy, JoinPartyRequest, JoinPartyResult,
        PartyCoordinator,
    },
    kv_manager::{AddressBook, StateManager},
    p2p::{
        Communication, InboundStream, PeerId, PeerNetwork, ProtocolId, Signer, StreamMgr,
    },
    router::MessageRouter,
    TssResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
}

/// The engines a [TssServer] runs sessions with
pub struct Engines {
    pub keygen: Arc<KeygenEngine>,
    pub keysign: Arc<KeysignEngine>,
}

pub struct TssServer {
    cfg: TssConfig,
    network: Arc<dyn PeerNetwork>,
    signer: Arc<dyn Signer>,
    router: Arc<MessageRouter>,
    stream_mgr: Arc<StreamMgr>,
    communication: Arc<Communication>,
    coordinator: Arc<PartyCoordinator>,
    state_manager: Arc<dyn StateManager>,
    keygen_engine: Arc<KeygenEngine>,
    keysign_engine: Arc<KeysignEngine>,
    policy: Arc<dyn JoinPartyPolicy>,
    stop: CancellationToken,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<InboundStream>>>,
}

impl TssServer {
    /// `incoming` is the channel on which `network` delivers streams opened by peers.
    pub fn new(
        cfg: TssConfig,
        network: Arc<dyn PeerNetwork>,
        incoming: mpsc::UnboundedReceiver<InboundStream>,
        signer: Arc<dyn Signer>,
        state_manager: Arc<dyn StateManager>,
        engines: Engines,
    ) -> TssResult<Self> {
        if &PeerId::from_pubkey(signer.pubkey()) != network.local_peer_id() {
            return Err(anyhow!("node key does not match the network identity"));
        }
        let policy = Arc::new(cfg.version_gate()?);
        let stop = CancellationToken::new();
        let router = Arc::new(MessageRouter::new());
        let stream_mgr = Arc::new(StreamMgr::new());
        let communication = Arc::new(Communication::new(
            network.clone(),
            router.clone(),
            stream_mgr.clone(),
            cfg.stream_timeout,
            stop.clone(),
        ));
        let coordinator = Arc::new(PartyCoordinator::new(
            network.clone(),
            signer.clone(),
            cfg.party_timeout,
            cfg.stream_timeout,
        ));

        Ok(Self {
            cfg,
            network,
            signer,
            router,
            stream_mgr,
            communication,
            coordinator,
            state_manager,
            keygen_engine: engines.keygen,
            keysign_engine: engines.keysign,
            policy,
            stop,
            incoming: Mutex::new(Some(incoming)),
        })
    }

    /// Replace the version gate that picks the join-party variant.
    pub fn with_policy(mut self, policy: Arc<dyn JoinPartyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Start serving streams opened by peers. Can be called once.
    pub fn start(&self) -> TssResult<JoinHandle<()>> {
        let incoming = self
            .incoming
            .lock()
            .map_err(|_| anyhow!("tss server state poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("tss server already started"))?;

        info!("tss server {} started", self.network.local_peer_id());
        Ok(tokio::spawn(accept_streams(
            incoming,
            self.coordinator.clone(),
            self.communication.clone(),
            self.stop.clone(),
        )))
    }

    /// Stop serving peers and abort running sessions.
    pub fn stop(&self) {
        info!("tss server {} stopping", self.network.local_peer_id());
        self.stop.cancel();
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.network.local_peer_id()
    }

    pub fn config(&self) -> &TssConfig {
        &self.cfg
    }

    async fn join_party(
        &self,
        req: &JoinPartyRequest,
        version: &str,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let mode = self.policy.mode(version);
        self.coordinator.join_party(req, mode, &self.stop).await
    }

    /// Merge the addresses of `party` members into the stored address book.
    async fn save_address_book(&self, party: &Party) {
        let mut address_book = match self.state_manager.retrieve_address_book().await {
            Ok(address_book) => address_book,
            Err(err) => {
                warn!("cannot load address book: {}", err);
                AddressBook::new()
            }
        };
        for peer in self.network.connected_peers() {
            if party.contains(&peer.peer_id) {
                address_book.insert(peer.peer_id, peer.addrs);
            }
        }
        if let Err(err) = self.state_manager.save_address_book(address_book).await {
            warn!("cannot save address book: {}", err);
        }
    }
}

async fn accept_streams(
    mut incoming: mpsc::UnboundedReceiver<InboundStream>,
    coordinator: Arc<PartyCoordinator>,
    communication: Arc<Communication>,
    stop: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            inbound = incoming.recv() => inbound,
        };
        let Some(InboundStream { protocol, stream }) = inbound else {
            break;
        };

        match protocol {
            ProtocolId::Tss => {
                let communication = communication.clone();
                tokio::spawn(async move { communication.handle_stream(stream).await });
            }
            ProtocolId::JoinParty | ProtocolId::JoinPartyLeader => {
                let coordinator = coordinator.clone();
                let stop = stop.clone();
                tokio::spawn(async move { coordinator.handle_stream(protocol, stream, &stop).await });
            }
        }
    }
    info!("stopped accepting peer streams");
}

/// Blame for a failed join. Peers that never showed up are blamed unless
/// there are more than `threshold` of them; a failed leader is always blamed.
fn join_party_blame(err: &JoinPartyError, keys: &[String], threshold: usize) -> Blame {
    match err {
        JoinPartyError::Timeout { online } => Blame::new(
            FailReason::SyncFail,
            threshold_guard(node_sync_blame(keys, online), threshold),
        ),
        JoinPartyError::InsufficientQuorum { .. } | JoinPartyError::LeaderUnreachable { .. } => {
            let online = err.online();
            let absent = if online.is_empty() {
                vec![]
            } else {
                threshold_guard(node_sync_blame(keys, online), threshold)
            };
            let mut blame = Blame::new(FailReason::SyncFail, absent);
            let leader_key = err
                .leader()
                .and_then(|leader| keys.iter().find(|k| &PeerId::from_pubkey(k) == leader));
            if let Some(leader_key) = leader_key {
                blame.add_blame_nodes(vec![BlameNode::new(leader_key)]);
            }
            blame
        }
        JoinPartyError::NotSelected { .. } => Blame::new(FailReason::NotSelected, vec![]),
        JoinPartyError::Stopped { .. } | JoinPartyError::InvalidRequest(_) => {
            Blame::new(FailReason::InternalError, vec![])
        }
    }
}
