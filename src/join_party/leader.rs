//! Join through a leader derived from the session id.

use sha2::{Digest, Sha256};
use tokio::{
    sync::oneshot,
    time::{sleep, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    next_interval, JoinPartyError, JoinPartyMode, JoinPartyMsg, JoinPartyOutcome,
    JoinPartyRequest, JoinPartyResult, PartyCoordinator, LEADER_QUORUM_EXTRA,
    RETRY_INTERVAL_START,
};
use crate::p2p::{PeerId, PeerStream, ProtocolId, TransportError};

/// The peer with the smallest `hex(sha256(msg_id || block_height || peer_id))`.
/// Every node derives the same leader from the same inputs.
pub fn leader_node(msg_id: &str, block_height: i64, peers: &[PeerId]) -> Option<PeerId> {
    peers
        .iter()
        .min_by_key(|peer| {
            let mut hasher = Sha256::new();
            hasher.update(msg_id.as_bytes());
            hasher.update(block_height.to_string().as_bytes());
            hasher.update(peer.as_str().as_bytes());
            hex::encode(hasher.finalize())
        })
        .cloned()
}

impl PartyCoordinator {
    pub(super) async fn join_party_with_leader(
        &self,
        req: &JoinPartyRequest,
        stop: &CancellationToken,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let peers: Vec<PeerId> = req.keys.iter().map(|k| PeerId::from_pubkey(k)).collect();
        let leader = leader_node(&req.msg_id, req.block_height, &peers).ok_or_else(|| {
            JoinPartyError::InvalidRequest("no participants to elect a leader from".to_string())
        })?;

        if &leader == self.network.local_peer_id() {
            self.lead(req, stop).await
        } else {
            self.follow(req, leader, stop).await
        }
    }

    async fn lead(
        &self,
        req: &JoinPartyRequest,
        stop: &CancellationToken,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let msg_id = req.msg_id.as_str();
        let local = self.network.local_peer_id().clone();
        let quorum = req.threshold + LEADER_QUORUM_EXTRA;
        let (notify, _guard) = self.register_group(req, JoinPartyMode::Leader)?;
        self.mark_joined(msg_id, &local);

        let deadline = Instant::now() + self.party_timeout;
        while self.joined(msg_id).len() < quorum {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let online = self.joined(msg_id);
                    self.decide(msg_id, JoinPartyMsg::Abort { msg_id: msg_id.to_string(), peers: online });
                    return Err(JoinPartyError::Stopped { leader: Some(local) });
                }
                _ = sleep_until(deadline) => {
                    let online = self.joined(msg_id);
                    self.decide(msg_id, JoinPartyMsg::Abort { msg_id: msg_id.to_string(), peers: online.clone() });
                    return Err(JoinPartyError::InsufficientQuorum { online, leader: local });
                }
                _ = notify.notified() => {}
            }
        }

        let online = self.joined(msg_id);
        self.finish(msg_id, online.clone());
        self.decide(
            msg_id,
            JoinPartyMsg::Start {
                msg_id: msg_id.to_string(),
                peers: online.clone(),
            },
        );
        Ok(JoinPartyOutcome {
            online,
            leader: Some(local),
        })
    }

    /// Hand `decision` to every follower waiting on the leader.
    fn decide(&self, msg_id: &str, decision: JoinPartyMsg) {
        let responders = self
            .lock_groups()
            .get_mut(msg_id)
            .map(|status| std::mem::take(&mut status.responders))
            .unwrap_or_default();
        for (peer, responder) in responders {
            if responder.send(decision.clone()).is_err() {
                debug!("follower {} stopped waiting for the decision", peer);
            }
        }
    }

    async fn follow(
        &self,
        req: &JoinPartyRequest,
        leader: PeerId,
        stop: &CancellationToken,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let msg_id = req.msg_id.as_str();
        let local = self.network.local_peer_id().clone();
        // the leader decides at the end of its own party timeout at the latest
        let deadline = Instant::now() + self.party_timeout + self.stream_timeout;
        let mut interval = RETRY_INTERVAL_START;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JoinPartyError::LeaderUnreachable { leader });
            }

            match self
                .request_join(&leader, ProtocolId::JoinPartyLeader, msg_id, remaining, stop)
                .await
            {
                Ok(JoinPartyMsg::Start { peers, .. }) => {
                    return if peers.contains(&local) {
                        Ok(JoinPartyOutcome {
                            online: peers,
                            leader: Some(leader),
                        })
                    } else {
                        Err(JoinPartyError::NotSelected {
                            online: peers,
                            leader,
                        })
                    };
                }
                Ok(JoinPartyMsg::Abort { peers, .. }) => {
                    return Err(JoinPartyError::InsufficientQuorum {
                        online: peers,
                        leader,
                    })
                }
                Ok(JoinPartyMsg::NotReady { .. }) => {
                    debug!("leader {} is not ready for {}", leader, msg_id)
                }
                Ok(other) => warn!("unexpected reply from leader {}: {:?}", leader, other),
                Err(TransportError::Cancelled) => {
                    return Err(JoinPartyError::Stopped {
                        leader: Some(leader),
                    })
                }
                Err(err) => debug!("leader {} did not answer: {}", leader, err),
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(JoinPartyError::Stopped { leader: Some(leader) }),
                _ = sleep_until(deadline) => return Err(JoinPartyError::LeaderUnreachable { leader }),
                _ = sleep(interval) => {}
            }
            interval = next_interval(interval);
        }
    }

    /// Register a verified follower and return the channel its decision arrives on.
    fn enqueue_follower(
        &self,
        msg_id: &str,
        from: &PeerId,
        signature: &[u8],
    ) -> Option<oneshot::Receiver<JoinPartyMsg>> {
        if !self.verify_request(msg_id, JoinPartyMode::Leader, from, signature) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let mut groups = self.lock_groups();
        let status = groups.get_mut(msg_id)?;
        status.responders.insert(from.clone(), tx);
        if status.joined.insert(from.clone()) {
            debug!("follower {} is ready for {}", from, msg_id);
        }
        status.notify.notify_one();
        Some(rx)
    }

    pub(super) async fn handle_leader_stream(
        &self,
        mut stream: Box<dyn PeerStream>,
        stop: &CancellationToken,
    ) {
        let from = stream.remote_peer().clone();
        let Some((msg_id, signature)) = self.read_request(&mut *stream, stop).await else {
            return;
        };

        let reply = if let Some(peers) = self.finished_peers(&msg_id) {
            JoinPartyMsg::Start { msg_id, peers }
        } else if let Some(decision) = self.enqueue_follower(&msg_id, &from, &signature) {
            let decision = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                res = tokio::time::timeout(self.party_timeout, decision) => res.ok().and_then(Result::ok),
            };
            match decision {
                Some(decision) => decision,
                None => {
                    stream.reset();
                    return;
                }
            }
        } else {
            JoinPartyMsg::NotReady { msg_id }
        };
        self.write_reply(&mut *stream, &reply, stop).await;
    }
}
