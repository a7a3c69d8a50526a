//! Join without leader: ping every expected peer until all have acknowledged.

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use futures_util::future::join_all;
use tracing::{debug, span, Instrument, Level};

use super::{
    next_interval, JoinPartyError, JoinPartyMode, JoinPartyMsg, JoinPartyOutcome,
    JoinPartyRequest, JoinPartyResult, PartyCoordinator, RETRY_INTERVAL_START,
};
use crate::p2p::{PeerStream, ProtocolId, TransportError};

impl PartyCoordinator {
    pub(super) async fn join_party_leaderless(
        &self,
        req: &JoinPartyRequest,
        stop: &CancellationToken,
    ) -> JoinPartyResult<JoinPartyOutcome> {
        let msg_id = req.msg_id.as_str();
        let (notify, _guard) = self.register_group(req, JoinPartyMode::Leaderless)?;
        self.mark_joined(msg_id, self.network.local_peer_id());

        let deadline = Instant::now() + self.party_timeout;
        let mut interval = RETRY_INTERVAL_START;
        loop {
            let pending = self.pending(msg_id);
            if pending.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(JoinPartyError::Timeout {
                    online: self.joined(msg_id),
                });
            }

            let attempt_span = span!(Level::DEBUG, "ping", pending = pending.len());
            let pings = pending.iter().map(|peer| {
                self.request_join(
                    peer,
                    ProtocolId::JoinParty,
                    msg_id,
                    remaining.min(self.stream_timeout),
                    stop,
                )
            });
            let replies = join_all(pings).instrument(attempt_span).await;

            for (peer, reply) in pending.iter().zip(replies) {
                match reply {
                    Ok(JoinPartyMsg::Ack { .. }) => self.mark_joined(msg_id, peer),
                    Ok(_) => debug!("{} is not ready for {}", peer, msg_id),
                    Err(TransportError::Cancelled) => {
                        return Err(JoinPartyError::Stopped { leader: None })
                    }
                    Err(err) => debug!("ping to {} failed: {}", peer, err),
                }
            }
            if self.pending(msg_id).is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(JoinPartyError::Stopped { leader: None }),
                _ = sleep_until(deadline) => {
                    return Err(JoinPartyError::Timeout {
                        online: self.joined(msg_id),
                    })
                }
                // a peer pinged us in the meantime
                _ = notify.notified() => {}
                _ = sleep(interval) => {}
            }
            interval = next_interval(interval);
        }

        let online = self.joined(msg_id);
        self.finish(msg_id, online.clone());
        Ok(JoinPartyOutcome {
            online,
            leader: None,
        })
    }

    pub(super) async fn handle_leaderless_stream(
        &self,
        mut stream: Box<dyn PeerStream>,
        stop: &CancellationToken,
    ) {
        let from = stream.remote_peer().clone();
        let Some((msg_id, signature)) = self.read_request(&mut *stream, stop).await else {
            return;
        };

        let already_joined = self
            .finished_peers(&msg_id)
            .map_or(false, |peers| peers.contains(&from));
        let reply = if already_joined
            || self.verify_request(&msg_id, JoinPartyMode::Leaderless, &from, &signature)
        {
            self.mark_joined(&msg_id, &from);
            JoinPartyMsg::Ack { msg_id }
        } else {
            JoinPartyMsg::NotReady { msg_id }
        };
        self.write_reply(&mut *stream, &reply, stop).await;
    }
}
