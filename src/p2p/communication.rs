//! Sends wrapped session messages to peers and feeds inbound Tss streams to the router.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    stream::{read_stream_cancellable, write_stream_cancellable},
    PeerId, PeerNetwork, PeerStream, ProtocolId, StreamMgr, TransportResult, UNKNOWN_STREAM,
};
use crate::router::{InboundMessage, MessageRouter, MessageWrapper, RouteOutcome};

pub struct Communication {
    network: Arc<dyn PeerNetwork>,
    router: Arc<MessageRouter>,
    stream_mgr: Arc<StreamMgr>,
    stream_timeout: Duration,
    stop: CancellationToken,
}

impl Communication {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        router: Arc<MessageRouter>,
        stream_mgr: Arc<StreamMgr>,
        stream_timeout: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            network,
            router,
            stream_mgr,
            stream_timeout,
            stop,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.network.local_peer_id()
    }

    /// Send `wrapper` to all `peers` concurrently and return how many of the sends succeeded.
    /// Failures are logged; a peer that cannot be reached is not an error for the caller.
    pub async fn send_to(&self, peers: &[PeerId], wrapper: &MessageWrapper) -> usize {
        let payload = match bincode::serialize(wrapper) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot encode message of session {}: {}", wrapper.msg_id, err);
                return 0;
            }
        };

        let sends = peers
            .iter()
            .map(|peer| self.send_one(peer, &wrapper.msg_id, &payload));
        let results = join_all(sends).await;

        let mut delivered = 0;
        for (peer, res) in peers.iter().zip(results) {
            match res {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    "failed to send {:?} of session {} to {}: {}",
                    wrapper.message_type, wrapper.msg_id, peer, err
                ),
            }
        }
        delivered
    }

    async fn send_one(&self, peer: &PeerId, msg_id: &str, payload: &[u8]) -> TransportResult<()> {
        let mut stream = self.network.open_stream(peer, ProtocolId::Tss).await?;
        write_stream_cancellable(&mut *stream, payload, self.stream_timeout, &self.stop).await?;
        self.stream_mgr.add_stream(msg_id, stream);
        Ok(())
    }

    /// Read one frame from an inbound Tss stream and route it.
    pub async fn handle_stream(&self, mut stream: Box<dyn PeerStream>) {
        let from = stream.remote_peer().clone();

        // a failed read has already reset the stream
        let payload =
            match read_stream_cancellable(&mut *stream, self.stream_timeout, &self.stop).await {
                Ok(payload) => payload,
                Err(err) => {
                    debug!("failed to read from {}: {}", from, err);
                    return;
                }
            };

        let wrapper: MessageWrapper = match bincode::deserialize(&payload) {
            Ok(wrapper) => wrapper,
            Err(err) => {
                warn!("dropping undecodable message from {}: {}", from, err);
                self.stream_mgr.add_stream(UNKNOWN_STREAM, stream);
                return;
            }
        };

        let msg_id = wrapper.msg_id.clone();
        match self.router.route(InboundMessage { from, wrapper }) {
            RouteOutcome::Delivered => self.stream_mgr.add_stream(&msg_id, stream),
            // no running session owns the stream, it may even have finished already
            RouteOutcome::Buffered | RouteOutcome::Dropped => {
                self.stream_mgr.add_stream(UNKNOWN_STREAM, stream)
            }
        }
    }
}
