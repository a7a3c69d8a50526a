//! In-process [PeerNetwork] backed by [tokio::io::duplex] pipes.
//!
//! Every peer that joins a [MemoryHub] can open streams to every other
//! member. Used by the end-to-end tests and by embedders that run several
//! validators in one process.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};
use tracing::debug;

use super::{
    InboundStream, PeerId, PeerInfo, PeerNetwork, PeerStream, ProtocolId, TransportError,
    TransportResult,
};

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

type Listeners = HashMap<PeerId, mpsc::UnboundedSender<InboundStream>>;

#[derive(Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<Mutex<Listeners>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` on the hub. Streams opened towards `peer` arrive on the returned receiver.
    pub fn join(&self, peer: PeerId) -> (MemoryNetwork, mpsc::UnboundedReceiver<InboundStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(peer.clone(), tx);
        let network = MemoryNetwork {
            local_peer_id: peer,
            hub: self.clone(),
        };
        (network, rx)
    }

    /// Remove `peer` from the hub; later dials to it fail with [TransportError::Unreachable].
    pub fn leave(&self, peer: &PeerId) {
        self.lock().remove(peer);
    }

    fn listener(&self, peer: &PeerId) -> Option<mpsc::UnboundedSender<InboundStream>> {
        self.lock().get(peer).cloned()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        // a panicking holder cannot leave the map half-updated
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryNetwork {
    local_peer_id: PeerId,
    hub: MemoryHub,
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    fn connected_peers(&self) -> Vec<PeerInfo> {
        self.hub
            .peers()
            .into_iter()
            .filter(|peer| peer != &self.local_peer_id)
            .map(|peer| PeerInfo {
                addrs: vec![format!("/memory/{}", peer)],
                peer_id: peer,
            })
            .collect()
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: ProtocolId,
    ) -> TransportResult<Box<dyn PeerStream>> {
        let listener = self
            .hub
            .listener(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let inbound = InboundStream {
            protocol,
            stream: Box::new(MemoryStream::new(remote, self.local_peer_id.clone())),
        };
        listener
            .send(inbound)
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;

        debug!("opened {:?} stream to {}", protocol, peer);
        Ok(Box::new(MemoryStream::new(local, peer.clone())))
    }
}

/// One end of an in-memory stream. Dropping the inner pipe on reset closes
/// the other end, which observes EOF.
pub struct MemoryStream {
    inner: Option<DuplexStream>,
    remote_peer: PeerId,
}

impl MemoryStream {
    pub fn new(inner: DuplexStream, remote_peer: PeerId) -> Self {
        Self {
            inner: Some(inner),
            remote_peer,
        }
    }

    fn inner(&mut self) -> io::Result<Pin<&mut DuplexStream>> {
        match self.inner.as_mut() {
            Some(inner) => Ok(Pin::new(inner)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream was reset",
            )),
        }
    }
}

impl PeerStream for MemoryStream {
    fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    fn reset(&mut self) {
        self.inner = None;
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner() {
            Ok(inner) => inner.poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner() {
            Ok(inner) => inner.poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner() {
            Ok(inner) => inner.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner() {
            Ok(inner) => inner.poll_shutdown(cx),
            // already closed
            Err(_) => Poll::Ready(Ok(())),
        }
    }
}
