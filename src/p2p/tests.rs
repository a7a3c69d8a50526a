use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::{
    memory::MemoryHub,
    stream::{
        read_stream, read_stream_cancellable, write_stream, write_stream_cancellable,
        MAX_PAYLOAD_SIZE,
    },
    Communication, PeerId, PeerNetwork, PeerStream, ProtocolId, StreamMgr, TransportError,
    UNKNOWN_STREAM,
};
use crate::router::{MessageRouter, MessageType, MessageWrapper};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Duplex-backed stream that counts how often it was reset
struct MockStream {
    inner: DuplexStream,
    remote: PeerId,
    resets: Arc<AtomicUsize>,
}

impl MockStream {
    fn pair() -> (MockStream, DuplexStream, Arc<AtomicUsize>) {
        let (local, remote) = tokio::io::duplex(1024 * 1024);
        let resets = Arc::new(AtomicUsize::new(0));
        let stream = MockStream {
            inner: local,
            remote: PeerId::from_pubkey("remote"),
            resets: resets.clone(),
        };
        (stream, remote, resets)
    }
}

impl PeerStream for MockStream {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wrap the raw half so that frames can be read back from it
fn peer_of(raw: DuplexStream) -> MockStream {
    MockStream {
        inner: raw,
        remote: PeerId::from_pubkey("local"),
        resets: Arc::new(AtomicUsize::new(0)),
    }
}

#[tokio::test]
async fn frames_survive_the_wire() {
    let sizes = [0usize, 1, 1024, 100_000, MAX_PAYLOAD_SIZE];
    for size in sizes {
        let (mut writer, raw, resets) = MockStream::pair();
        let mut reader = peer_of(raw);
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let (written, read) = tokio::join!(
            write_stream(&mut writer, &payload, TIMEOUT),
            read_stream(&mut reader, TIMEOUT)
        );
        written.unwrap();
        assert_eq!(read.unwrap(), payload, "payload of size {}", size);
        assert_eq!(resets.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn header_is_little_endian() {
    let (mut writer, mut raw, _) = MockStream::pair();
    write_stream(&mut writer, b"abc", TIMEOUT).await.unwrap();

    let mut buf = [0u8; 7];
    tokio::io::AsyncReadExt::read_exact(&mut raw, &mut buf)
        .await
        .unwrap();
    assert_eq!(buf, [3, 0, 0, 0, b'a', b'b', b'c']);
}

#[tokio::test]
async fn oversized_header_is_rejected_and_resets_once() {
    let (mut reader, mut raw, resets) = MockStream::pair();
    let len = (MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes();
    raw.write_all(&len).await.unwrap();

    let err = read_stream(&mut reader, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversized_write_is_rejected_and_resets_once() {
    let (mut writer, _raw, resets) = MockStream::pair();
    let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];

    let err = write_stream(&mut writer, &payload, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::PayloadTooLarge { len, max } if len == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE
    ));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn truncated_frame_is_a_framing_error() {
    let (mut reader, mut raw, resets) = MockStream::pair();
    raw.write_all(&10u32.to_le_bytes()).await.unwrap();
    raw.write_all(b"abc").await.unwrap();
    drop(raw);

    let err = read_stream(&mut reader, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TransportError::Framing(_)));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_peer_hits_the_deadline() {
    let (mut reader, _raw, resets) = MockStream::pair();

    let err = read_stream(&mut reader, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::DeadlineExceeded(_)));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_read_resets_exactly_once() {
    let (mut reader, _raw, resets) = MockStream::pair();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = read_stream_cancellable(&mut reader, TIMEOUT, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_write_resets_exactly_once() {
    let (mut writer, _raw, resets) = MockStream::pair();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = write_stream_cancellable(&mut writer, b"late", TIMEOUT, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn memory_network_carries_frames_between_peers() {
    let hub = MemoryHub::new();
    let alice = PeerId::from_pubkey("alice");
    let bob = PeerId::from_pubkey("bob");
    let (alice_net, _alice_in) = hub.join(alice.clone());
    let (_bob_net, mut bob_in) = hub.join(bob.clone());

    let peers = alice_net.connected_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, bob);

    let mut outbound = alice_net.open_stream(&bob, ProtocolId::Tss).await.unwrap();
    write_stream(&mut *outbound, b"hello", TIMEOUT).await.unwrap();

    let mut inbound = bob_in.recv().await.unwrap();
    assert_eq!(inbound.protocol, ProtocolId::Tss);
    assert_eq!(inbound.stream.remote_peer(), &alice);
    let payload = read_stream(&mut *inbound.stream, TIMEOUT).await.unwrap();
    assert_eq!(payload, b"hello");

    // a reset end is unusable, the other end sees the stream close
    outbound.reset();
    let err = write_stream(&mut *outbound, b"again", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Io(_)));
    let err = read_stream(&mut *inbound.stream, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Framing(_)));
}

#[tokio::test]
async fn unknown_peer_is_unreachable() {
    let hub = MemoryHub::new();
    let (alice_net, _alice_in) = hub.join(PeerId::from_pubkey("alice"));

    let res = alice_net
        .open_stream(&PeerId::from_pubkey("nobody"), ProtocolId::Tss)
        .await;
    assert!(matches!(res, Err(TransportError::Unreachable(_))));
}

fn communication(
    network: Arc<dyn PeerNetwork>,
    router: Arc<MessageRouter>,
) -> (Communication, Arc<StreamMgr>) {
    let stream_mgr = Arc::new(StreamMgr::new());
    let comm = Communication::new(
        network,
        router,
        stream_mgr.clone(),
        TIMEOUT,
        CancellationToken::new(),
    );
    (comm, stream_mgr)
}

#[tokio::test]
async fn streams_of_finished_sessions_are_not_kept() {
    let hub = MemoryHub::new();
    let alice = PeerId::from_pubkey("alice");
    let bob = PeerId::from_pubkey("bob");
    let (alice_net, _alice_in) = hub.join(alice);
    let (bob_net, mut bob_in) = hub.join(bob.clone());

    let (alice_comm, _) = communication(Arc::new(alice_net), Arc::new(MessageRouter::new()));
    let bob_router = Arc::new(MessageRouter::new());
    let (bob_comm, bob_streams) = communication(Arc::new(bob_net), bob_router.clone());

    // "done" ran and released its streams, "live" is running
    bob_router.subscribe(MessageType::KeygenVerMsg, "done").unwrap();
    bob_router.cancel_subscribe(MessageType::KeygenVerMsg, "done");
    bob_streams.release_stream("done");
    let _live = bob_router.subscribe(MessageType::KeygenMsg, "live").unwrap();

    let late = MessageWrapper {
        message_type: MessageType::KeygenVerMsg,
        msg_id: "done".to_string(),
        payload: vec![1],
    };
    for _ in 0..50 {
        assert_eq!(alice_comm.send_to(&[bob.clone()], &late).await, 1);
        let inbound = bob_in.recv().await.unwrap();
        bob_comm.handle_stream(inbound.stream).await;
    }
    let current = MessageWrapper {
        message_type: MessageType::KeygenMsg,
        msg_id: "live".to_string(),
        payload: vec![2],
    };
    assert_eq!(alice_comm.send_to(&[bob.clone()], &current).await, 1);
    bob_comm.handle_stream(bob_in.recv().await.unwrap().stream).await;

    assert_eq!(bob_streams.stream_count("done"), 0);
    assert_eq!(bob_streams.stream_count(UNKNOWN_STREAM), 50);
    assert_eq!(bob_streams.stream_count("live"), 1);

    // the next session to finish takes the unattributed streams along
    bob_streams.release_stream("live");
    assert_eq!(bob_streams.stream_count(UNKNOWN_STREAM), 0);
    assert_eq!(bob_streams.stream_count("live"), 0);
}

#[test]
fn release_resets_session_and_unknown_streams() {
    let mgr = StreamMgr::new();
    let mut counters = Vec::new();
    for key in ["session-a", "session-a", "session-b", UNKNOWN_STREAM] {
        let (stream, raw, resets) = MockStream::pair();
        drop(raw);
        mgr.add_stream(key, Box::new(stream));
        counters.push((key, resets));
    }
    assert_eq!(mgr.stream_count("session-a"), 2);

    mgr.release_stream("session-a");

    assert_eq!(mgr.stream_count("session-a"), 0);
    assert_eq!(mgr.stream_count(UNKNOWN_STREAM), 0);
    assert_eq!(mgr.stream_count("session-b"), 1);
    for (key, resets) in counters {
        let expected = usize::from(key != "session-b");
        assert_eq!(resets.load(Ordering::SeqCst), expected, "stream of {}", key);
    }
}

#[test]
fn peer_id_is_derived_from_pubkey() {
    let id = PeerId::from_pubkey("some-key");
    assert_eq!(id, PeerId::from_pubkey("some-key"));
    assert_ne!(id, PeerId::from_pubkey("other-key"));
    assert_eq!(id.as_str().len(), 40);
}
