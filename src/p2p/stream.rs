//! Length-prefixed framing over peer streams.
//!
//! Every frame is a 4-byte little-endian length header followed by exactly
//! that many payload bytes. All operations are deadline-bounded. On any
//! failure the stream is reset exactly once and must not be used again.

use std::{io, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    error::{TransportError, TransportResult},
    PeerId,
};

pub const LENGTH_HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = 20_000_000;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(20);

/// Bidirectional byte stream to an authenticated remote peer
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {
    fn remote_peer(&self) -> &PeerId;
    /// Abort the stream in both directions.
    fn reset(&mut self);
}

/// Read one frame from `stream`.
pub async fn read_stream<S>(stream: &mut S, timeout: Duration) -> TransportResult<Vec<u8>>
where
    S: PeerStream + ?Sized,
{
    let res = with_deadline(timeout, read_frame(stream)).await;
    reset_on_error(stream, res)
}

/// Like [read_stream], but gives up with [TransportError::Cancelled] as soon as `cancel` fires.
pub async fn read_stream_cancellable<S>(
    stream: &mut S,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TransportResult<Vec<u8>>
where
    S: PeerStream + ?Sized,
{
    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        res = with_deadline(timeout, read_frame(stream)) => res,
    };
    reset_on_error(stream, res)
}

/// Write `payload` as one frame to `stream`.
pub async fn write_stream<S>(stream: &mut S, payload: &[u8], timeout: Duration) -> TransportResult<()>
where
    S: PeerStream + ?Sized,
{
    let res = with_deadline(timeout, write_frame(stream, payload)).await;
    reset_on_error(stream, res)
}

/// Like [write_stream], but gives up with [TransportError::Cancelled] as soon as `cancel` fires.
pub async fn write_stream_cancellable<S>(
    stream: &mut S,
    payload: &[u8],
    timeout: Duration,
    cancel: &CancellationToken,
) -> TransportResult<()>
where
    S: PeerStream + ?Sized,
{
    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        res = with_deadline(timeout, write_frame(stream, payload)) => res,
    };
    reset_on_error(stream, res)
}

async fn with_deadline<T, F>(timeout: Duration, fut: F) -> TransportResult<T>
where
    F: std::future::Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::DeadlineExceeded(timeout)),
    }
}

// the only place a stream gets reset on a failed read or write
fn reset_on_error<S, T>(stream: &mut S, res: TransportResult<T>) -> TransportResult<T>
where
    S: PeerStream + ?Sized,
{
    if let Err(err) = &res {
        debug!("resetting stream to {}: {}", stream.remote_peer(), err);
        stream.reset();
    }
    res
}

async fn read_frame<S>(stream: &mut S) -> TransportResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LENGTH_HEADER_SIZE];
    stream.read_exact(&mut header).await.map_err(framing_error)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(framing_error)?;
    Ok(payload)
}

async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> TransportResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    // cannot overflow: MAX_PAYLOAD_SIZE fits in a u32
    let header = (payload.len() as u32).to_le_bytes();
    stream.write_all(&header).await.map_err(framing_error)?;
    stream.write_all(payload).await.map_err(framing_error)?;
    stream.flush().await?;
    Ok(())
}

fn framing_error(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => {
            TransportError::Framing(err.to_string())
        }
        _ => TransportError::Io(err),
    }
}
