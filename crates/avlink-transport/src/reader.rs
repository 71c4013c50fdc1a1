//! Background read loop shared by the stream channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use avlink_core::EventSink;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 1024;

/// Spawn a task that runs [`forward`].
pub(crate) fn spawn_reader<R>(
    reader: R,
    sink: EventSink,
    connected: Arc<AtomicBool>,
    peer: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(forward(reader, sink, connected, peer))
}

/// Forward everything read from `reader` to `sink`.
///
/// On EOF or a read error, clears `connected`, reports
/// [`ChannelEvent::Offline`](avlink_core::ChannelEvent::Offline), and returns.
pub(crate) async fn forward<R>(mut reader: R, sink: EventSink, connected: Arc<AtomicBool>, peer: String)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(peer = %peer, "peer closed connection");
                break;
            }
            Ok(n) => {
                tracing::trace!(peer = %peer, bytes = n, data = ?&buf[..n], "received data");
                if !sink.data(Bytes::copy_from_slice(&buf[..n])) {
                    // Owner is gone; nothing left to report to.
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    sink.offline();
}
