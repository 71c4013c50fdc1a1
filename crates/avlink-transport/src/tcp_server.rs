//! TCP server channel.
//!
//! Some installations invert the usual roles: the control system listens and
//! the switcher (or a gateway in front of it) connects in. [`TcpServerChannel`]
//! binds a listener on [`connect`](Channel::connect) and serves one peer at a
//! time. A new connection replaces the current one.
//!
//! The listener and the current peer's read half live in one background task;
//! the peer's write half is shared with [`send`](Channel::send) behind a
//! mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::{Channel, ConnectionKind, EventSink};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 1024;

/// Listening TCP channel serving a single peer.
pub struct TcpServerChannel {
    /// Address to bind, e.g. `"0.0.0.0:4999"`.
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl TcpServerChannel {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        TcpServerChannel {
            bind_addr: bind_addr.into(),
            local_addr: None,
            writer: Arc::new(Mutex::new(None)),
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// The address actually bound, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Channel for TcpServerChannel {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::NetworkServer
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        self.disconnect().await?;

        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            tracing::warn!(addr = %self.bind_addr, error = %e, "failed to bind listener");
            Error::Transport(format!("failed to listen on {}: {}", self.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!(addr = %local_addr, "listening for controller connections");

        self.task = Some(tokio::spawn(serve(
            listener,
            Arc::clone(&self.writer),
            sink,
            Arc::clone(&self.connected),
        )));
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(bytes = payload.len(), data = ?payload, "sending data");

        let result = match writer.write_all(payload).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to send data, dropping peer");
            guard.take();
            self.connected.store(false, Ordering::SeqCst);
            return Err(Error::from_io(e));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(addr = %self.bind_addr, "listener closed");
        }
        self.connected.store(false, Ordering::SeqCst);
        self.local_addr = None;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpServerChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Read from the current peer, or wait forever if there is none.
async fn read_peer(peer: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> std::io::Result<usize> {
    match peer {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Accept peers and forward their traffic until aborted.
async fn serve(
    listener: TcpListener,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    sink: EventSink,
    connected: Arc<AtomicBool>,
) {
    let mut peer: Option<OwnedReadHalf> = None;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let (read_half, write_half) = stream.into_split();
                        let replaced = writer.lock().await.replace(write_half).is_some();
                        peer = Some(read_half);
                        connected.store(true, Ordering::SeqCst);
                        if replaced {
                            tracing::info!(peer = %addr, "new peer replaces previous connection");
                        } else {
                            tracing::info!(peer = %addr, "peer connected");
                            sink.online();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }

            read = read_peer(&mut peer, &mut buf) => {
                match read {
                    Ok(n) if n > 0 => {
                        tracing::trace!(bytes = n, data = ?&buf[..n], "received data");
                        if !sink.data(Bytes::copy_from_slice(&buf[..n])) {
                            return;
                        }
                    }
                    result => {
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "peer read error");
                        } else {
                            tracing::info!("peer disconnected");
                        }
                        peer = None;
                        writer.lock().await.take();
                        connected.store(false, Ordering::SeqCst);
                        sink.offline();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avlink_core::{ChannelEvent, TaggedEvent};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    async fn listening() -> (TcpServerChannel, mpsc::UnboundedReceiver<TaggedEvent>, SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channel = TcpServerChannel::new("127.0.0.1:0");
        channel.connect(EventSink::new(1, tx)).await.unwrap();
        let addr = channel.local_addr().unwrap();
        (channel, rx, addr)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("sink closed")
            .event
    }

    #[tokio::test]
    async fn not_connected_until_peer_arrives() {
        let (mut channel, _rx, _addr) = listening().await;
        assert_eq!(channel.kind(), ConnectionKind::NetworkServer);
        assert_eq!(channel.control_method(), "network-server");
        assert!(!channel.is_connected());
        assert!(matches!(channel.send(b"x").await, Err(Error::NotConnected)));
        channel.disconnect().await.unwrap();
        assert!(channel.local_addr().is_none());
    }

    #[tokio::test]
    async fn serves_one_peer() {
        let (mut channel, mut rx, addr) = listening().await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next_event(&mut rx).await, ChannelEvent::Online);
        assert!(channel.is_connected());

        channel.send(b"STATUS!\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"STATUS!\r\n");

        peer.write_all(b"READY\r\n").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ChannelEvent::Data(Bytes::from_static(b"READY\r\n"))
        );

        drop(peer);
        assert_eq!(next_event(&mut rx).await, ChannelEvent::Offline);
        assert!(!channel.is_connected());

        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn new_peer_replaces_old() {
        let (mut channel, mut rx, addr) = listening().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next_event(&mut rx).await, ChannelEvent::Online);

        let mut second = TcpStream::connect(addr).await.unwrap();
        // Data from the new peer proves the swap happened.
        second.write_all(b"HELLO\r\n").await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ChannelEvent::Data(Bytes::from_static(b"HELLO\r\n"))
        );

        channel.send(b"PING").await.unwrap();
        let mut buf = [0u8; 16];
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");

        // The old socket was dropped by the server.
        let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_transport_error() {
        let (_channel, _rx, addr) = listening().await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let mut clash = TcpServerChannel::new(addr.to_string());
        assert!(matches!(
            clash.connect(EventSink::new(1, tx)).await,
            Err(Error::Transport(_))
        ));
    }
}
