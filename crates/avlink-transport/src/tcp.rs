//! TCP client channel.
//!
//! This module provides [`TcpChannel`], which connects out to a switcher's
//! TCP control port (often port 23 or a vendor-specific port).
//!
//! [`connect`](Channel::connect) returns straight away. The handshake runs on
//! a background task bounded by the connect timeout; once the socket is up the
//! same task hands the write half to the channel, reports
//! [`ChannelEvent::Online`](avlink_core::ChannelEvent::Online), and keeps
//! forwarding everything read to the link's [`EventSink`]. A failed handshake
//! or a peer close reports [`ChannelEvent::Offline`](avlink_core::ChannelEvent::Offline)
//! and the coordinator takes over with its reconnect timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::{Channel, ConnectionKind, EventSink};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::reader::forward;

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half shared between the channel and its connection task.
type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Outbound TCP channel.
#[derive(Debug)]
pub struct TcpChannel {
    /// `host:port` of the switcher.
    addr: String,
    connect_timeout: Duration,
    /// Fresh per connection so a superseded task cannot touch the current one.
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl TcpChannel {
    /// Create a closed channel for `addr` (e.g. `"192.168.1.50:23"`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_timeout(addr, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        TcpChannel {
            addr: addr.into(),
            connect_timeout,
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Network
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        self.disconnect().await?;

        tracing::debug!(
            addr = %self.addr,
            timeout_ms = self.connect_timeout.as_millis(),
            "connecting to TCP endpoint"
        );

        self.writer = Arc::new(Mutex::new(None));
        self.connected = Arc::new(AtomicBool::new(false));
        self.task = Some(tokio::spawn(run_connection(
            self.addr.clone(),
            self.connect_timeout,
            Arc::clone(&self.writer),
            Arc::clone(&self.connected),
            sink,
        )));
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(addr = %self.addr, bytes = payload.len(), data = ?payload, "sending data");

        writer.write_all(payload).await.map_err(|e| {
            tracing::warn!(addr = %self.addr, error = %e, "failed to send data");
            Error::from_io(e)
        })?;
        writer.flush().await.map_err(Error::from_io)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            tracing::debug!(addr = %self.addr, "closing TCP connection");
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "failed to shutdown TCP stream (continuing anyway)"
                );
            }
            tracing::info!(addr = %self.addr, "TCP connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Dial `addr`, publish the write half, then read until the peer goes away.
async fn run_connection(
    addr: String,
    connect_timeout: Duration,
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    sink: EventSink,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = map_connect_error(e, &addr);
            tracing::warn!(addr = %addr, error = %err, "TCP connection failed");
            sink.offline();
            return;
        }
        Err(_) => {
            tracing::warn!(
                addr = %addr,
                timeout_ms = connect_timeout.as_millis(),
                "TCP connection timed out"
            );
            sink.offline();
            return;
        }
    };

    // Control commands are small and latency-sensitive.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(
            addr = %addr,
            error = %e,
            "failed to set TCP_NODELAY (continuing anyway)"
        );
    }

    let (read_half, write_half) = stream.into_split();
    *writer.lock().await = Some(write_half);
    connected.store(true, Ordering::SeqCst);

    tracing::info!(addr = %addr, "TCP connection established");
    sink.online();
    forward(read_half, sink, connected, addr).await;
}

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused: {}", addr))
        }
        _ => Error::Io(e),
    }
}
