//! Infrared channel.
//!
//! IR is one-way: codes go out, nothing comes back, so the link always paces
//! IR with the inter-command delay rather than waiting for acknowledgements.
//! The physical emitter sits behind the [`IrEmitter`] trait. The stock
//! implementation, [`GatewayEmitter`], drives a network IR gateway that takes
//! one code per carriage-return terminated line.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::{Channel, ConnectionKind, EventSink};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::tcp::DEFAULT_CONNECT_TIMEOUT;

/// Something that can emit infrared codes.
#[async_trait]
pub trait IrEmitter: Send {
    /// Prepare the emitter.
    async fn open(&mut self) -> Result<()>;

    /// Emit one code.
    async fn emit(&mut self, code: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// IR gateway reachable over TCP.
///
/// Each emission is written as the code followed by `\r`; with a `port`
/// set, the line is prefixed `<port>:` to select the emitter output.
#[derive(Debug)]
pub struct GatewayEmitter {
    addr: String,
    port: Option<u8>,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl GatewayEmitter {
    pub fn new(addr: impl Into<String>) -> Self {
        GatewayEmitter {
            addr: addr.into(),
            port: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
        }
    }

    /// Select an emitter output on multi-port gateways.
    pub fn with_port(mut self, port: u8) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn line(&self, code: &[u8]) -> Vec<u8> {
        let mut line = Vec::with_capacity(code.len() + 5);
        if let Some(port) = self.port {
            line.extend_from_slice(format!("{port}:").as_bytes());
        }
        line.extend_from_slice(code);
        line.push(b'\r');
        line
    }
}

#[async_trait]
impl IrEmitter for GatewayEmitter {
    async fn open(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("IR gateway {}: {}", self.addr, e)))?;
        let _ = stream.set_nodelay(true);
        tracing::info!(addr = %self.addr, "IR gateway connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn emit(&mut self, code: &[u8]) -> Result<()> {
        let line = self.line(code);
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = stream.write_all(&line).await {
            self.stream = None;
            return Err(Error::from_io(e));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            tracing::info!(addr = %self.addr, "IR gateway closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// One-way infrared channel.
///
/// Opening the emitter may dial a remote gateway, so
/// [`connect`](Channel::connect) hands it to a background task and reports
/// `Online` once it is ready. Sends while the emitter is still opening are
/// rejected as not connected.
pub struct IrChannel {
    emitter: Arc<Mutex<Box<dyn IrEmitter>>>,
    opening: Option<JoinHandle<()>>,
}

impl IrChannel {
    pub fn new(emitter: Box<dyn IrEmitter>) -> Self {
        IrChannel {
            emitter: Arc::new(Mutex::new(emitter)),
            opening: None,
        }
    }
}

#[async_trait]
impl Channel for IrChannel {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ir
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        self.disconnect().await?;

        let emitter = Arc::clone(&self.emitter);
        self.opening = Some(tokio::spawn(async move {
            let result = emitter.lock().await.open().await;
            match result {
                Ok(()) => {
                    sink.online();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IR emitter failed to open");
                    sink.offline();
                }
            }
        }));
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut emitter = self.emitter.try_lock().map_err(|_| Error::NotConnected)?;
        if !emitter.is_open() {
            return Err(Error::NotConnected);
        }
        tracing::trace!(code = %String::from_utf8_lossy(payload), "emitting IR code");
        emitter.emit(payload).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        let mut emitter = self.emitter.lock().await;
        if emitter.is_open() {
            emitter.close().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.emitter
            .try_lock()
            .map(|emitter| emitter.is_open())
            .unwrap_or(false)
    }
}

impl Drop for IrChannel {
    fn drop(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
    }
}
