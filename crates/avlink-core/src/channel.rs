//! Channel trait for device communication.
//!
//! The [`Channel`] trait abstracts over the physical path to a switcher.
//! Implementations exist for serial ports, outbound TCP sockets, listening
//! TCP sockets, IR gateways, and HTTP endpoints (in `avlink-transport`), and
//! a scripted mock in `avlink-test-harness`.
//!
//! Channels only know how to push bytes out. Everything they hear back is
//! reported through an [`EventSink`] handed to [`Channel::connect`], so the
//! owning event loop can process inbound traffic serially alongside its
//! timers and caller requests.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::ConnectionKind;

/// Asynchronous send path to a device.
///
/// The dispatch engine is written against this trait only; it never needs
/// to know which concrete channel is active.
#[async_trait]
pub trait Channel: Send {
    /// Which transport this channel implements.
    fn kind(&self) -> ConnectionKind;

    /// Name of the control method, for logging.
    fn control_method(&self) -> &'static str {
        self.kind().method_name()
    }

    /// Open the underlying link.
    ///
    /// Inbound bytes and link state changes must be reported through `sink`
    /// for as long as this connection lives. A channel reports
    /// [`ChannelEvent::Online`] once it can carry traffic.
    ///
    /// Runs inside the link task, so it must not wait on a remote peer.
    /// Anything that can stall (a TCP handshake, a gateway dial) belongs on
    /// a spawned task that later reports `Online`, or `Offline` on failure.
    /// Only local failures, such as a missing serial device, are returned
    /// as errors.
    async fn connect(&mut self, sink: EventSink) -> Result<()>;

    /// Push one already-framed payload to the device.
    ///
    /// Returns [`Error::NotConnected`](crate::error::Error::NotConnected)
    /// if the link is not open.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Close the link. Closing an already-closed channel is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether [`send`](Channel::send) can currently succeed.
    fn is_connected(&self) -> bool;
}

/// Builds the concrete channel for a transport.
///
/// The coordinator asks for a fresh channel each time the active transport
/// changes. Returning `None` means the transport has no endpoint configured.
pub trait ChannelFactory: Send {
    fn create(&mut self, kind: ConnectionKind) -> Option<Box<dyn Channel>>;
}

/// Something a channel observed on its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The link can carry traffic.
    Online,
    /// The link dropped.
    Offline,
    /// Raw stream bytes; may hold partial or several messages.
    Data(Bytes),
    /// A complete HTTP response to the request identified by `ticket`.
    Response { ticket: u64, status: u16, body: Bytes },
}

/// A [`ChannelEvent`] stamped with the connection epoch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: ChannelEvent,
}

/// Where a channel reports inbound traffic.
///
/// Every `connect` gets a sink with a new epoch. Events from a superseded
/// connection still arrive at the owner but are recognised by their stale
/// epoch and dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        EventSink { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Report an event. Returns `false` once the owner has gone away.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    pub fn online(&self) -> bool {
        self.emit(ChannelEvent::Online)
    }

    pub fn offline(&self) -> bool {
        self.emit(ChannelEvent::Offline)
    }

    pub fn data(&self, bytes: impl Into<Bytes>) -> bool {
        self.emit(ChannelEvent::Data(bytes.into()))
    }

    /// Whether the owning event loop has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
