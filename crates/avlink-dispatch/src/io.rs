//! The link task.
//!
//! One tokio task owns the [`Coordinator`] (and through it the active
//! channel), the [`Dispatcher`], and the caller's [`MessageHandler`]. Timer
//! expiry, inbound channel traffic, and caller requests all arrive as
//! messages into a single `tokio::select!` loop, so nothing is ever mutated
//! concurrently and every event runs to completion before the next.

use std::ops::ControlFlow;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use avlink_core::error::{Error, Result};
use avlink_core::{
    BindingKind, ChannelFactory, CommandEnvelope, ConnectionKind, LinkEvent, Priority, TaggedEvent,
};

use crate::config::LinkConfig;
use crate::coordinator::{Coordinator, Inbound};
use crate::dispatcher::{DispatchState, Dispatcher};
use crate::queue::PushOutcome;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A request sent from a [`LinkHandle`] to the link task.
pub enum Request {
    /// Queue a command. Fire-and-forget.
    Enqueue {
        tier: Priority,
        envelope: CommandEnvelope,
    },
    /// The device acknowledged the in-flight command.
    Ack,
    /// A physical endpoint attached or detached.
    BindingChanged { binding: BindingKind, bound: bool },
    /// Drop every queued command and the in-flight one.
    ClearQueues,
    /// Replace the link configuration.
    Reconfigure {
        config: Box<LinkConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Snapshot the link state.
    Status { reply: oneshot::Sender<LinkStatus> },
    /// Disconnect and stop the task.
    Shutdown { reply: oneshot::Sender<()> },
}

/// How a handler classified an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Acknowledges the in-flight command.
    Ack,
    /// Anything else. Logged and otherwise ignored by the link.
    Unsolicited,
}

/// Receives every complete inbound message.
///
/// The link never interprets message content itself; acknowledgement
/// detection belongs to the handler. Returning an error discards whatever
/// partial data the framer is holding.
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: &[u8]) -> Result<MessageKind>;

    /// A completed HTTP request. Defaults to treating the body as a message.
    fn on_response(&mut self, ticket: u64, status: u16, body: &[u8]) -> Result<MessageKind> {
        let _ = (ticket, status);
        self.on_message(body)
    }
}

impl<F> MessageHandler for F
where
    F: FnMut(&[u8]) -> Result<MessageKind> + Send + 'static,
{
    fn on_message(&mut self, message: &[u8]) -> Result<MessageKind> {
        self(message)
    }
}

/// Handler that treats every message as unsolicited.
pub struct NullHandler;

impl MessageHandler for NullHandler {
    fn on_message(&mut self, _message: &[u8]) -> Result<MessageKind> {
        Ok(MessageKind::Unsolicited)
    }
}

/// Handler that acknowledges on any message starting with a fixed prefix.
pub struct PrefixAckHandler {
    prefix: Bytes,
}

impl PrefixAckHandler {
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        PrefixAckHandler {
            prefix: prefix.into(),
        }
    }
}

impl MessageHandler for PrefixAckHandler {
    fn on_message(&mut self, message: &[u8]) -> Result<MessageKind> {
        if message.starts_with(&self.prefix) {
            Ok(MessageKind::Ack)
        } else {
            Ok(MessageKind::Unsolicited)
        }
    }
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub active: ConnectionKind,
    pub online: bool,
    pub state: DispatchState,
    /// Queue depths in drain order: P1, P2, normal.
    pub depths: [usize; 3],
    pub retries: u32,
    /// Label of the command awaiting resolution, if any.
    pub in_flight: Option<String>,
}

/// Handle to the link task.
pub struct LinkHandle {
    tx: mpsc::Sender<Request>,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LinkHandle {
    async fn request(&self, req: Request) -> Result<()> {
        self.tx.send(req).await.map_err(|_| Error::NotConnected)
    }

    /// Queue a command at the given priority.
    pub async fn enqueue(&self, tier: Priority, envelope: CommandEnvelope) -> Result<()> {
        self.request(Request::Enqueue { tier, envelope }).await
    }

    /// Queue a bare payload at the given priority.
    pub async fn send(&self, tier: Priority, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(tier, CommandEnvelope::new(payload)).await
    }

    /// Signal that the device acknowledged the in-flight command.
    pub async fn ack(&self) -> Result<()> {
        self.request(Request::Ack).await
    }

    /// Report an endpoint attaching or detaching.
    pub async fn binding_changed(&self, binding: BindingKind, bound: bool) -> Result<()> {
        self.request(Request::BindingChanged { binding, bound }).await
    }

    /// Drop all queued work, including the in-flight command.
    pub async fn clear(&self) -> Result<()> {
        self.request(Request::ClearQueues).await
    }

    /// Apply a new configuration without restarting the link.
    pub async fn reconfigure(&self, config: LinkConfig) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Request::Reconfigure {
            config: Box::new(config),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    pub async fn status(&self) -> Result<LinkStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Request::Status { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| Error::NotConnected)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Disconnect the active channel and stop the task.
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        } else {
            self.cancel.cancel();
        }
        let _ = self.task.await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the link task. No transport is active until a binding is reported.
pub fn spawn_link(
    factory: Box<dyn ChannelFactory>,
    config: LinkConfig,
    handler: Box<dyn MessageHandler>,
) -> Result<LinkHandle> {
    config.validate()?;

    let (tx, rx) = mpsc::channel::<Request>(64);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TaggedEvent>();
    let (events, _) = broadcast::channel::<LinkEvent>(64);
    let cancel = CancellationToken::new();

    let link = Link {
        dispatcher: Dispatcher::new(&config),
        coordinator: Coordinator::new(factory, &config, inbound_tx, events.clone()),
        handler,
        config,
    };
    let task = tokio::spawn(link_loop(link, rx, inbound_rx, cancel.clone()));

    Ok(LinkHandle {
        tx,
        events,
        cancel,
        task,
    })
}

// ---------------------------------------------------------------------------
// Link loop
// ---------------------------------------------------------------------------

struct Link {
    dispatcher: Dispatcher,
    coordinator: Coordinator,
    handler: Box<dyn MessageHandler>,
    config: LinkConfig,
}

/// Runs as a spawned task.
///
/// `biased` order: cancellation, timers, inbound traffic, requests. Timers
/// come first so a due ACK timeout is handled before a request that arrived
/// after it.
async fn link_loop(
    mut link: Link,
    mut requests: mpsc::Receiver<Request>,
    mut inbound: mpsc::UnboundedReceiver<TaggedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = link.next_deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("link task cancelled");
                link.coordinator.shutdown().await;
                break;
            }

            _ = sleep_until(deadline) => {
                link.on_timers(Instant::now()).await;
            }

            Some(event) = inbound.recv() => {
                link.on_channel_event(event, Instant::now()).await;
            }

            req = requests.recv() => {
                match req {
                    Some(req) => {
                        if link.handle_request(req, Instant::now()).await.is_break() {
                            return;
                        }
                    }
                    None => {
                        debug!("all link handles dropped, exiting link task");
                        link.coordinator.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl Link {
    fn next_deadline(&self) -> Option<Instant> {
        match (
            self.dispatcher.next_deadline(),
            self.coordinator.next_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_timers(&mut self, now: Instant) {
        if let Some(poll) = self.coordinator.poll_timers(now).await {
            let envelope = CommandEnvelope::new(poll).with_name("keep-alive");
            self.dispatcher
                .enqueue(Priority::Normal, envelope, self.coordinator.channel_mut(), now)
                .await;
        }
        self.dispatcher
            .poll_timers(self.coordinator.channel_mut(), now)
            .await;
    }

    async fn on_channel_event(&mut self, event: TaggedEvent, now: Instant) {
        for inbound in self.coordinator.on_channel_event(event, now) {
            let result = match &inbound {
                Inbound::Message(msg) => self.handler.on_message(msg),
                Inbound::Response {
                    ticket,
                    status,
                    body,
                } => self.handler.on_response(*ticket, *status, body),
            };

            match result {
                Ok(MessageKind::Ack) => {
                    self.dispatcher
                        .handle_ack(self.coordinator.channel_mut(), now)
                        .await;
                }
                Ok(MessageKind::Unsolicited) => {
                    debug!(message = ?inbound, "unsolicited message");
                }
                Err(e) => {
                    warn!(error = %e, "message handler failed, resetting framer");
                    self.coordinator.reset_framer();
                }
            }
        }
    }

    /// Apply one caller request. `Break` means the task should exit.
    async fn handle_request(&mut self, req: Request, now: Instant) -> ControlFlow<()> {
        match req {
            Request::Enqueue { tier, envelope } => {
                let label = envelope.label();
                let outcome = self
                    .dispatcher
                    .enqueue(tier, envelope, self.coordinator.channel_mut(), now)
                    .await;
                match outcome {
                    PushOutcome::Queued => {}
                    PushOutcome::ClearedBacklog { dropped } => {
                        warn!(%tier, dropped, "queue full, backlog cleared");
                    }
                    PushOutcome::EvictedOldest => {
                        warn!(%tier, "queue full, oldest command evicted");
                    }
                    PushOutcome::Rejected => {
                        warn!(%tier, command = %label, "queue full, command rejected");
                    }
                }
            }
            Request::Ack => {
                self.dispatcher
                    .handle_ack(self.coordinator.channel_mut(), now)
                    .await;
            }
            Request::BindingChanged { binding, bound } => {
                if self.coordinator.set_binding(binding, bound, now).await {
                    self.dispatcher.clear();
                }
            }
            Request::ClearQueues => self.dispatcher.clear(),
            Request::Reconfigure { config, reply } => {
                let result = self.reconfigure(*config, now).await;
                let _ = reply.send(result);
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown { reply } => {
                debug!("link shutdown requested");
                self.coordinator.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn reconfigure(&mut self, config: LinkConfig, now: Instant) -> Result<()> {
        config.validate()?;
        self.dispatcher.reconfigure(&config);
        if self.coordinator.reconfigure(&config, now).await {
            self.dispatcher.clear();
        }
        debug!(?config, "link reconfigured");
        self.config = config;
        Ok(())
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            active: self.coordinator.active(),
            online: self.coordinator.is_online(),
            state: self.dispatcher.state(),
            depths: self.dispatcher.queues().depths(),
            retries: self.dispatcher.retries(),
            in_flight: self.dispatcher.in_flight().map(CommandEnvelope::label),
        }
    }
}
