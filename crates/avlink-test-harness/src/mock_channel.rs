//! Mock channel for deterministic testing of the dispatch engine.
//!
//! [`MockChannel`] implements [`Channel`] by recording every payload it is
//! asked to send. Because the engine takes ownership of its channel, tests
//! keep a [`MockRemote`] sharing the same state: it reads the send log,
//! injects inbound bytes through the channel's event sink, and flips the
//! channel between connected and disconnected.
//!
//! # Example
//!
//! ```
//! use avlink_core::ConnectionKind;
//! use avlink_test_harness::MockChannel;
//!
//! let channel = MockChannel::new(ConnectionKind::Serial);
//! let remote = channel.remote();
//! assert!(remote.sent().is_empty());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use avlink_core::channel::{Channel, ChannelEvent, ChannelFactory, EventSink};
use avlink_core::error::{Error, Result};
use avlink_core::types::ConnectionKind;

#[derive(Debug)]
struct MockState {
    /// Log of every payload passed to `send()`.
    sent: Vec<Vec<u8>>,
    connected: bool,
    /// Whether `connect()` reports the link online straight away.
    online_on_connect: bool,
    fail_connect: bool,
    fail_send: bool,
    /// Handshake time simulated by a background task.
    connect_delay: Option<Duration>,
    sink: Option<EventSink>,
    connects: u32,
    disconnects: u32,
    creates: u32,
}

impl MockState {
    fn new(connected: bool) -> Self {
        MockState {
            sent: Vec::new(),
            connected,
            online_on_connect: true,
            fail_connect: false,
            fail_send: false,
            connect_delay: None,
            sink: None,
            connects: 0,
            disconnects: 0,
            creates: 0,
        }
    }
}

type Shared = Arc<Mutex<MockState>>;

fn lock(state: &Shared) -> MutexGuard<'_, MockState> {
    // A panicking test thread must not hide the log from the next assertion.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`Channel`] that records sends instead of touching hardware.
#[derive(Debug)]
pub struct MockChannel {
    kind: ConnectionKind,
    state: Shared,
}

impl MockChannel {
    /// Create a mock channel that is already connected.
    pub fn new(kind: ConnectionKind) -> Self {
        MockChannel {
            kind,
            state: Arc::new(Mutex::new(MockState::new(true))),
        }
    }

    /// A handle sharing this channel's state.
    pub fn remote(&self) -> MockRemote {
        MockRemote {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.fail_connect {
            state.connected = false;
            return Err(Error::Transport("mock connect refused".into()));
        }
        if let Some(delay) = state.connect_delay {
            // Finish the handshake later, unless a newer connect replaced it.
            let shared = Arc::clone(&self.state);
            let epoch = sink.epoch();
            state.connected = false;
            state.sink = Some(sink);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut state = lock(&shared);
                if state.sink.as_ref().map(EventSink::epoch) != Some(epoch) {
                    return;
                }
                state.connected = true;
                if state.online_on_connect {
                    if let Some(sink) = &state.sink {
                        sink.online();
                    }
                }
            });
            return Ok(());
        }
        state.connected = true;
        if state.online_on_connect {
            sink.online();
        }
        state.sink = Some(sink);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }
        if state.fail_send {
            return Err(Error::ConnectionLost);
        }
        state.sent.push(payload.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.disconnects += 1;
        state.connected = false;
        state.sink = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

/// Test-side view of a [`MockChannel`].
#[derive(Debug, Clone)]
pub struct MockRemote {
    kind: ConnectionKind,
    state: Shared,
}

impl MockRemote {
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Every payload sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    /// Sent payloads rendered as strings.
    pub fn sent_strings(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Force the connected flag without emitting any event.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Make subsequent `connect()` calls fail.
    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    /// Make subsequent `send()` calls fail with a lost connection.
    pub fn fail_send(&self, fail: bool) {
        lock(&self.state).fail_send = fail;
    }

    /// Make `connect()` return at once and finish connecting after `delay`,
    /// the way network channels complete their handshake in the background.
    pub fn connect_delay(&self, delay: Option<Duration>) {
        lock(&self.state).connect_delay = delay;
    }

    /// Whether `connect()` immediately reports the link online.
    pub fn online_on_connect(&self, online: bool) {
        lock(&self.state).online_on_connect = online;
    }

    /// Deliver inbound bytes through the current sink.
    ///
    /// Returns `false` if the channel is not connected to an owner.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        self.emit(ChannelEvent::Data(Bytes::copy_from_slice(bytes)))
    }

    /// Deliver an already-framed HTTP-style response.
    pub fn respond(&self, ticket: u64, status: u16, body: &[u8]) -> bool {
        self.emit(ChannelEvent::Response {
            ticket,
            status,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Report the link online through the current sink.
    pub fn go_online(&self) -> bool {
        let mut state = lock(&self.state);
        state.connected = true;
        state.sink.as_ref().is_some_and(|s| s.online())
    }

    /// Drop the link and report it offline through the current sink.
    pub fn go_offline(&self) -> bool {
        let mut state = lock(&self.state);
        state.connected = false;
        state.sink.as_ref().is_some_and(|s| s.offline())
    }

    pub fn emit(&self, event: ChannelEvent) -> bool {
        lock(&self.state)
            .sink
            .as_ref()
            .is_some_and(|s| s.emit(event))
    }

    /// Epoch of the sink handed to the last successful `connect()`.
    pub fn epoch(&self) -> Option<u64> {
        lock(&self.state).sink.as_ref().map(EventSink::epoch)
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.state).disconnects
    }

    /// How many times a factory built a channel for this remote.
    pub fn creates(&self) -> u32 {
        lock(&self.state).creates
    }
}

/// A [`ChannelFactory`] handing out [`MockChannel`]s.
///
/// Each transport gets one shared state, so a remote obtained before the
/// engine starts keeps observing whichever channel the engine creates.
#[derive(Debug, Default)]
pub struct MockFactory {
    states: HashMap<ConnectionKind, Shared>,
    unavailable: Vec<ConnectionKind>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The remote for `kind`, creating its state on first use.
    pub fn remote(&mut self, kind: ConnectionKind) -> MockRemote {
        let state = self
            .states
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(MockState::new(false))));
        MockRemote {
            kind,
            state: Arc::clone(state),
        }
    }

    /// Make `create(kind)` return `None`, as for a transport with no endpoint.
    pub fn unavailable(mut self, kind: ConnectionKind) -> Self {
        self.unavailable.push(kind);
        self
    }
}

impl ChannelFactory for MockFactory {
    fn create(&mut self, kind: ConnectionKind) -> Option<Box<dyn Channel>> {
        if kind == ConnectionKind::None || self.unavailable.contains(&kind) {
            return None;
        }
        let remote = self.remote(kind);
        {
            let mut state = lock(&remote.state);
            state.creates += 1;
            state.connected = false;
            state.sink = None;
        }
        Some(Box::new(MockChannel {
            kind,
            state: remote.state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn records_sent_payloads() {
        let mut channel = MockChannel::new(ConnectionKind::Serial);
        let remote = channel.remote();

        channel.send(b"INPUT 1!\r\n").await.unwrap();
        channel.send(b"INPUT 2!\r\n").await.unwrap();

        assert_eq!(remote.sent_strings(), ["INPUT 1!\r\n", "INPUT 2!\r\n"]);
        remote.clear_sent();
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn send_when_disconnected_fails() {
        let mut channel = MockChannel::new(ConnectionKind::Network);
        channel.remote().set_connected(false);
        let result = channel.send(b"X").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn connect_reports_online_and_inject_reaches_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = MockChannel::new(ConnectionKind::Network);
        let remote = channel.remote();

        channel.connect(EventSink::new(3, tx)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, ChannelEvent::Online);

        assert!(remote.inject(b"OK\r"));
        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.epoch, 3);
        assert_eq!(tagged.event, ChannelEvent::Data(Bytes::from_static(b"OK\r")));
        assert_eq!(remote.epoch(), Some(3));
    }

    #[tokio::test]
    async fn failed_connect_leaves_channel_down() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut channel = MockChannel::new(ConnectionKind::Network);
        let remote = channel.remote();
        remote.fail_connect(true);

        assert!(channel.connect(EventSink::new(1, tx)).await.is_err());
        assert!(!channel.is_connected());
        assert_eq!(remote.connects(), 1);
        assert!(!remote.inject(b"late"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_connect_finishes_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = MockChannel::new(ConnectionKind::Network);
        let remote = channel.remote();
        remote.set_connected(false);
        remote.connect_delay(Some(Duration::from_secs(3)));

        channel.connect(EventSink::new(1, tx.clone())).await.unwrap();
        assert!(!channel.is_connected());
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(channel.is_connected());
        assert_eq!(rx.recv().await.unwrap().event, ChannelEvent::Online);

        // A handshake overtaken by a newer connect never lands.
        channel.disconnect().await.unwrap();
        channel.connect(EventSink::new(2, tx.clone())).await.unwrap();
        channel.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!channel.is_connected());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_detaches_sink() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut channel = MockChannel::new(ConnectionKind::Serial);
        let remote = channel.remote();
        channel.connect(EventSink::new(1, tx)).await.unwrap();

        channel.disconnect().await.unwrap();
        assert!(!remote.is_connected());
        assert_eq!(remote.disconnects(), 1);
        assert!(!remote.inject(b"late"));
    }

    #[test]
    fn factory_shares_state_with_remote() {
        let mut factory = MockFactory::new().unavailable(ConnectionKind::Ir);
        let remote = factory.remote(ConnectionKind::Serial);

        let channel = factory.create(ConnectionKind::Serial).unwrap();
        assert_eq!(channel.kind(), ConnectionKind::Serial);
        assert!(!channel.is_connected());
        assert_eq!(remote.creates(), 1);

        assert!(factory.create(ConnectionKind::Ir).is_none());
        assert!(factory.create(ConnectionKind::None).is_none());
    }
}
