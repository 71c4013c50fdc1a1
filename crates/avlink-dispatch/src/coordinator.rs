//! Connection state coordinator.
//!
//! Tracks which physical endpoints are bound, resolves them to exactly one
//! active [`ConnectionKind`], and owns the active [`Channel`]. On network
//! transports it also runs the keep-alive and reconnect timers. Keep-alive
//! only runs when a poll command is configured; a link with nothing to poll
//! with is never dropped for being quiet.
//!
//! Precedence, highest first: NetworkServer, Network, URL, Serial, IR. The
//! network binding resolves to NetworkServer or Network depending on the
//! configured [`NetworkMode`].

use avlink_core::{
    BindingKind, Channel, ChannelEvent, ChannelFactory, ConnectionKind, EventSink, LinkEvent,
    NetworkMode, TaggedEvent,
};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::dispatcher::ChannelMut;
use crate::framer::Framer;
use crate::timer::TimerSet;

/// Presence flags for the four physical endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bindings {
    network: bool,
    serial: bool,
    url: bool,
    ir: bool,
}

impl Bindings {
    pub fn is_bound(&self, kind: BindingKind) -> bool {
        match kind {
            BindingKind::Network => self.network,
            BindingKind::Serial => self.serial,
            BindingKind::Url => self.url,
            BindingKind::Ir => self.ir,
        }
    }

    /// Set a flag. Returns `true` if it changed.
    pub fn set(&mut self, kind: BindingKind, bound: bool) -> bool {
        let flag = match kind {
            BindingKind::Network => &mut self.network,
            BindingKind::Serial => &mut self.serial,
            BindingKind::Url => &mut self.url,
            BindingKind::Ir => &mut self.ir,
        };
        let changed = *flag != bound;
        *flag = bound;
        changed
    }

    /// The transport these bindings select.
    pub fn resolve(&self, mode: NetworkMode) -> ConnectionKind {
        if self.network {
            match mode {
                NetworkMode::Server => ConnectionKind::NetworkServer,
                NetworkMode::Client => ConnectionKind::Network,
            }
        } else if self.url {
            ConnectionKind::Url
        } else if self.serial {
            ConnectionKind::Serial
        } else if self.ir {
            ConnectionKind::Ir
        } else {
            ConnectionKind::None
        }
    }
}

/// Keys of the coordinator's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTimer {
    KeepAlive,
    Reconnect,
}

/// Inbound traffic ready for the message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One complete message, delimiter stripped.
    Message(Bytes),
    /// A completed HTTP request.
    Response { ticket: u64, status: u16, body: Bytes },
}

/// Owner of the active channel and its liveness state.
pub struct Coordinator {
    factory: Box<dyn ChannelFactory>,
    bindings: Bindings,
    active: ConnectionKind,
    channel: Option<Box<dyn Channel>>,
    epoch: u64,
    inbound_tx: mpsc::UnboundedSender<TaggedEvent>,
    events: broadcast::Sender<LinkEvent>,
    online: bool,
    missed: u32,
    attempts: u32,
    timers: TimerSet<LinkTimer>,
    framer: Framer,
    network_mode: NetworkMode,
    missed_limit: u32,
    keep_alive_command: Option<Bytes>,
}

impl Coordinator {
    pub fn new(
        factory: Box<dyn ChannelFactory>,
        config: &LinkConfig,
        inbound_tx: mpsc::UnboundedSender<TaggedEvent>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        let mut timers = TimerSet::new();
        timers.register("keep-alive", LinkTimer::KeepAlive, config.keep_alive_interval, true);
        timers.register("reconnect", LinkTimer::Reconnect, config.reconnect_interval, true);

        Coordinator {
            factory,
            bindings: Bindings::default(),
            active: ConnectionKind::None,
            channel: None,
            epoch: 0,
            inbound_tx,
            events,
            online: false,
            missed: 0,
            attempts: 0,
            timers,
            framer: Framer::new(config.delimiter.clone(), config.max_frame_len),
            network_mode: config.network_mode,
            missed_limit: config.missed_keep_alive_limit,
            keep_alive_command: config.keep_alive_command.clone(),
        }
    }

    pub fn active(&self) -> ConnectionKind {
        self.active
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn missed_keep_alives(&self) -> u32 {
        self.missed
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_timer_running(&self, timer: LinkTimer) -> bool {
        self.timers.is_running(timer)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn channel_mut(&mut self) -> ChannelMut<'_> {
        self.channel.as_deref_mut()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Drop any partially received message.
    pub fn reset_framer(&mut self) {
        self.framer.reset();
    }

    /// Record a binding flag change and re-resolve the transport.
    ///
    /// Returns `true` if the flag actually changed; the caller must then
    /// clear the dispatch queues.
    pub async fn set_binding(&mut self, kind: BindingKind, bound: bool, now: Instant) -> bool {
        if !self.bindings.set(kind, bound) {
            debug!(binding = %kind, bound, "binding unchanged");
            return false;
        }
        debug!(binding = %kind, bound, "binding changed");
        self.rebind(now).await;
        true
    }

    /// Apply new settings. A network mode change re-resolves the transport.
    ///
    /// Returns `true` if the active transport changed.
    pub async fn reconfigure(&mut self, config: &LinkConfig, now: Instant) -> bool {
        self.timers
            .set_interval(LinkTimer::KeepAlive, config.keep_alive_interval);
        self.timers
            .set_interval(LinkTimer::Reconnect, config.reconnect_interval);
        self.missed_limit = config.missed_keep_alive_limit;
        self.keep_alive_command = config.keep_alive_command.clone();
        self.framer.set_delimiter(config.delimiter.clone());
        self.framer.set_max_len(config.max_frame_len);
        self.sync_keep_alive(now);

        if self.network_mode == config.network_mode {
            return false;
        }
        self.network_mode = config.network_mode;
        self.rebind(now).await
    }

    async fn rebind(&mut self, now: Instant) -> bool {
        let target = self.bindings.resolve(self.network_mode);
        if target == self.active {
            trace!(method = %target, "transport unchanged");
            return false;
        }
        self.switch_to(target, now).await;
        true
    }

    async fn switch_to(&mut self, target: ConnectionKind, now: Instant) {
        let from = self.active;
        self.timers.stop_all();
        self.release_channel().await;
        self.missed = 0;
        self.attempts = 0;
        self.framer.reset();
        self.active = target;

        info!(from = %from, to = %target, "transport changed");
        self.emit(LinkEvent::TransportChanged { from, to: target });

        if target == ConnectionKind::None {
            return;
        }
        match self.factory.create(target) {
            Some(channel) => {
                self.channel = Some(channel);
                self.connect(now).await;
            }
            None => warn!(method = %target, "no channel available for transport"),
        }
    }

    /// Disconnect and discard the active channel.
    async fn release_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.disconnect().await {
                warn!(method = channel.control_method(), error = %e, "disconnect failed");
            }
        }
        self.mark_offline();
    }

    /// Open the active channel under a fresh epoch.
    async fn connect(&mut self, now: Instant) {
        self.epoch += 1;
        let sink = EventSink::new(self.epoch, self.inbound_tx.clone());
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let method = channel.control_method();
        match channel.connect(sink).await {
            Ok(()) => debug!(method, epoch = self.epoch, "channel connecting"),
            Err(e) => {
                warn!(method, error = %e, "connect failed");
                if self.active.is_stateful() && !self.timers.is_running(LinkTimer::Reconnect) {
                    self.timers.start(LinkTimer::Reconnect, now);
                }
            }
        }
    }

    /// Process one event from a channel.
    pub fn on_channel_event(&mut self, tagged: TaggedEvent, now: Instant) -> Vec<Inbound> {
        if tagged.epoch != self.epoch {
            trace!(
                epoch = tagged.epoch,
                current = self.epoch,
                "discarding event from superseded connection"
            );
            return Vec::new();
        }

        match tagged.event {
            ChannelEvent::Online => {
                self.on_online(now);
                Vec::new()
            }
            ChannelEvent::Offline => {
                self.on_offline(now);
                Vec::new()
            }
            ChannelEvent::Data(bytes) => {
                self.missed = 0;
                if !self.active.is_stream() {
                    return vec![Inbound::Message(bytes)];
                }
                self.framer.feed(&bytes);
                let mut messages = Vec::new();
                while let Some(msg) = self.framer.extract_next() {
                    trace!(message = ?msg, "framed message");
                    messages.push(Inbound::Message(msg));
                }
                messages
            }
            ChannelEvent::Response {
                ticket,
                status,
                body,
            } => {
                self.missed = 0;
                vec![Inbound::Response {
                    ticket,
                    status,
                    body,
                }]
            }
        }
    }

    fn on_online(&mut self, now: Instant) {
        self.timers.stop(LinkTimer::Reconnect);
        self.missed = 0;
        self.attempts = 0;
        if self.online {
            return;
        }
        self.online = true;
        info!(method = %self.active, "online");
        self.sync_keep_alive(now);
        self.emit(LinkEvent::Online { kind: self.active });
    }

    /// Run the keep-alive timer exactly when an online stateful link has a
    /// poll command to send.
    fn sync_keep_alive(&mut self, now: Instant) {
        let wanted =
            self.online && self.active.is_stateful() && self.keep_alive_command.is_some();
        let running = self.timers.is_running(LinkTimer::KeepAlive);
        if wanted && !running {
            self.missed = 0;
            self.timers.start(LinkTimer::KeepAlive, now);
        } else if !wanted && running {
            debug!(method = %self.active, "keep-alive stopped");
            self.timers.stop(LinkTimer::KeepAlive);
            self.missed = 0;
        }
    }

    fn on_offline(&mut self, now: Instant) {
        self.timers.stop(LinkTimer::KeepAlive);
        self.framer.reset();
        self.mark_offline();
        if self.active.is_stateful() && !self.timers.is_running(LinkTimer::Reconnect) {
            self.timers.start(LinkTimer::Reconnect, now);
        }
    }

    fn mark_offline(&mut self) {
        if self.online {
            self.online = false;
            info!(method = %self.active, "offline");
            self.emit(LinkEvent::Offline { kind: self.active });
        }
    }

    /// Fire every timer due at `now`.
    ///
    /// Returns the keep-alive payload to enqueue, if one is due.
    pub async fn poll_timers(&mut self, now: Instant) -> Option<Bytes> {
        let mut poll = None;
        for key in self.timers.expired(now) {
            match key {
                LinkTimer::KeepAlive => poll = self.on_keep_alive(now).await,
                LinkTimer::Reconnect => self.on_reconnect(now).await,
            }
        }
        poll
    }

    async fn on_keep_alive(&mut self, now: Instant) -> Option<Bytes> {
        if self.missed > 0 {
            debug!(missed = self.missed, "keep-alive period without traffic");
            self.emit(LinkEvent::KeepAliveMissed {
                missed: self.missed,
            });
        }

        if self.missed >= self.missed_limit {
            warn!(
                method = %self.active,
                missed = self.missed,
                "keep-alive limit reached, dropping link"
            );
            self.drop_link(now).await;
            return None;
        }

        self.missed += 1;
        self.keep_alive_command.clone()
    }

    /// Disconnect the active channel and arm the reconnect timer.
    async fn drop_link(&mut self, now: Instant) {
        self.timers.stop(LinkTimer::KeepAlive);
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.disconnect().await {
                warn!(method = channel.control_method(), error = %e, "disconnect failed");
            }
        }
        // Late events from the dropped connection are stale from here on.
        self.epoch += 1;
        self.framer.reset();
        self.missed = 0;
        self.mark_offline();
        self.timers.start(LinkTimer::Reconnect, now);
    }

    async fn on_reconnect(&mut self, now: Instant) {
        if self.online || !self.active.is_stateful() || self.channel.is_none() {
            self.timers.stop(LinkTimer::Reconnect);
            return;
        }

        self.attempts += 1;
        info!(method = %self.active, attempt = self.attempts, "reconnecting");
        self.emit(LinkEvent::Reconnecting {
            attempt: self.attempts,
        });

        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.disconnect().await {
                debug!(error = %e, "disconnect before reconnect failed");
            }
        }
        self.connect(now).await;
    }

    /// Stop all timers and close the active channel.
    pub async fn shutdown(&mut self) {
        self.timers.stop_all();
        self.release_channel().await;
        self.epoch += 1;
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avlink_test_harness::{MockFactory, MockRemote};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        coord: Coordinator,
        inbound: mpsc::UnboundedReceiver<TaggedEvent>,
        events: broadcast::Receiver<LinkEvent>,
    }

    impl Fixture {
        fn new(factory: MockFactory, config: LinkConfig) -> Self {
            let (tx, inbound) = mpsc::unbounded_channel();
            let (events_tx, events) = broadcast::channel(64);
            Fixture {
                coord: Coordinator::new(Box::new(factory), &config, tx, events_tx),
                inbound,
                events,
            }
        }

        /// Deliver every pending channel event.
        fn pump(&mut self, now: Instant) -> Vec<Inbound> {
            let mut out = Vec::new();
            while let Ok(ev) = self.inbound.try_recv() {
                out.extend(self.coord.on_channel_event(ev, now));
            }
            out
        }

        fn drain_events(&mut self) -> Vec<LinkEvent> {
            let mut out = Vec::new();
            loop {
                match self.events.try_recv() {
                    Ok(ev) => out.push(ev),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => return out,
                }
            }
        }
    }

    fn factory_with(kinds: &[ConnectionKind]) -> (MockFactory, Vec<MockRemote>) {
        let mut factory = MockFactory::new();
        let remotes = kinds.iter().map(|k| factory.remote(*k)).collect();
        (factory, remotes)
    }

    #[test]
    fn precedence() {
        let mut b = Bindings::default();
        assert_eq!(b.resolve(NetworkMode::Client), ConnectionKind::None);

        b.set(BindingKind::Ir, true);
        assert_eq!(b.resolve(NetworkMode::Client), ConnectionKind::Ir);
        b.set(BindingKind::Serial, true);
        assert_eq!(b.resolve(NetworkMode::Client), ConnectionKind::Serial);
        b.set(BindingKind::Url, true);
        assert_eq!(b.resolve(NetworkMode::Client), ConnectionKind::Url);
        b.set(BindingKind::Network, true);
        assert_eq!(b.resolve(NetworkMode::Client), ConnectionKind::Network);
        assert_eq!(b.resolve(NetworkMode::Server), ConnectionKind::NetworkServer);

        b.set(BindingKind::Url, false);
        b.set(BindingKind::Network, false);
        assert_eq!(b.resolve(NetworkMode::Server), ConnectionKind::Serial);
    }

    #[test]
    fn set_reports_change() {
        let mut b = Bindings::default();
        assert!(b.set(BindingKind::Serial, true));
        assert!(!b.set(BindingKind::Serial, true));
        assert!(b.is_bound(BindingKind::Serial));
        assert!(b.set(BindingKind::Serial, false));
    }

    #[tokio::test]
    async fn binding_serial_connects_and_goes_online() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Serial]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        assert!(f.coord.set_binding(BindingKind::Serial, true, t0).await);
        assert_eq!(f.coord.active(), ConnectionKind::Serial);
        assert_eq!(remotes[0].connects(), 1);
        assert!(f.coord.channel_mut().is_some());

        f.pump(t0);
        assert!(f.coord.is_online());
        // Serial has no keep-alive.
        assert!(!f.coord.is_timer_running(LinkTimer::KeepAlive));
        assert_eq!(
            f.drain_events(),
            [
                LinkEvent::TransportChanged {
                    from: ConnectionKind::None,
                    to: ConnectionKind::Serial
                },
                LinkEvent::Online {
                    kind: ConnectionKind::Serial
                },
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_binding_is_noop() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Serial]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Serial, true, t0).await;
        assert!(!f.coord.set_binding(BindingKind::Serial, true, t0).await);
        assert_eq!(remotes[0].creates(), 1);
    }

    #[tokio::test]
    async fn higher_precedence_binding_switches_transport() {
        let (factory, remotes) =
            factory_with(&[ConnectionKind::Serial, ConnectionKind::Network]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Serial, true, t0).await;
        f.pump(t0);
        f.coord.set_binding(BindingKind::Network, true, t0).await;

        assert_eq!(f.coord.active(), ConnectionKind::Network);
        assert_eq!(remotes[0].disconnects(), 1);
        assert_eq!(remotes[1].connects(), 1);

        // Serial's late online event belongs to an old epoch.
        remotes[0].go_online();
        f.pump(t0);
        assert!(f.coord.is_online());
        assert_eq!(f.coord.epoch(), remotes[1].epoch().unwrap());
    }

    #[tokio::test]
    async fn lower_precedence_binding_keeps_transport() {
        let (factory, remotes) =
            factory_with(&[ConnectionKind::Network, ConnectionKind::Ir]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        assert!(f.coord.set_binding(BindingKind::Ir, true, t0).await);
        assert_eq!(f.coord.active(), ConnectionKind::Network);
        assert_eq!(remotes[0].creates(), 1);
        assert_eq!(remotes[1].creates(), 0);
    }

    #[tokio::test]
    async fn unbinding_everything_leaves_none() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Url]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Url, true, t0).await;
        f.pump(t0);
        f.coord.set_binding(BindingKind::Url, false, t0).await;

        assert_eq!(f.coord.active(), ConnectionKind::None);
        assert!(f.coord.channel_mut().is_none());
        assert!(!f.coord.is_online());
        assert_eq!(remotes[0].disconnects(), 1);
    }

    #[tokio::test]
    async fn unavailable_transport_leaves_no_channel() {
        let factory = MockFactory::new().unavailable(ConnectionKind::Ir);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Ir, true, t0).await;
        assert_eq!(f.coord.active(), ConnectionKind::Ir);
        assert!(f.coord.channel_mut().is_none());
    }

    #[tokio::test]
    async fn server_mode_selects_network_server() {
        let (factory, remotes) = factory_with(&[ConnectionKind::NetworkServer]);
        let config = LinkConfig {
            network_mode: NetworkMode::Server,
            ..Default::default()
        };
        let mut f = Fixture::new(factory, config);
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        assert_eq!(f.coord.active(), ConnectionKind::NetworkServer);
        assert_eq!(remotes[0].connects(), 1);
    }

    #[tokio::test]
    async fn network_mode_change_rebinds() {
        let (factory, remotes) =
            factory_with(&[ConnectionKind::Network, ConnectionKind::NetworkServer]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        let config = LinkConfig {
            network_mode: NetworkMode::Server,
            ..Default::default()
        };
        assert!(f.coord.reconfigure(&config, t0).await);
        assert_eq!(f.coord.active(), ConnectionKind::NetworkServer);
        assert_eq!(remotes[0].disconnects(), 1);
        assert_eq!(remotes[1].connects(), 1);
    }

    #[tokio::test]
    async fn stream_data_is_framed() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        remotes[0].inject(b"OUT1 IN");
        assert!(f.pump(t0).is_empty());
        remotes[0].inject(b"2\r\nOK\r\n");
        assert_eq!(
            f.pump(t0),
            [
                Inbound::Message(Bytes::from_static(b"OUT1 IN2")),
                Inbound::Message(Bytes::from_static(b"OK")),
            ]
        );
    }

    #[tokio::test]
    async fn responses_bypass_framer() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Url]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Url, true, t0).await;
        remotes[0].respond(7, 200, b"ok");
        let inbound = f.pump(t0);
        assert_eq!(
            inbound.last(),
            Some(&Inbound::Response {
                ticket: 7,
                status: 200,
                body: Bytes::from_static(b"ok"),
            })
        );
    }

    #[tokio::test]
    async fn keep_alive_polls_each_period() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let config = LinkConfig {
            keep_alive_command: Some(Bytes::from_static(b"PING")),
            ..Default::default()
        };
        let interval = config.keep_alive_interval;
        let mut f = Fixture::new(factory, config);
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        f.pump(t0);

        let t1 = t0 + interval;
        assert_eq!(f.coord.poll_timers(t1).await, Some(Bytes::from_static(b"PING")));
        assert_eq!(f.coord.missed_keep_alives(), 1);

        // A reply clears the counter.
        remotes[0].inject(b"PONG\r\n");
        f.pump(t1);
        assert_eq!(f.coord.missed_keep_alives(), 0);

        assert!(f.coord.poll_timers(t1 + interval).await.is_some());
        assert_eq!(f.coord.missed_keep_alives(), 1);
    }

    #[tokio::test]
    async fn three_missed_keep_alives_drop_link_and_arm_reconnect() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let config = LinkConfig {
            keep_alive_command: Some(Bytes::from_static(b"PING")),
            ..Default::default()
        };
        let interval = config.keep_alive_interval;
        let mut f = Fixture::new(factory, config);
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        f.pump(t0);
        f.drain_events();

        let mut now = t0;
        for _ in 0..3 {
            now += interval;
            f.coord.poll_timers(now).await;
            assert!(f.coord.is_online());
        }
        assert_eq!(f.coord.missed_keep_alives(), 3);
        assert_eq!(remotes[0].disconnects(), 0);

        now += interval;
        f.coord.poll_timers(now).await;
        assert!(!f.coord.is_online());
        assert_eq!(remotes[0].disconnects(), 1);
        assert!(f.coord.is_timer_running(LinkTimer::Reconnect));
        assert!(!f.coord.is_timer_running(LinkTimer::KeepAlive));
        // Not an immediate reconnect.
        assert_eq!(remotes[0].connects(), 1);

        let events = f.drain_events();
        assert!(events.contains(&LinkEvent::KeepAliveMissed { missed: 3 }));
        assert_eq!(
            events.last(),
            Some(&LinkEvent::Offline {
                kind: ConnectionKind::Network
            })
        );
    }

    #[tokio::test]
    async fn reconnect_retries_until_online() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let config = LinkConfig::default();
        let backoff = config.reconnect_interval;
        let mut f = Fixture::new(factory, config);
        let t0 = Instant::now();

        remotes[0].fail_connect(true);
        f.coord.set_binding(BindingKind::Network, true, t0).await;
        assert!(f.coord.is_timer_running(LinkTimer::Reconnect));

        let t1 = t0 + backoff;
        f.coord.poll_timers(t1).await;
        assert_eq!(f.coord.reconnect_attempts(), 1);
        assert_eq!(remotes[0].connects(), 2);

        remotes[0].fail_connect(false);
        let t2 = t1 + backoff;
        f.coord.poll_timers(t2).await;
        assert_eq!(remotes[0].connects(), 3);
        f.pump(t2);

        assert!(f.coord.is_online());
        assert!(!f.coord.is_timer_running(LinkTimer::Reconnect));
        assert_eq!(f.coord.reconnect_attempts(), 0);
        assert!(f
            .drain_events()
            .contains(&LinkEvent::Reconnecting { attempt: 2 }));
    }

    #[tokio::test]
    async fn offline_event_arms_reconnect_on_network_only() {
        let (factory, remotes) =
            factory_with(&[ConnectionKind::Network, ConnectionKind::Serial]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        f.pump(t0);
        remotes[0].go_offline();
        f.pump(t0);
        assert!(!f.coord.is_online());
        assert!(f.coord.is_timer_running(LinkTimer::Reconnect));

        // Leaving Network cancels its reconnect timer.
        f.coord.set_binding(BindingKind::Network, false, t0).await;
        f.coord.set_binding(BindingKind::Serial, true, t0).await;
        assert!(!f.coord.is_timer_running(LinkTimer::Reconnect));
        f.pump(t0);
        remotes[1].go_offline();
        f.pump(t0);
        assert!(!f.coord.is_timer_running(LinkTimer::Reconnect));
    }

    #[tokio::test]
    async fn late_events_after_drop_are_stale() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let mut f = Fixture::new(factory, LinkConfig::default());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        let old_epoch = f.coord.epoch();
        f.pump(t0);
        f.coord.shutdown().await;

        let stale = TaggedEvent {
            epoch: old_epoch,
            event: ChannelEvent::Data(Bytes::from_static(b"late\r\n")),
        };
        assert!(f.coord.on_channel_event(stale, t0).is_empty());
        assert!(!f.coord.is_online());
        assert!(remotes[0].disconnects() >= 1);
    }

    #[tokio::test]
    async fn quiet_link_without_poll_command_stays_up() {
        let (factory, remotes) = factory_with(&[ConnectionKind::Network]);
        let config = LinkConfig::default();
        let interval = config.keep_alive_interval;
        let mut f = Fixture::new(factory, config);
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        f.pump(t0);
        assert!(!f.coord.is_timer_running(LinkTimer::KeepAlive));
        assert_eq!(f.coord.next_deadline(), None);

        let later = t0 + interval * 10;
        assert_eq!(f.coord.poll_timers(later).await, None);
        assert!(f.coord.is_online());
        assert_eq!(f.coord.missed_keep_alives(), 0);
        assert_eq!(remotes[0].disconnects(), 0);
    }

    #[tokio::test]
    async fn reconfigure_toggles_keep_alive_with_poll_command() {
        let (factory, _remotes) = factory_with(&[ConnectionKind::Network]);
        let mut config = LinkConfig::default();
        let mut f = Fixture::new(factory, config.clone());
        let t0 = Instant::now();

        f.coord.set_binding(BindingKind::Network, true, t0).await;
        f.pump(t0);
        assert!(!f.coord.is_timer_running(LinkTimer::KeepAlive));

        config.keep_alive_command = Some(Bytes::from_static(b"?"));
        f.coord.reconfigure(&config, t0).await;
        assert!(f.coord.is_timer_running(LinkTimer::KeepAlive));
        let t1 = t0 + config.keep_alive_interval;
        assert_eq!(f.coord.poll_timers(t1).await, Some(Bytes::from_static(b"?")));
        assert_eq!(f.coord.missed_keep_alives(), 1);

        config.keep_alive_command = None;
        f.coord.reconfigure(&config, t1).await;
        assert!(!f.coord.is_timer_running(LinkTimer::KeepAlive));
        assert_eq!(f.coord.missed_keep_alives(), 0);
    }
}
