//! The command dispatch state machine.
//!
//! [`Dispatcher`] owns the three priority queues, the single in-flight slot,
//! the retry counter, and the two timers that pace the link:
//!
//! - **Delay** -- armed after each send when no acknowledgement is expected;
//!   when it fires the next command goes out.
//! - **AckWait** -- armed after each send when an acknowledgement is
//!   expected; when it fires the same command is resent, up to
//!   `max_retries` times, then discarded.
//!
//! At most one of the two is ever armed, so at most one command is ever in
//! flight. The dispatcher never blocks: every entry point runs to completion
//! and leaves a timer armed (or goes idle).
//!
//! Queue order is the only thing a new urgent command can pre-empt. A
//! command already sent keeps its slot until it resolves.

use std::time::Duration;

use avlink_core::{Channel, CommandEnvelope, Priority};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::framer::Framing;
use crate::queue::{PriorityQueues, PushOutcome};
use crate::timer::TimerSet;

/// The active channel, if any transport is bound.
pub type ChannelMut<'a> = Option<&'a mut (dyn Channel + 'static)>;

/// Observable state of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing is pacing the link; the next enqueue sends immediately.
    Idle,
    /// A command went out and the inter-command delay is running.
    Sending,
    /// A command went out and its acknowledgement is awaited.
    AwaitingAck,
}

/// Keys of the dispatcher's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTimer {
    Delay,
    AckWait,
}

/// What happened to the in-flight command on a transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transmit {
    /// Sent, and a pacing timer is armed.
    Armed,
    /// Sent with a zero delay; the slot is already free.
    Immediate,
    /// Not sent; the command was discarded.
    Dropped,
}

/// Priority queues plus the retry/acknowledgement state machine.
#[derive(Debug)]
pub struct Dispatcher {
    queues: PriorityQueues,
    in_flight: Option<CommandEnvelope>,
    retries: u32,
    timers: TimerSet<DispatchTimer>,
    command_delay: Duration,
    ack_timeout: Duration,
    max_retries: u32,
    require_ack: bool,
    framing: Framing,
}

impl Dispatcher {
    pub fn new(config: &LinkConfig) -> Self {
        let mut timers = TimerSet::new();
        timers.register("command-delay", DispatchTimer::Delay, config.command_delay, false);
        timers.register("ack-wait", DispatchTimer::AckWait, config.ack_timeout, false);

        Dispatcher {
            queues: PriorityQueues::new(config.queue_max_size, config.overflow_policy),
            in_flight: None,
            retries: 0,
            timers,
            command_delay: config.command_delay,
            ack_timeout: config.ack_timeout,
            max_retries: config.max_retries,
            require_ack: config.require_ack,
            framing: config.framing.clone(),
        }
    }

    /// Apply new settings. Armed timers keep their deadlines.
    pub fn reconfigure(&mut self, config: &LinkConfig) {
        self.queues
            .reconfigure(config.queue_max_size, config.overflow_policy);
        self.command_delay = config.command_delay;
        self.ack_timeout = config.ack_timeout;
        self.max_retries = config.max_retries;
        self.require_ack = config.require_ack;
        self.framing = config.framing.clone();
    }

    pub fn state(&self) -> DispatchState {
        if self.timers.is_running(DispatchTimer::AckWait) {
            DispatchState::AwaitingAck
        } else if self.timers.is_running(DispatchTimer::Delay) {
            DispatchState::Sending
        } else {
            DispatchState::Idle
        }
    }

    /// Whether a pacing timer is armed.
    pub fn is_busy(&self) -> bool {
        self.timers.running() > 0
    }

    /// Number of armed pacing timers (never more than one).
    pub fn armed_timers(&self) -> usize {
        self.timers.running()
    }

    pub fn in_flight(&self) -> Option<&CommandEnvelope> {
        self.in_flight.as_ref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn queues(&self) -> &PriorityQueues {
        &self.queues
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Queue a command and, if the link is idle, send the next one.
    pub async fn enqueue(
        &mut self,
        tier: Priority,
        envelope: CommandEnvelope,
        channel: ChannelMut<'_>,
        now: Instant,
    ) -> PushOutcome {
        trace!(%tier, command = %envelope.label(), "enqueue");
        let outcome = self.queues.push(tier, envelope);
        if !self.is_busy() {
            self.advance(channel, now).await;
        }
        outcome
    }

    /// The device acknowledged the in-flight command.
    pub async fn handle_ack(&mut self, channel: ChannelMut<'_>, now: Instant) {
        if !self.timers.is_running(DispatchTimer::AckWait) {
            debug!("acknowledgement with nothing awaiting one, ignoring");
            return;
        }
        self.timers.stop(DispatchTimer::AckWait);
        if let Some(envelope) = self.in_flight.take() {
            debug!(
                command = %envelope.label(),
                retries = self.retries,
                "command acknowledged"
            );
        }
        self.retries = 0;
        self.advance(channel, now).await;
    }

    /// Drop every queued command and abandon the in-flight one.
    ///
    /// An armed timer is left running; when it fires it finds nothing to
    /// resend and the dispatcher goes idle.
    pub fn clear(&mut self) {
        self.queues.clear_all();
        if let Some(envelope) = self.in_flight.take() {
            debug!(command = %envelope.label(), "abandoning in-flight command");
        }
        self.retries = 0;
    }

    /// Fire every timer due at `now`.
    pub async fn poll_timers(&mut self, mut channel: ChannelMut<'_>, now: Instant) {
        for key in self.timers.expired(now) {
            self.on_timer(key, channel.as_deref_mut(), now).await;
        }
    }

    async fn on_timer(&mut self, key: DispatchTimer, mut channel: ChannelMut<'_>, now: Instant) {
        match key {
            DispatchTimer::Delay => {
                if let Some(envelope) = self.in_flight.take() {
                    trace!(command = %envelope.label(), "command delay elapsed");
                }
                self.retries = 0;
                self.advance(channel, now).await;
            }
            DispatchTimer::AckWait => {
                let Some(label) = self.in_flight.as_ref().map(CommandEnvelope::label) else {
                    debug!("ack wait elapsed with no command in flight");
                    self.advance(channel, now).await;
                    return;
                };

                self.retries += 1;
                if self.retries <= self.max_retries {
                    debug!(
                        command = %label,
                        retry = self.retries,
                        max_retries = self.max_retries,
                        "no acknowledgement, resending"
                    );
                    if self.transmit(channel.as_deref_mut(), now).await == Transmit::Immediate {
                        self.advance(channel, now).await;
                    }
                } else {
                    warn!(
                        command = %label,
                        attempts = self.retries,
                        "no acknowledgement after retries, discarding command"
                    );
                    self.in_flight = None;
                    self.retries = 0;
                    self.advance(channel, now).await;
                }
            }
        }
    }

    /// Send queued commands until a timer is armed or the queues run dry.
    async fn advance(&mut self, mut channel: ChannelMut<'_>, now: Instant) {
        while let Some((tier, envelope)) = self.queues.pop_next() {
            trace!(%tier, command = %envelope.label(), "dispatching");
            self.in_flight = Some(envelope);
            self.retries = 0;
            match self.transmit(channel.as_deref_mut(), now).await {
                Transmit::Armed | Transmit::Dropped => return,
                Transmit::Immediate => continue,
            }
        }
    }

    /// Put the in-flight command on the wire and arm the matching timer.
    async fn transmit(&mut self, channel: ChannelMut<'_>, now: Instant) -> Transmit {
        let (payload, delay, label) = match &self.in_flight {
            Some(e) => (e.payload().clone(), e.delay(), e.label()),
            None => return Transmit::Dropped,
        };

        let Some(channel) = channel else {
            warn!(command = %label, "no transport bound, dropping command");
            self.drop_in_flight();
            return Transmit::Dropped;
        };

        let kind = channel.kind();
        if !channel.is_connected() {
            warn!(
                method = channel.control_method(),
                command = %label,
                "channel not connected, dropping command"
            );
            self.drop_in_flight();
            return Transmit::Dropped;
        }

        let frame = if kind.is_stream() {
            self.framing.wrap(&payload)
        } else {
            payload
        };

        if let Err(e) = channel.send(&frame).await {
            warn!(
                method = channel.control_method(),
                command = %label,
                error = %e,
                "send failed, dropping command"
            );
            self.drop_in_flight();
            return Transmit::Dropped;
        }
        trace!(method = channel.control_method(), frame = ?frame, "sent");

        if self.require_ack && kind.is_bidirectional() {
            self.timers
                .start_with(DispatchTimer::AckWait, now, self.ack_timeout);
            return Transmit::Armed;
        }

        let delay = delay.unwrap_or(self.command_delay);
        if delay.is_zero() {
            self.in_flight = None;
            self.retries = 0;
            return Transmit::Immediate;
        }
        self.timers.start_with(DispatchTimer::Delay, now, delay);
        Transmit::Armed
    }

    fn drop_in_flight(&mut self) {
        self.in_flight = None;
        self.retries = 0;
    }
}
