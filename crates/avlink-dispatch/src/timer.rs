//! Logical timers for the single-owner event loop.
//!
//! Timers never spawn anything. Each [`LogicalTimer`] just remembers a
//! deadline; the owning loop sleeps until the earliest deadline across its
//! [`TimerSet`]s, then asks each set which keys expired and dispatches on
//! the key. The key is the fixed callback argument: it tells the owner which
//! timer fired without any shared state.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// A named, cancelable one-shot or repeating timer.
#[derive(Debug, Clone)]
pub struct LogicalTimer<K> {
    name: &'static str,
    key: K,
    interval: Duration,
    repeating: bool,
    deadline: Option<Instant>,
}

impl<K: Copy> LogicalTimer<K> {
    pub fn new(name: &'static str, key: K, interval: Duration, repeating: bool) -> Self {
        LogicalTimer {
            name,
            key,
            interval,
            repeating,
            deadline: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn key(&self) -> K {
        self.key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    /// Change the interval used by the next [`start`](Self::start).
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Arm with the stored interval, replacing any prior arming.
    pub fn start(&mut self, now: Instant) {
        self.arm(now, self.interval);
    }

    /// Arm with a new interval and repeat flag, replacing any prior arming.
    pub fn start_with(&mut self, now: Instant, interval: Duration, repeating: bool) {
        self.interval = interval;
        self.repeating = repeating;
        self.arm(now, interval);
    }

    fn arm(&mut self, now: Instant, interval: Duration) {
        if interval.is_zero() {
            // A zero-length arming never fires.
            warn!(timer = self.name, "ignoring zero-length timer arming");
            self.deadline = None;
            return;
        }
        self.deadline = Some(now + interval);
    }

    /// Disarm. Idempotent.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.deadline.is_none()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume an expiry at `now`.
    ///
    /// Returns `true` if the timer was due. One-shot timers disarm; repeating
    /// timers re-arm one interval after `now`, so a late wakeup fires once
    /// rather than replaying every missed period.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = if self.repeating {
                    Some(now + self.interval)
                } else {
                    None
                };
                true
            }
            _ => false,
        }
    }
}

/// The timers owned by one component, addressable by key.
#[derive(Debug, Clone, Default)]
pub struct TimerSet<K> {
    timers: Vec<LogicalTimer<K>>,
}

impl<K: Copy + Eq + std::fmt::Debug> TimerSet<K> {
    pub fn new() -> Self {
        TimerSet { timers: Vec::new() }
    }

    /// Add a stopped timer. Registering an existing key replaces it.
    pub fn register(&mut self, name: &'static str, key: K, interval: Duration, repeating: bool) {
        self.timers.retain(|t| t.key != key);
        self.timers
            .push(LogicalTimer::new(name, key, interval, repeating));
    }

    pub fn get(&self, key: K) -> Option<&LogicalTimer<K>> {
        self.timers.iter().find(|t| t.key == key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut LogicalTimer<K>> {
        self.timers.iter_mut().find(|t| t.key == key)
    }

    pub fn start(&mut self, key: K, now: Instant) {
        match self.get_mut(key) {
            Some(timer) => timer.start(now),
            None => warn!(?key, "start on unregistered timer"),
        }
    }

    pub fn start_with(&mut self, key: K, now: Instant, interval: Duration) {
        match self.get_mut(key) {
            Some(timer) => {
                let repeating = timer.is_repeating();
                timer.start_with(now, interval, repeating);
            }
            None => warn!(?key, "start on unregistered timer"),
        }
    }

    pub fn stop(&mut self, key: K) {
        if let Some(timer) = self.get_mut(key) {
            timer.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for timer in &mut self.timers {
            timer.stop();
        }
    }

    pub fn set_interval(&mut self, key: K, interval: Duration) {
        if let Some(timer) = self.get_mut(key) {
            timer.set_interval(interval);
        }
    }

    pub fn is_running(&self, key: K) -> bool {
        self.get(key).is_some_and(|t| t.is_running())
    }

    /// Number of armed timers.
    pub fn running(&self) -> usize {
        self.timers.iter().filter(|t| t.is_running()).count()
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.deadline()).min()
    }

    /// Fire every timer due at `now` and return their keys, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .timers
            .iter()
            .filter_map(|t| t.deadline().filter(|d| *d <= now).map(|d| (d, t.key)))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        for (_, key) in &due {
            if let Some(timer) = self.get_mut(*key) {
                timer.fire(now);
            }
        }
        due.into_iter().map(|(_, key)| key).collect()
    }
}
