//! Priority command queues.
//!
//! [`CommandQueue`] is a bounded FIFO of [`CommandEnvelope`]s with a
//! configurable [`OverflowPolicy`]. [`PriorityQueues`] bundles the three
//! dispatch tiers and always pops from the highest non-empty one.

use std::collections::VecDeque;

use avlink_core::{CommandEnvelope, Priority};
use tracing::{debug, warn};

/// Default maximum number of entries per tier.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 100;

/// What to do when pushing onto a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the whole backlog, then accept the new entry. The newest command
    /// wins over a stale backlog.
    #[default]
    ClearAndAccept,
    /// Refuse the new entry and keep the backlog.
    RejectNew,
    /// Evict the oldest entry to make room.
    DropOldest,
}

/// Result of a [`CommandQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The backlog of `dropped` entries was discarded before queueing.
    ClearedBacklog { dropped: usize },
    /// The oldest entry was evicted before queueing.
    EvictedOldest,
    /// The new entry was discarded.
    Rejected,
}

impl PushOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, PushOutcome::Rejected)
    }
}

/// A bounded FIFO of pending commands.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    name: &'static str,
    entries: VecDeque<CommandEnvelope>,
    max_size: usize,
    policy: OverflowPolicy,
}

impl CommandQueue {
    pub fn new(name: &'static str, max_size: usize, policy: OverflowPolicy) -> Self {
        CommandQueue {
            name,
            entries: VecDeque::new(),
            max_size: max_size.max(1),
            policy,
        }
    }

    pub fn push(&mut self, entry: CommandEnvelope) -> PushOutcome {
        if self.entries.len() < self.max_size {
            self.entries.push_back(entry);
            return PushOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::ClearAndAccept => {
                let dropped = self.entries.len();
                warn!(
                    queue = self.name,
                    dropped, "queue full, clearing backlog for newest command"
                );
                self.entries.clear();
                self.entries.push_back(entry);
                PushOutcome::ClearedBacklog { dropped }
            }
            OverflowPolicy::DropOldest => {
                if let Some(evicted) = self.entries.pop_front() {
                    warn!(queue = self.name, evicted = %evicted.label(), "queue full, evicting oldest");
                }
                self.entries.push_back(entry);
                PushOutcome::EvictedOldest
            }
            OverflowPolicy::RejectNew => {
                warn!(queue = self.name, rejected = %entry.label(), "queue full, rejecting command");
                PushOutcome::Rejected
            }
        }
    }

    pub fn pop(&mut self) -> Option<CommandEnvelope> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&CommandEnvelope> {
        self.entries.front()
    }

    /// Drop every entry. Clearing an empty queue is a no-op.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(queue = self.name, dropped = self.entries.len(), "queue cleared");
            self.entries.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the capacity. A queue already above the new bound keeps its
    /// entries; the bound applies to later pushes.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
    }

    pub fn set_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }
}

/// The three dispatch tiers.
#[derive(Debug, Clone)]
pub struct PriorityQueues {
    tiers: [CommandQueue; 3],
}

impl PriorityQueues {
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        PriorityQueues {
            tiers: [
                CommandQueue::new("p1", max_size, policy),
                CommandQueue::new("p2", max_size, policy),
                CommandQueue::new("normal", max_size, policy),
            ],
        }
    }

    pub fn push(&mut self, tier: Priority, entry: CommandEnvelope) -> PushOutcome {
        self.tiers[tier.index()].push(entry)
    }

    /// Pop from the highest-priority non-empty tier.
    pub fn pop_next(&mut self) -> Option<(Priority, CommandEnvelope)> {
        Priority::ALL
            .iter()
            .find_map(|&tier| self.tiers[tier.index()].pop().map(|e| (tier, e)))
    }

    /// The entry [`pop_next`](Self::pop_next) would return.
    pub fn peek_next(&self) -> Option<(Priority, &CommandEnvelope)> {
        Priority::ALL
            .iter()
            .find_map(|&tier| self.tiers[tier.index()].peek().map(|e| (tier, e)))
    }

    pub fn tier(&self, tier: Priority) -> &CommandQueue {
        &self.tiers[tier.index()]
    }

    pub fn clear_all(&mut self) {
        for queue in &mut self.tiers {
            queue.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(CommandQueue::is_empty)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(CommandQueue::len).sum()
    }

    /// Queue depth per tier, in drain order.
    pub fn depths(&self) -> [usize; 3] {
        [self.tiers[0].len(), self.tiers[1].len(), self.tiers[2].len()]
    }

    pub fn reconfigure(&mut self, max_size: usize, policy: OverflowPolicy) {
        for queue in &mut self.tiers {
            queue.set_max_size(max_size);
            queue.set_policy(policy);
        }
    }
}
