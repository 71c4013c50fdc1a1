//! avlink-dispatch: reliable command dispatch and connection lifecycle.
//!
//! One tokio task per link owns the priority queues, the in-flight slot,
//! every timer, and the active channel. Callers talk to it through a
//! [`LinkHandle`].
//!
//! # Architecture
//!
//! - [`timer`] -- logical timers driven by the link loop's clock
//! - [`queue`] -- bounded FIFO queues with overflow policy, three tiers
//! - [`framer`] -- outbound framing and inbound message extraction
//! - [`dispatcher`] -- the ACK/retry/priority state machine
//! - [`coordinator`] -- binding precedence, keep-alive, reconnect
//! - [`io`] -- the link task, `spawn_link`, and `LinkHandle`
//! - [`builder`] -- fluent construction

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod framer;
pub mod io;
pub mod queue;
pub mod timer;

pub use builder::LinkBuilder;
pub use config::LinkConfig;
pub use coordinator::{Bindings, Coordinator, Inbound};
pub use dispatcher::{DispatchState, Dispatcher};
pub use framer::{Delimiter, Framer, Framing};
pub use io::{
    spawn_link, LinkHandle, LinkStatus, MessageHandler, MessageKind, NullHandler,
    PrefixAckHandler,
};
pub use queue::{CommandQueue, OverflowPolicy, PriorityQueues, PushOutcome};
pub use timer::{LogicalTimer, TimerSet};
