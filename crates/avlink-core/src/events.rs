//! Link event types.
//!
//! Events are emitted by the link task through a [`tokio::sync::broadcast`]
//! channel whenever the active transport or its liveness changes. They are
//! delivered best-effort; a slow subscriber may miss some.

use crate::types::ConnectionKind;

/// A connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The active transport changed after a binding was added or removed.
    TransportChanged {
        from: ConnectionKind,
        to: ConnectionKind,
    },

    /// The active channel can carry traffic.
    Online { kind: ConnectionKind },

    /// The active channel went down.
    Offline { kind: ConnectionKind },

    /// A reconnect attempt is starting.
    Reconnecting {
        /// The attempt number since the link last went down (1-based).
        attempt: u32,
    },

    /// A keep-alive period passed without any inbound traffic.
    KeepAliveMissed { missed: u32 },
}
