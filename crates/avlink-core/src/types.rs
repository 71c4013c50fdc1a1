//! Core types used throughout avlink.
//!
//! These types describe *what* is being sent and *which* physical path is
//! active, independent of how any particular channel reaches the device.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

/// Dispatch tier of a queued command.
///
/// Tiers are drained strictly in order: every [`Priority::Urgent`] command
/// goes out before any [`Priority::Elevated`] one, and those before
/// [`Priority::Normal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// P1: drained first.
    Urgent,
    /// P2: drained once P1 is empty.
    Elevated,
    /// Everything else.
    Normal,
}

impl Priority {
    /// All tiers in drain order.
    pub const ALL: [Priority; 3] = [Priority::Urgent, Priority::Elevated, Priority::Normal];

    /// Position of this tier in [`Priority::ALL`].
    pub fn index(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::Elevated => 1,
            Priority::Normal => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "P1",
            Priority::Elevated => "P2",
            Priority::Normal => "normal",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`Priority`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePriorityError(String);

impl fmt::Display for ParsePriorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown priority: {}", self.0)
    }
}

impl std::error::Error for ParsePriorityError {}

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p1" | "urgent" => Ok(Priority::Urgent),
            "p2" | "elevated" => Ok(Priority::Elevated),
            "normal" | "p3" => Ok(Priority::Normal),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// The physical path currently used to reach the device.
///
/// Variants are declared in precedence order: when several bindings are
/// present at once, the first matching variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// We listen; the device (or a controller) connects to us.
    NetworkServer,
    /// We connect out to the device over TCP.
    Network,
    /// Stateless HTTP requests against a base URL.
    Url,
    /// RS-232 / USB virtual COM port.
    Serial,
    /// One-way infrared emission.
    Ir,
    /// Nothing is bound.
    None,
}

impl ConnectionKind {
    /// Name of the control method, as reported by a channel.
    pub fn method_name(self) -> &'static str {
        match self {
            ConnectionKind::NetworkServer => "network-server",
            ConnectionKind::Network => "network",
            ConnectionKind::Url => "url",
            ConnectionKind::Serial => "serial",
            ConnectionKind::Ir => "ir",
            ConnectionKind::None => "none",
        }
    }

    /// Socket transports that need keep-alive polling and reconnects.
    pub fn is_stateful(self) -> bool {
        matches!(self, ConnectionKind::Network | ConnectionKind::NetworkServer)
    }

    /// Byte-stream transports whose payloads get wrapped in the outbound
    /// prefix/suffix and whose inbound bytes go through the framer.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            ConnectionKind::Network | ConnectionKind::NetworkServer | ConnectionKind::Serial
        )
    }

    /// Whether the device can answer on this path at all.
    pub fn is_bidirectional(self) -> bool {
        !matches!(self, ConnectionKind::Ir | ConnectionKind::None)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method_name())
    }
}

/// One of the four endpoint bindings the host environment reports.
///
/// Both [`ConnectionKind::Network`] and [`ConnectionKind::NetworkServer`]
/// hang off the single network binding; [`NetworkMode`] picks between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Network,
    Serial,
    Url,
    Ir,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingKind::Network => "network",
            BindingKind::Serial => "serial",
            BindingKind::Url => "url",
            BindingKind::Ir => "ir",
        };
        write!(f, "{s}")
    }
}

/// Direction of the network binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkMode {
    /// Connect out to the device.
    #[default]
    Client,
    /// Listen for an inbound connection.
    Server,
}

/// One queued outbound command.
///
/// The payload is opaque to the engine. Envelopes are immutable once built;
/// a retry resends the identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    payload: Bytes,
    delay: Option<Duration>,
    name: Option<String>,
}

impl CommandEnvelope {
    /// Wrap a raw payload with no delay override and no name.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        CommandEnvelope {
            payload: payload.into(),
            delay: None,
            name: None,
        }
    }

    /// Override the inter-command delay that follows this command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Attach a human-readable name used in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name if one was given, otherwise the payload rendered lossily.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_drain_order() {
        assert_eq!(
            Priority::ALL,
            [Priority::Urgent, Priority::Elevated, Priority::Normal]
        );
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        assert!(Priority::Urgent < Priority::Normal);
    }

    #[test]
    fn priority_from_str() {
        assert_eq!("p1".parse::<Priority>().unwrap(), Priority::Urgent);
        assert_eq!("Elevated".parse::<Priority>().unwrap(), Priority::Elevated);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("p9".parse::<Priority>().is_err());
    }

    #[test]
    fn connection_kind_capabilities() {
        assert!(ConnectionKind::Network.is_stateful());
        assert!(ConnectionKind::NetworkServer.is_stateful());
        assert!(!ConnectionKind::Serial.is_stateful());

        assert!(ConnectionKind::Serial.is_stream());
        assert!(!ConnectionKind::Url.is_stream());
        assert!(!ConnectionKind::Ir.is_stream());

        assert!(!ConnectionKind::Ir.is_bidirectional());
        assert!(ConnectionKind::Url.is_bidirectional());
    }

    #[test]
    fn connection_kind_display() {
        assert_eq!(ConnectionKind::NetworkServer.to_string(), "network-server");
        assert_eq!(ConnectionKind::None.to_string(), "none");
    }

    #[test]
    fn envelope_label_prefers_name() {
        let env = CommandEnvelope::new(&b"VOL 20"[..]).with_name("volume");
        assert_eq!(env.label(), "volume");

        let env = CommandEnvelope::new(&b"VOL 20"[..]);
        assert_eq!(env.label(), "VOL 20");
    }

    #[test]
    fn envelope_delay_override() {
        let env = CommandEnvelope::new(&b"PWR ON"[..]).with_delay(Duration::from_secs(2));
        assert_eq!(env.delay(), Some(Duration::from_secs(2)));
        assert_eq!(env.payload().as_ref(), b"PWR ON");
        assert!(env.name().is_none());
    }
}
