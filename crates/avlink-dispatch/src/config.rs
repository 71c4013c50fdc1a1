//! Runtime configuration for a link.
//!
//! Every value here can be changed on a running link through
//! [`LinkHandle::reconfigure`](crate::io::LinkHandle::reconfigure). New
//! intervals take effect the next time the corresponding timer is armed.

use std::time::Duration;

use avlink_core::{Error, NetworkMode, Result};
use bytes::Bytes;

use crate::framer::{Delimiter, Framing, DEFAULT_MAX_FRAME_LEN};
use crate::queue::{OverflowPolicy, DEFAULT_QUEUE_MAX_SIZE};

/// Configuration for the dispatch engine and connection coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Gap after each command before the next one goes out (no-ACK mode).
    pub command_delay: Duration,
    /// How long to wait for an acknowledgement before resending.
    pub ack_timeout: Duration,
    /// Resends after the first transmission before a command is discarded.
    pub max_retries: u32,
    /// Whether commands on bidirectional transports wait for an ACK.
    pub require_ack: bool,
    /// Period of the keep-alive poll on network transports.
    pub keep_alive_interval: Duration,
    /// Payload sent on every keep-alive period, if any.
    pub keep_alive_command: Option<Bytes>,
    /// Consecutive silent keep-alive periods before the link is dropped.
    pub missed_keep_alive_limit: u32,
    /// Fixed backoff between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Maximum entries per priority tier.
    pub queue_max_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// Prefix/suffix wrapped around stream payloads.
    pub framing: Framing,
    /// Inbound message delimiter.
    pub delimiter: Delimiter,
    /// Receive buffer cap.
    pub max_frame_len: usize,
    /// Whether the network binding connects out or listens.
    pub network_mode: NetworkMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            command_delay: Duration::from_millis(250),
            ack_timeout: Duration::from_secs(4),
            max_retries: 3,
            require_ack: false,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_command: None,
            missed_keep_alive_limit: 3,
            reconnect_interval: Duration::from_secs(5),
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            overflow_policy: OverflowPolicy::default(),
            framing: Framing::default(),
            delimiter: Delimiter::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            network_mode: NetworkMode::default(),
        }
    }
}

impl LinkConfig {
    /// Reject values that would leave a timer unable to fire or a queue
    /// unable to hold anything.
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout.is_zero() {
            return Err(Error::InvalidParameter("ack_timeout must be non-zero".into()));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "keep_alive_interval must be non-zero".into(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "reconnect_interval must be non-zero".into(),
            ));
        }
        if self.missed_keep_alive_limit == 0 {
            return Err(Error::InvalidParameter(
                "missed_keep_alive_limit must be at least 1".into(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(Error::InvalidParameter(
                "queue_max_size must be at least 1".into(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(Error::InvalidParameter(
                "max_frame_len must be at least 1".into(),
            ));
        }
        if matches!(&self.delimiter, Delimiter::Sequence(seq) if seq.is_empty()) {
            return Err(Error::InvalidParameter("delimiter must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.command_delay, Duration::from_millis(250));
        assert_eq!(config.ack_timeout, Duration::from_secs(4));
        assert_eq!(config.max_retries, 3);
        assert!(!config.require_ack);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.queue_max_size, 100);
        assert_eq!(config.missed_keep_alive_limit, 3);
        assert_eq!(config.overflow_policy, OverflowPolicy::ClearAndAccept);
        assert_eq!(config.framing.suffix.as_ref(), b"!\r\n");
        assert!(config.framing.prefix.is_empty());
        assert_eq!(config.network_mode, NetworkMode::Client);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_command_delay_is_allowed() {
        let config = LinkConfig {
            command_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_ack_timeout() {
        let config = LinkConfig {
            ack_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn rejects_zero_queue_size() {
        let config = LinkConfig {
            queue_max_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn rejects_empty_delimiter() {
        let config = LinkConfig {
            delimiter: Delimiter::Sequence(Bytes::new()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = LinkConfig {
            keep_alive_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LinkConfig {
            reconnect_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
