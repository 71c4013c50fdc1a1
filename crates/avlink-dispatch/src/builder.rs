//! LinkBuilder -- fluent builder for spawning a link.
//!
//! Separates configuration from construction so that callers can set up
//! pacing, retry policy, framing, and the initial bindings before the link
//! task starts.
//!
//! # Example
//!
//! ```no_run
//! use avlink_core::{BindingKind, ChannelFactory};
//! use avlink_dispatch::builder::LinkBuilder;
//! use std::time::Duration;
//!
//! # async fn example(factory: Box<dyn ChannelFactory>) -> avlink_core::Result<()> {
//! let link = LinkBuilder::new()
//!     .command_delay(Duration::from_millis(100))
//!     .require_ack(true)
//!     .bind(BindingKind::Serial)
//!     .spawn(factory)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use avlink_core::{BindingKind, ChannelFactory, NetworkMode, Result};
use bytes::Bytes;

use crate::config::LinkConfig;
use crate::framer::{Delimiter, Framing};
use crate::io::{spawn_link, LinkHandle, MessageHandler, NullHandler};
use crate::queue::OverflowPolicy;

/// Fluent builder for a [`LinkHandle`].
///
/// Every knob defaults to the [`LinkConfig`] default, so the simplest usage
/// is:
///
/// ```ignore
/// let link = LinkBuilder::new().bind(BindingKind::Serial).spawn(factory).await?;
/// ```
pub struct LinkBuilder {
    config: LinkConfig,
    handler: Option<Box<dyn MessageHandler>>,
    bindings: Vec<BindingKind>,
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkBuilder {
    pub fn new() -> Self {
        LinkBuilder {
            config: LinkConfig::default(),
            handler: None,
            bindings: Vec::new(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: LinkConfig) -> Self {
        LinkBuilder {
            config,
            ..Self::new()
        }
    }

    /// Gap between commands when no acknowledgement is expected (default: 250ms).
    pub fn command_delay(mut self, delay: Duration) -> Self {
        self.config.command_delay = delay;
        self
    }

    /// How long to wait for an acknowledgement (default: 4s).
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Resends before an unacknowledged command is discarded (default: 3).
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn require_ack(mut self, enabled: bool) -> Self {
        self.config.require_ack = enabled;
        self
    }

    /// Keep-alive period on network transports (default: 30s).
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Payload sent on each keep-alive period.
    pub fn keep_alive_command(mut self, command: impl Into<Bytes>) -> Self {
        self.config.keep_alive_command = Some(command.into());
        self
    }

    pub fn missed_keep_alive_limit(mut self, limit: u32) -> Self {
        self.config.missed_keep_alive_limit = limit;
        self
    }

    /// Fixed backoff between reconnect attempts (default: 5s).
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    pub fn queue_max_size(mut self, size: usize) -> Self {
        self.config.queue_max_size = size;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    /// Prefix and suffix wrapped around outbound stream payloads.
    pub fn framing(mut self, framing: Framing) -> Self {
        self.config.framing = framing;
        self
    }

    pub fn delimiter(mut self, delimiter: Delimiter) -> Self {
        self.config.delimiter = delimiter;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    /// Whether the network binding connects out or listens (default: client).
    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.config.network_mode = mode;
        self
    }

    /// Set the inbound message handler (default: [`NullHandler`]).
    pub fn handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Report a binding as present as soon as the link starts.
    pub fn bind(mut self, binding: BindingKind) -> Self {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Validate and return the configuration.
    pub fn build_config(&self) -> Result<LinkConfig> {
        self.config.validate()?;
        Ok(self.config.clone())
    }

    /// Spawn the link task and report the initial bindings.
    pub async fn spawn(self, factory: Box<dyn ChannelFactory>) -> Result<LinkHandle> {
        let config = self.build_config()?;
        let handler = self.handler.unwrap_or_else(|| Box::new(NullHandler));
        let link = spawn_link(factory, config, handler)?;
        for binding in self.bindings {
            link.binding_changed(binding, true).await?;
        }
        Ok(link)
    }
}
