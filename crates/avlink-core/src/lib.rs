//! avlink-core: Core traits, types, and error definitions for avlink.
//!
//! This crate defines the transport-agnostic abstractions shared by the
//! dispatch engine and the concrete channels. A device model talks to a
//! switcher through these types without caring whether the active link is a
//! serial cable, a TCP socket, an IR emitter, or an HTTP endpoint.
//!
//! # Key types
//!
//! - [`Channel`] -- one physical send path, selected by the coordinator
//! - [`ChannelFactory`] -- builds a channel for a [`ConnectionKind`]
//! - [`CommandEnvelope`] -- one queued outbound payload plus timing metadata
//! - [`LinkEvent`] -- connection state notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod channel;
pub mod error;
pub mod events;
pub mod types;

pub use channel::{Channel, ChannelEvent, ChannelFactory, EventSink, TaggedEvent};
pub use error::{Error, Result};
pub use events::LinkEvent;
pub use types::{BindingKind, CommandEnvelope, ConnectionKind, NetworkMode, Priority};
