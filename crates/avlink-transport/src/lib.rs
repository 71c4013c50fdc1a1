//! Channel implementations for avlink.
//!
//! This crate provides concrete implementations of the
//! [`Channel`](avlink_core::Channel) trait from `avlink-core` for each
//! physical path to a switcher:
//!
//! - [`SerialChannel`]: USB virtual COM ports and RS-232 connections
//! - [`TcpChannel`]: outbound TCP connection to the switcher's control port
//! - [`TcpServerChannel`]: listening socket the switcher (or a controller)
//!   connects into
//! - [`IrChannel`]: one-way infrared emission through an [`IrEmitter`]
//! - [`HttpChannel`]: HTTP GET requests against the switcher's web API
//!
//! [`TransportFactory`] builds the right one for a
//! [`ConnectionKind`](avlink_core::ConnectionKind) from [`TransportSettings`].
//!
//! # Example
//!
//! ```no_run
//! use avlink_core::{BindingKind, Priority};
//! use avlink_dispatch::LinkBuilder;
//! use avlink_transport::{TransportFactory, TransportSettings};
//!
//! # async fn example() -> avlink_core::Result<()> {
//! let settings = TransportSettings {
//!     serial_path: Some("/dev/ttyUSB0".into()),
//!     ..Default::default()
//! };
//! let link = LinkBuilder::new()
//!     .bind(BindingKind::Serial)
//!     .spawn(Box::new(TransportFactory::new(settings)))
//!     .await?;
//! link.send(Priority::Urgent, "OUT1 IN3").await?;
//! # Ok(())
//! # }
//! ```

pub mod factory;
pub mod http;
pub mod ir;
mod reader;
pub mod serial;
pub mod tcp;
pub mod tcp_server;

pub use factory::{TransportFactory, TransportSettings};
pub use http::HttpChannel;
pub use ir::{GatewayEmitter, IrChannel, IrEmitter};
pub use serial::{DataBits, FlowControl, Parity, SerialChannel, SerialConfig, StopBits};
pub use tcp::TcpChannel;
pub use tcp_server::TcpServerChannel;
