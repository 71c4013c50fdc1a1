//! # avlink -- Switcher Control Links
//!
//! `avlink` is the control layer between a device model for a multi-port
//! AV switcher and the wire. It keeps commands flowing in priority order,
//! resends them when the device does not acknowledge, polls idle network
//! connections, and reconnects when they drop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use avlink::{BindingKind, Priority};
//! use avlink::dispatch::{LinkBuilder, PrefixAckHandler};
//! use avlink::transport::{TransportFactory, TransportSettings};
//!
//! #[tokio::main]
//! async fn main() -> avlink::Result<()> {
//!     let settings = TransportSettings {
//!         tcp_addr: Some("192.168.1.50:23".into()),
//!         ..Default::default()
//!     };
//!     let link = LinkBuilder::new()
//!         .require_ack(true)
//!         .keep_alive_command("?")
//!         .handler(PrefixAckHandler::new("OK"))
//!         .bind(BindingKind::Network)
//!         .spawn(Box::new(TransportFactory::new(settings)))
//!         .await?;
//!
//!     link.send(Priority::Urgent, "OUT2 IN4").await?;
//!     link.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                              |
//! |-----------------------|------------------------------------------------------|
//! | `avlink-core`         | [`Channel`] trait, shared types, [`LinkEvent`], errors |
//! | `avlink-transport`    | Serial, TCP client, TCP server, IR, HTTP channels    |
//! | `avlink-dispatch`     | Queues, retry/ACK state machine, coordinator, link task |
//! | **`avlink`**          | This facade crate -- re-exports everything           |
//!
//! ## Transport Selection
//!
//! The host environment reports which endpoints are bound. When several are
//! present at once the link uses exactly one, in this order:
//!
//! 1. Network (server mode)
//! 2. Network (client mode)
//! 3. URL
//! 4. Serial
//! 5. IR
//!
//! Changing a binding clears every queue and tears down the old channel
//! before the new one connects.
//!
//! ## Event Subscription
//!
//! ```no_run
//! use avlink::LinkEvent;
//! # async fn example(link: &avlink::dispatch::LinkHandle) {
//! let mut events = link.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         LinkEvent::Offline { kind } => println!("{kind:?} down"),
//!         LinkEvent::Reconnecting { attempt } => println!("reconnect #{attempt}"),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```

pub use avlink_core::*;

/// Dispatch engine and link task.
///
/// Provides [`LinkBuilder`](dispatch::LinkBuilder),
/// [`LinkHandle`](dispatch::LinkHandle), and the building blocks the link
/// task is made of.
pub mod dispatch {
    pub use avlink_dispatch::*;
}

/// Concrete channels.
///
/// Provides [`TransportFactory`](transport::TransportFactory) and one
/// channel type per physical path.
pub mod transport {
    pub use avlink_transport::*;
}
