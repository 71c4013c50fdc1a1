//! avlink-test-harness: mock channels for avlink.
//!
//! This crate provides [`MockChannel`] for deterministic testing of the
//! dispatch engine without real hardware, a [`MockRemote`] to inspect and
//! drive a channel from test code after it has been handed to the engine,
//! and [`MockFactory`] for exercising transport selection.

pub mod mock_channel;

pub use mock_channel::{MockChannel, MockFactory, MockRemote};
