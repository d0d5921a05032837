//! Event bus for engine lifecycle notifications.
//!
//! Provides an `EventBus` that distributes `BatchEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
