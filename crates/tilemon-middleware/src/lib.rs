//! `tilemon-middleware` – Station Event Bus
//!
//! Carries change notifications, communication faults and command
//! lifecycle events from the engine to whoever listens, without caring
//! about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on
//!   Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
