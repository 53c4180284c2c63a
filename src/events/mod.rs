//! Entity change notifications

pub mod hub;

pub use hub::{EntityEvent, EventHub, DEFAULT_CHANNEL_CAPACITY};
