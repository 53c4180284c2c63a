//! Collaborative presence
//!
//! Tracks who is looking at which entity and which field they are editing.
//! Presence is advisory: it never locks a field.

pub mod store;

pub use store::{
    EditContextEntry, PresenceConfig, PresenceState, PresenceStats, PresenceStore,
    DEFAULT_PRESENCE_TTL_SECS, DEFAULT_REAP_INTERVAL_SECS,
};
