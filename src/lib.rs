//! Scriptorium - collaborative edition gateway for CTI knowledge entities
//!
//! Several analysts edit the same threat-intelligence entity at once. The
//! gateway shows who is present and which field each one is editing, and
//! applies capability-checked, validated single-field patches that every
//! open view receives.
//!
//! ## Parts
//!
//! - **Auth**: capability matching, per-type requirements, JWT principals
//! - **Schema**: entity types, field rules and relation kinds
//! - **Store**: in-memory entities and relation edges with per-field versions
//! - **Presence**: who is on which entity, focused on which field
//! - **Services**: the editing service every operation goes through
//! - **Server**: operation envelope over HTTP, subscriptions over WebSocket
//! - **Client**: transports, local cache, edition sessions and list views

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod connectors;
pub mod events;
pub mod logging;
pub mod presence;
pub mod protocol;
pub mod routes;
pub mod schema;
pub mod server;
pub mod services;
pub mod store;
pub mod types;
pub mod view_params;

pub use config::Args;
pub use server::{run, serve, AppState};
pub use types::{Result, ScriptoriumError};
