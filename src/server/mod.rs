//! HTTP and WebSocket gateway

pub mod http;
pub mod websocket;

pub use http::{run, serve, AppState};
