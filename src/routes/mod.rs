//! HTTP routes for Scriptorium

pub mod health;
pub mod operations;

pub use health::health_check;
pub use operations::handle_operation;
