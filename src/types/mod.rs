//! Shared types for Scriptorium

pub mod error;

pub use error::{Result, ScriptoriumError};
