//! Audit logging

pub mod audit;

pub use audit::{AuditEvent, AuditLogger, EditEventType};
