//! Authentication and authorization for Scriptorium
//!
//! Provides:
//! - Capability tokens and the `is_granted` predicate
//! - Per-entity-type operation requirements
//! - The `Principal` passed into every operation
//! - JWT bearer token generation and validation

pub mod capability;
pub mod jwt;
pub mod permissions;
pub mod principal;

pub use capability::{is_granted, Capability, MatchMode};
pub use jwt::{extract_token_from_header, extract_token_from_query, Claims, JwtValidator};
pub use permissions::{required_capabilities, Action};
pub use principal::Principal;
