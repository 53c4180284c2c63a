//! Entity storage and projections

pub mod entities;
pub mod entity;

pub use entities::{DeleteOutcome, EntityStore, EntityStoreStats, PatchOutcome, RelationOutcome};
pub use entity::{Entity, EntityProjection, NodeRef, Relation, RelationEdge, RelationRef};
