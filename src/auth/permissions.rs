//! Capability requirements for editing operations

use serde::{Deserialize, Serialize};
use std::fmt;

use super::capability::{
    KNOWLEDGE, KNOWLEDGE_KNUPDATE, KNOWLEDGE_KNUPDATE_KNDELETE, SETTINGS, SETTINGS_SETACCESSES,
    SETTINGS_SETMARKINGS,
};
use crate::schema::EntityType;

/// What an operation does to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Read, list, subscribe, announce presence
    Read,
    /// Create, patch fields, add or remove relations
    Edit,
    /// Hard delete
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Edit => write!(f, "edit"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Capabilities required for `action` on entities of `entity_type`.
///
/// Any one of the returned tokens is enough.
pub fn required_capabilities(entity_type: EntityType, action: Action) -> &'static [&'static str] {
    use EntityType::*;

    match (entity_type, action) {
        (t, Action::Read) if t.is_knowledge() => &[KNOWLEDGE],
        (_, Action::Read) => &[SETTINGS],

        (t, Action::Edit) if t.is_knowledge() => &[KNOWLEDGE_KNUPDATE],
        (t, Action::Delete) if t.is_knowledge() => &[KNOWLEDGE_KNUPDATE_KNDELETE],

        (User | Group | Role | Capability, _) => &[SETTINGS_SETACCESSES],
        (MarkingDefinition, _) => &[SETTINGS_SETMARKINGS],
        (_, _) => &[SETTINGS],
    }
}
