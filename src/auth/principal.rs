//! Authenticated principal passed into every operation

use serde::{Deserialize, Serialize};

use super::capability::{is_granted, Capability, MatchMode, BYPASS};
use super::permissions::{required_capabilities, Action};
use crate::schema::EntityType;

/// Who is calling: identity plus the capabilities they hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Principal {
    pub fn new<I, C>(id: impl Into<String>, name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    /// Built-in administrator used by dev mode
    pub fn admin() -> Self {
        Self::new("admin", "admin", [BYPASS])
    }

    pub fn is_bypass(&self) -> bool {
        self.capabilities.iter().any(Capability::is_bypass)
    }

    /// Check a requirement set against the held capabilities
    pub fn can<R: AsRef<str>>(&self, required: &[R], match_all: bool, mode: MatchMode) -> bool {
        is_granted(&self.capabilities, required, match_all, mode)
    }

    /// Whether `action` is allowed on entities of `entity_type`
    pub fn may(&self, entity_type: EntityType, action: Action, mode: MatchMode) -> bool {
        self.can(required_capabilities(entity_type, action), false, mode)
    }

    /// Add capabilities not already held (e.g. ones reached through roles)
    pub fn extend_capabilities<I: IntoIterator<Item = String>>(&mut self, names: I) {
        for name in names {
            if !self.capabilities.iter().any(|c| c.name == name) {
                self.capabilities.push(Capability::new(name));
            }
        }
    }
}
