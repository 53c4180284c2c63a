//! Stored entities, relation edges and their wire projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::connection::Node;
use crate::presence::EditContextEntry;
use crate::schema::EntityType;

/// A typed intelligence object as held by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub stix_id_key: String,
    pub fields: BTreeMap<String, Value>,
    /// Per-field version, bumped on every effective change
    pub versions: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    /// Display name: `name`, or the first required field for types without one
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.name() {
            return Some(name.to_string());
        }
        self.entity_type
            .schema()
            .required_fields()
            .find_map(|f| self.fields.get(f.name))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    pub fn version(&self, field: &str) -> u64 {
        self.versions.get(field).copied().unwrap_or(0)
    }
}

/// Directed edge between two entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub from_role: String,
    pub to_role: String,
    pub through: String,
    pub created_at: DateTime<Utc>,
}

/// Minimal view of the entity at the other end of an edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NodeRef {
    pub fn of(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type,
            name: entity.display_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    pub id: String,
}

/// One projected edge: `{ node, relation: { id } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEdge {
    pub node: NodeRef,
    pub relation: RelationRef,
}

/// What clients see of an entity: fields, versions, relations and the
/// current edit context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityProjection {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(rename = "stix_id_key")]
    pub stix_id_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub versions: BTreeMap<String, u64>,
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<RelationEdge>>,
    #[serde(default)]
    pub edit_context: Vec<EditContextEntry>,
    #[serde(default)]
    pub context_revision: u64,
}

impl EntityProjection {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn version(&self, field: &str) -> u64 {
        self.versions.get(field).copied().unwrap_or(0)
    }

    /// Edges under a projection label, empty when none
    pub fn related(&self, label: &str) -> &[RelationEdge] {
        self.relations.get(label).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Node for EntityProjection {
    fn node_id(&self) -> &str {
        &self.id
    }
}
