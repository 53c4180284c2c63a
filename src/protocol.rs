//! Operation envelope shared by the gateway and the client transports
//!
//! Request: `{ "operation": "fieldPatch", "variables": { ... } }`
//! Response: `{ "data": ..., "errors": [{ "message": ..., "code": ... }] }`

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::schema::EntityType;
use crate::store::{EntityProjection, NodeRef};
use crate::types::{Result, ScriptoriumError};

/// Every operation the gateway understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationName {
    EntityAdd,
    Entity,
    Entities,
    FieldPatch,
    ContextPatch,
    ContextClean,
    RelationAdd,
    RelationDelete,
    RelationRemoveByName,
    Delete,
    Me,
    ConnectorsForExport,
    ExportFormats,
}

impl OperationName {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationName::EntityAdd => "entityAdd",
            OperationName::Entity => "entity",
            OperationName::Entities => "entities",
            OperationName::FieldPatch => "fieldPatch",
            OperationName::ContextPatch => "contextPatch",
            OperationName::ContextClean => "contextClean",
            OperationName::RelationAdd => "relationAdd",
            OperationName::RelationDelete => "relationDelete",
            OperationName::RelationRemoveByName => "relationRemoveByName",
            OperationName::Delete => "delete",
            OperationName::Me => "me",
            OperationName::ConnectorsForExport => "connectorsForExport",
            OperationName::ExportFormats => "exportFormats",
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// `{ key, value: [..] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditInput {
    pub key: String,
    #[serde(default)]
    pub value: Vec<Value>,
}

/// `{ focusOn }`; an empty string means present without focus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditContextInput {
    #[serde(default)]
    pub focus_on: String,
}

/// `{ fromRole, toId, toRole, through }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationAddInput {
    pub from_role: String,
    pub to_id: String,
    pub to_role: String,
    pub through: String,
}

impl RelationAddInput {
    pub fn new(through: &str, to_id: impl Into<String>) -> Self {
        Self {
            from_role: "so".to_string(),
            to_id: to_id.into(),
            to_role: through.to_string(),
            through: through.to_string(),
        }
    }
}

/// Creation input: type, optional natural id, then the field values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAddInput {
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stix_id_key: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityAddInput {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            stix_id_key: None,
            fields: Map::new(),
        }
    }

    pub fn with_stix_id(mut self, stix_id_key: impl Into<String>) -> Self {
        self.stix_id_key = Some(stix_id_key.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    #[default]
    Asc,
    Desc,
}

/// Exact-match filter on a field; an entity matches if any value matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    pub key: String,
    pub values: Vec<Value>,
}

/// Arguments of the `entities` list query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_mode: OrderMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ListFilter>,
}

// ============================================================================
// Variables
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct EntityAddVariables {
    pub input: EntityAddInput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVariables {
    pub id: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesVariables {
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(flatten)]
    pub args: ListArgs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdVariables {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldPatchVariables {
    pub id: String,
    pub input: EditInput,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextPatchVariables {
    pub id: String,
    #[serde(default)]
    pub input: Option<EditContextInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationAddVariables {
    pub id: String,
    pub input: RelationAddInput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDeleteVariables {
    pub id: String,
    pub relation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationRemoveByNameVariables {
    pub id: String,
    pub through: String,
    pub name: String,
}

// ============================================================================
// Payloads
// ============================================================================

/// `relationAdd` result: the edge id, the refreshed `from` entity and the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationAddPayload {
    pub id: String,
    pub from: EntityProjection,
    pub to: NodeRef,
}

/// `delete` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub id: String,
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: OperationName,
    #[serde(default)]
    pub variables: Value,
}

impl OperationRequest {
    pub fn new(operation: OperationName, variables: Value) -> Self {
        Self {
            operation,
            variables,
        }
    }

    pub fn entity_add(input: &EntityAddInput) -> Self {
        Self::new(OperationName::EntityAdd, json!({ "input": input }))
    }

    pub fn entity(id: &str) -> Self {
        Self::new(OperationName::Entity, json!({ "id": id }))
    }

    pub fn entities(entity_type: Option<EntityType>, args: &ListArgs) -> Self {
        let mut variables = serde_json::to_value(args).unwrap_or_else(|_| json!({}));
        if let (Some(t), Some(map)) = (entity_type, variables.as_object_mut()) {
            map.insert("entityType".to_string(), json!(t));
        }
        Self::new(OperationName::Entities, variables)
    }

    pub fn field_patch(id: &str, key: &str, value: Vec<Value>) -> Self {
        Self::new(
            OperationName::FieldPatch,
            json!({ "id": id, "input": { "key": key, "value": value } }),
        )
    }

    pub fn context_patch(id: &str, focus_on: &str) -> Self {
        Self::new(
            OperationName::ContextPatch,
            json!({ "id": id, "input": { "focusOn": focus_on } }),
        )
    }

    pub fn context_clean(id: &str) -> Self {
        Self::new(OperationName::ContextClean, json!({ "id": id }))
    }

    pub fn relation_add(id: &str, input: &RelationAddInput) -> Self {
        Self::new(OperationName::RelationAdd, json!({ "id": id, "input": input }))
    }

    pub fn relation_delete(id: &str, relation_id: &str) -> Self {
        Self::new(
            OperationName::RelationDelete,
            json!({ "id": id, "relationId": relation_id }),
        )
    }

    pub fn relation_remove_by_name(id: &str, through: &str, name: &str) -> Self {
        Self::new(
            OperationName::RelationRemoveByName,
            json!({ "id": id, "through": through, "name": name }),
        )
    }

    pub fn delete(id: &str) -> Self {
        Self::new(OperationName::Delete, json!({ "id": id }))
    }

    pub fn me() -> Self {
        Self::new(OperationName::Me, Value::Null)
    }

    /// Decode the variable bag into the operation's argument struct
    pub fn variables<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.variables.clone()).map_err(|e| {
            ScriptoriumError::BadRequest(format!("Invalid variables for {}: {}", self.operation, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<OperationError>,
}

impl OperationResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn failure(err: &ScriptoriumError) -> Self {
        Self {
            data: None,
            errors: vec![OperationError {
                message: err.detail(),
                code: err.code().to_string(),
            }],
        }
    }

    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(&err),
        }
    }

    /// First error wins; a response without errors yields its data (or null)
    pub fn into_result(self) -> Result<Value> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ScriptoriumError::from_code(&err.code, err.message)),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}
