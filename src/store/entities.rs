//! Entity storage
//!
//! In-memory entities, natural-id index and relation edges. Every mutation
//! of one entity happens under the shard lock of its map entry, so two
//! patches to the same entity are applied one after the other.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use super::entity::{Entity, NodeRef, Relation, RelationEdge, RelationRef};
use crate::connection::Connection;
use crate::protocol::{EntityAddInput, ListArgs, ListFilter, OrderMode, RelationAddInput};
use crate::schema::validation::as_values;
use crate::schema::{
    normalize_values, relation_spec, validate_entity, validate_field, EntityType, ValidationError,
};
use crate::types::{Result, ScriptoriumError};

/// Result of a field patch
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub entity: Entity,
    /// False when the value was already stored (nothing bumped)
    pub changed: bool,
    pub version: u64,
}

/// Result of adding a relation
#[derive(Debug, Clone)]
pub struct RelationOutcome {
    pub relation: Relation,
    /// False when the same edge already existed
    pub created: bool,
}

/// Result of a hard delete
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub entity: Entity,
    /// Entities that lost an edge pointing at the deleted one
    pub affected: Vec<String>,
}

/// Entity store with concurrent access
pub struct EntityStore {
    /// Internal id -> entity
    entities: DashMap<String, Entity>,
    /// Natural id (`stix_id_key`) -> internal id
    natural_ids: DashMap<String, String>,
    /// Relation id -> edge
    relations: DashMap<String, Relation>,
    /// Entity id -> ids of edges starting there, in insertion order
    outgoing: DashMap<String, Vec<String>>,
    /// Entity id -> ids of edges ending there
    incoming: DashMap<String, Vec<String>>,
}

impl EntityStore {
    /// Create a new entity store
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            natural_ids: DashMap::new(),
            relations: DashMap::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
        }
    }

    /// Validate and store a new entity
    pub fn create(&self, input: EntityAddInput) -> Result<Entity> {
        let entity_type = input.entity_type;
        validate_entity(entity_type, &input.fields)?;

        let id = Uuid::new_v4().to_string();
        let stix_id_key = match input.stix_id_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => format!("{}--{}", entity_type.natural_id_prefix(), Uuid::new_v4()),
        };

        match self.natural_ids.entry(stix_id_key.clone()) {
            Entry::Occupied(_) => {
                return Err(ScriptoriumError::Conflict(format!(
                    "An entity with stix_id_key {} already exists",
                    stix_id_key
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let schema = entity_type.schema();
        let mut fields = BTreeMap::new();
        let mut versions = BTreeMap::new();
        for (key, value) in input.fields {
            let Some(spec) = schema.field(&key) else {
                continue;
            };
            let normalized = normalize_values(spec, &as_values(&value));
            if !is_unset(&normalized) {
                fields.insert(key.clone(), normalized);
            }
            versions.insert(key, 1);
        }

        let now = Utc::now();
        let entity = Entity {
            id: id.clone(),
            entity_type,
            stix_id_key,
            fields,
            versions,
            created_at: now,
            updated_at: now,
        };

        self.entities.insert(id, entity.clone());
        debug!("Created {} {}", entity.entity_type, entity.id);
        Ok(entity)
    }

    /// Internal id for an internal or natural id
    pub fn resolve_id(&self, id: &str) -> Option<String> {
        if self.entities.contains_key(id) {
            return Some(id.to_string());
        }
        self.natural_ids.get(id).map(|internal| internal.value().clone())
    }

    /// Look up by internal id first, then by natural id
    pub fn get(&self, id: &str) -> Option<Entity> {
        if let Some(entity) = self.entities.get(id) {
            return Some(entity.clone());
        }
        let internal = self.natural_ids.get(id).map(|r| r.value().clone())?;
        self.entities.get(&internal).map(|e| e.clone())
    }

    /// Filter, order and page entities
    pub fn list(
        &self,
        entity_type: Option<EntityType>,
        args: &ListArgs,
        default_first: usize,
    ) -> Result<Connection<Entity>> {
        self.list_filtered(entity_type, args, default_first, |_| true)
    }

    /// Like `list`, dropping entities `keep` refuses before paging so that
    /// `globalCount` only counts what the caller may see
    pub fn list_filtered<F: Fn(&Entity) -> bool>(
        &self,
        entity_type: Option<EntityType>,
        args: &ListArgs,
        default_first: usize,
        keep: F,
    ) -> Result<Connection<Entity>> {
        let search = args
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut items: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .filter(|e| search.as_deref().map_or(true, |s| matches_search(e, s)))
            .filter(|e| args.filters.iter().all(|f| matches_filter(e, f)))
            .filter(|e| keep(e.value()))
            .map(|e| e.clone())
            .collect();

        let order_by = args.order_by.as_deref().unwrap_or("name");
        items.sort_by(|a, b| {
            let ordering = compare_values(
                sort_value(a, order_by).as_ref(),
                sort_value(b, order_by).as_ref(),
            );
            let ordering = match args.order_mode {
                OrderMode::Asc => ordering,
                OrderMode::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.id.cmp(&b.id))
        });

        let first = args.first.unwrap_or(default_first);
        Connection::paginate(items, first, args.after.as_deref())
    }

    /// Apply one field patch. A value equal to the stored one is a no-op.
    pub fn patch_field(&self, id: &str, key: &str, values: &[Value]) -> Result<PatchOutcome> {
        let internal = self.require_id(id)?;
        let mut entity = self
            .entities
            .get_mut(&internal)
            .ok_or_else(|| not_found(id))?;

        let entity_type = entity.entity_type;
        let spec = entity_type
            .schema()
            .field(key)
            .ok_or_else(|| ValidationError::UnknownField {
                entity_type,
                field: key.to_string(),
            })?;
        validate_field(entity_type, key, values)?;

        let next = normalize_values(spec, values);
        let current = entity.fields.get(key).cloned().unwrap_or(Value::Null);
        if same_value(&current, &next) {
            return Ok(PatchOutcome {
                version: entity.version(key),
                entity: entity.clone(),
                changed: false,
            });
        }

        if is_unset(&next) {
            entity.fields.remove(key);
        } else {
            entity.fields.insert(key.to_string(), next);
        }
        let version = {
            let v = entity.versions.entry(key.to_string()).or_insert(0);
            *v += 1;
            *v
        };
        entity.updated_at = Utc::now();

        Ok(PatchOutcome {
            entity: entity.clone(),
            changed: true,
            version,
        })
    }

    /// Add an edge from `from_id`. Re-adding an existing edge returns it.
    pub fn add_relation(&self, from_id: &str, input: &RelationAddInput) -> Result<RelationOutcome> {
        let from = self.get(from_id).ok_or_else(|| not_found(from_id))?;
        let to = self.get(&input.to_id).ok_or_else(|| not_found(&input.to_id))?;

        let spec = relation_spec(&input.through).ok_or_else(|| {
            ScriptoriumError::BadRequest(format!("Unknown relation: {}", input.through))
        })?;
        if !spec.accepts(from.entity_type, to.entity_type) {
            return Err(ScriptoriumError::BadRequest(format!(
                "Relation {} cannot link {} to {}",
                input.through, from.entity_type, to.entity_type
            )));
        }

        let mut out = self.outgoing.entry(from.id.clone()).or_default();
        let existing = out.iter().find_map(|rid| {
            self.relations
                .get(rid)
                .filter(|r| r.to_id == to.id && r.through == input.through)
                .map(|r| r.clone())
        });
        if let Some(relation) = existing {
            return Ok(RelationOutcome {
                relation,
                created: false,
            });
        }

        let relation = Relation {
            id: Uuid::new_v4().to_string(),
            from_id: from.id.clone(),
            to_id: to.id.clone(),
            from_role: input.from_role.clone(),
            to_role: input.to_role.clone(),
            through: input.through.clone(),
            created_at: Utc::now(),
        };
        self.relations.insert(relation.id.clone(), relation.clone());
        out.push(relation.id.clone());
        drop(out);

        // A concurrent delete of either end must not leave the edge behind
        let mut incoming = self.incoming.entry(to.id.clone()).or_default();
        if !self.entities.contains_key(&to.id) || !self.entities.contains_key(&from.id) {
            drop(incoming);
            self.unlink(&relation.id);
            self.incoming.remove_if(&to.id, |_, ids| ids.is_empty());
            let gone = if self.entities.contains_key(&to.id) { &from.id } else { &to.id };
            return Err(not_found(gone));
        }
        incoming.push(relation.id.clone());
        drop(incoming);
        self.touch(&from.id, relation.created_at);

        Ok(RelationOutcome {
            relation,
            created: true,
        })
    }

    /// Remove an edge; it must start at `from_id`
    pub fn delete_relation(&self, from_id: &str, relation_id: &str) -> Result<Relation> {
        let from = self.require_id(from_id)?;
        let belongs = self
            .relations
            .get(relation_id)
            .is_some_and(|r| r.from_id == from);
        if !belongs {
            return Err(ScriptoriumError::NotFound(format!(
                "Relation {} not found on {}",
                relation_id, from_id
            )));
        }

        let relation = self.unlink(relation_id).ok_or_else(|| not_found(relation_id))?;
        self.touch(&from, Utc::now());
        Ok(relation)
    }

    /// Remove every `through` edge from `from_id` whose target is named `name`
    pub fn remove_relation_by_name(
        &self,
        from_id: &str,
        through: &str,
        name: &str,
    ) -> Result<Vec<Relation>> {
        let from = self.require_id(from_id)?;
        let matching: Vec<String> = self
            .outgoing_relations(&from)
            .into_iter()
            .filter(|r| r.through == through)
            .filter(|r| {
                self.entities
                    .get(&r.to_id)
                    .is_some_and(|e| e.display_name().as_deref() == Some(name))
            })
            .map(|r| r.id)
            .collect();

        if matching.is_empty() {
            return Err(ScriptoriumError::NotFound(format!(
                "No {} relation to '{}' on {}",
                through, name, from_id
            )));
        }

        let removed: Vec<Relation> = matching.iter().filter_map(|rid| self.unlink(rid)).collect();
        self.touch(&from, Utc::now());
        Ok(removed)
    }

    /// Hard delete an entity and every edge touching it
    pub fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let internal = self.require_id(id)?;
        let (_, entity) = self
            .entities
            .remove(&internal)
            .ok_or_else(|| not_found(id))?;
        self.natural_ids.remove(&entity.stix_id_key);

        let outgoing = self
            .outgoing
            .remove(&internal)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for rid in outgoing {
            self.unlink(&rid);
        }

        let incoming = self
            .incoming
            .remove(&internal)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        let mut affected = Vec::new();
        for rid in incoming {
            if let Some(relation) = self.unlink(&rid) {
                if !affected.contains(&relation.from_id) {
                    affected.push(relation.from_id);
                }
            }
        }

        let now = Utc::now();
        for from in &affected {
            self.touch(from, now);
        }

        debug!("Deleted {} {}", entity.entity_type, entity.id);
        Ok(DeleteOutcome { entity, affected })
    }

    /// Edges starting at `id`, in insertion order
    pub fn outgoing_relations(&self, id: &str) -> Vec<Relation> {
        let ids = self
            .outgoing
            .get(id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|rid| self.relations.get(rid).map(|r| r.clone()))
            .collect()
    }

    /// Projected relations of an entity, grouped by label
    pub fn relations_of(&self, id: &str) -> BTreeMap<String, Vec<RelationEdge>> {
        let mut grouped: BTreeMap<String, Vec<RelationEdge>> = BTreeMap::new();
        for relation in self.outgoing_relations(id) {
            let Some(target) = self.entities.get(&relation.to_id).map(|e| NodeRef::of(&e)) else {
                continue;
            };
            let label = relation_spec(&relation.through)
                .map(|spec| spec.label.to_string())
                .unwrap_or_else(|| relation.through.clone());
            grouped.entry(label).or_default().push(RelationEdge {
                node: target,
                relation: RelationRef { id: relation.id },
            });
        }
        grouped
    }

    /// Capability names reached through `user_role` then `role_capability`
    pub fn resolve_capabilities(&self, user_id: &str) -> Vec<String> {
        let Some(user) = self.resolve_id(user_id) else {
            return Vec::new();
        };

        let mut names: Vec<String> = self
            .outgoing_relations(&user)
            .into_iter()
            .filter(|r| r.through == "user_role")
            .flat_map(|role| self.outgoing_relations(&role.to_id))
            .filter(|r| r.through == "role_capability")
            .filter_map(|r| self.entities.get(&r.to_id).and_then(|c| c.display_name()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolve_id(id).is_some()
    }

    /// Get stats about the store
    pub fn stats(&self) -> EntityStoreStats {
        EntityStoreStats {
            entities: self.entities.len(),
            relations: self.relations.len(),
        }
    }

    fn require_id(&self, id: &str) -> Result<String> {
        self.resolve_id(id).ok_or_else(|| not_found(id))
    }

    /// Drop an edge from every index
    fn unlink(&self, relation_id: &str) -> Option<Relation> {
        let (_, relation) = self.relations.remove(relation_id)?;
        if let Some(mut ids) = self.outgoing.get_mut(&relation.from_id) {
            ids.retain(|rid| rid != relation_id);
        }
        if let Some(mut ids) = self.incoming.get_mut(&relation.to_id) {
            ids.retain(|rid| rid != relation_id);
        }
        Some(relation)
    }

    fn touch(&self, id: &str, at: DateTime<Utc>) {
        if let Some(mut entity) = self.entities.get_mut(id) {
            if at > entity.updated_at {
                entity.updated_at = at;
            }
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the entity store
#[derive(Debug, Clone, Serialize)]
pub struct EntityStoreStats {
    pub entities: usize,
    pub relations: usize,
}

fn not_found(id: &str) -> ScriptoriumError {
    ScriptoriumError::NotFound(format!("Entity {} not found", id))
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn same_value(current: &Value, next: &Value) -> bool {
    (is_unset(current) && is_unset(next)) || current == next
}

fn matches_search(entity: &Entity, needle: &str) -> bool {
    ["name", "description", "alias"].iter().any(|key| {
        entity.fields.get(*key).is_some_and(|value| {
            as_values(value).iter().any(|v| {
                v.as_str()
                    .is_some_and(|s| s.to_lowercase().contains(needle))
            })
        })
    })
}

fn matches_filter(entity: &Entity, filter: &ListFilter) -> bool {
    if filter.values.is_empty() {
        return true;
    }
    entity
        .fields
        .get(&filter.key)
        .is_some_and(|value| as_values(value).iter().any(|v| filter.values.contains(v)))
}

fn sort_value(entity: &Entity, key: &str) -> Option<Value> {
    match key {
        "created_at" => Some(Value::String(entity.created_at.to_rfc3339())),
        "updated_at" => Some(Value::String(entity.updated_at.to_rfc3339())),
        _ => entity.fields.get(key).cloned(),
    }
}

/// Missing values sort last; numbers numerically; strings case-insensitively
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
