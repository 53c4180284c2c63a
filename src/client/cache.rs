//! Client-side entity cache
//!
//! Projections are merged per field by version, so an older write never
//! replaces a newer one whatever order the responses and pushes arrive in.
//! Optimistic values sit in an overlay on top of the merged state until the
//! patch that produced them settles.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::presence::EditContextEntry;
use crate::store::EntityProjection;

#[derive(Debug, Clone)]
struct Overlay {
    seq: u64,
    value: Value,
}

#[derive(Debug, Clone)]
struct CachedEntity {
    projection: EntityProjection,
    overlays: BTreeMap<String, Overlay>,
}

/// What a merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// The entity was not cached before
    pub inserted: bool,
    pub applied: Vec<String>,
    /// Fields whose incoming version was older than the cached one
    pub stale: Vec<String>,
    pub context_applied: bool,
}

impl MergeReport {
    pub fn is_stale(&self, field: &str) -> bool {
        self.stale.iter().any(|f| f == field)
    }
}

#[derive(Default)]
struct CacheInner {
    entities: DashMap<String, CachedEntity>,
    connections: DashMap<String, Connection<EntityProjection>>,
}

/// Shared cache of projections and list connections
#[derive(Clone, Default)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming projection into the cached one
    pub fn merge(&self, incoming: &EntityProjection) -> MergeReport {
        let mut report = MergeReport::default();

        let merged = {
            let mut entry = self
                .inner
                .entities
                .entry(incoming.id.clone())
                .or_insert_with(|| {
                    report.inserted = true;
                    CachedEntity {
                        projection: incoming.clone(),
                        overlays: BTreeMap::new(),
                    }
                });

            if report.inserted {
                report.applied = incoming.fields.keys().cloned().collect();
                report.context_applied = true;
            } else {
                merge_into(&mut entry.projection, incoming, &mut report);
            }
            entry.projection.clone()
        };

        self.refresh_connections(&merged);
        report
    }

    /// Cached projection with optimistic values applied
    pub fn get(&self, id: &str) -> Option<EntityProjection> {
        self.inner.entities.get(id).map(|cached| {
            let mut projection = cached.projection.clone();
            for (field, overlay) in &cached.overlays {
                projection.fields.insert(field.clone(), overlay.value.clone());
            }
            projection
        })
    }

    /// Displayed value of a field: the optimistic one if pending
    pub fn value(&self, id: &str, field: &str) -> Option<Value> {
        let cached = self.inner.entities.get(id)?;
        cached
            .overlays
            .get(field)
            .map(|o| o.value.clone())
            .or_else(|| cached.projection.fields.get(field).cloned())
    }

    pub fn version(&self, id: &str, field: &str) -> u64 {
        self.inner
            .entities
            .get(id)
            .map(|cached| cached.projection.version(field))
            .unwrap_or(0)
    }

    pub fn edit_context(&self, id: &str) -> (Vec<EditContextEntry>, u64) {
        self.inner
            .entities
            .get(id)
            .map(|cached| {
                (
                    cached.projection.edit_context.clone(),
                    cached.projection.context_revision,
                )
            })
            .unwrap_or_default()
    }

    /// Show `value` for `field` until the patch numbered `seq` settles.
    /// Returns false if the entity is not cached.
    pub fn set_optimistic(&self, id: &str, field: &str, seq: u64, value: Value) -> bool {
        match self.inner.entities.get_mut(id) {
            Some(mut cached) => {
                cached
                    .overlays
                    .insert(field.to_string(), Overlay { seq, value });
                true
            }
            None => false,
        }
    }

    /// Drop the overlay of `field`, but only if it is still the one set by `seq`
    pub fn clear_optimistic(&self, id: &str, field: &str, seq: u64) -> bool {
        let Some(mut cached) = self.inner.entities.get_mut(id) else {
            return false;
        };
        if cached.overlays.get(field).is_some_and(|o| o.seq == seq) {
            cached.overlays.remove(field);
            return true;
        }
        false
    }

    /// Forget an entity, and drop it from every cached list
    pub fn evict(&self, id: &str) {
        self.inner.entities.remove(id);
        for mut connection in self.inner.connections.iter_mut() {
            let before = connection.edges.len();
            connection.edges.retain(|e| e.node.id != id);
            let removed = before - connection.edges.len();
            connection.page_info.global_count =
                connection.page_info.global_count.saturating_sub(removed);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entities.contains_key(id)
    }

    pub fn connection(&self, view: &str) -> Option<Connection<EntityProjection>> {
        self.inner.connections.get(view).map(|c| c.clone())
    }

    /// Replace the loaded list of a view (first page after a reload)
    pub fn put_connection(&self, view: &str, connection: Connection<EntityProjection>) {
        self.inner
            .connections
            .insert(view.to_string(), connection);
    }

    /// Append a further page to a view's list; returns how many edges were added
    pub fn merge_connection(&self, view: &str, page: Connection<EntityProjection>) -> usize {
        self.inner
            .connections
            .entry(view.to_string())
            .or_insert_with(Connection::empty)
            .merge_page(page)
    }

    fn refresh_connections(&self, projection: &EntityProjection) {
        for mut connection in self.inner.connections.iter_mut() {
            for edge in connection.edges.iter_mut() {
                if edge.node.id == projection.id {
                    edge.node = projection.clone();
                }
            }
        }
    }
}

fn merge_into(cached: &mut EntityProjection, incoming: &EntityProjection, report: &mut MergeReport) {
    let keys: Vec<String> = incoming
        .versions
        .keys()
        .chain(incoming.fields.keys())
        .cloned()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    for field in keys {
        let version = incoming.version(&field);
        if version < cached.version(&field) {
            report.stale.push(field);
            continue;
        }
        match incoming.fields.get(&field) {
            Some(value) => {
                cached.fields.insert(field.clone(), value.clone());
            }
            None => {
                cached.fields.remove(&field);
            }
        }
        cached.versions.insert(field.clone(), version);
        report.applied.push(field);
    }

    if incoming.updated_at >= cached.updated_at {
        cached.relations = incoming.relations.clone();
        cached.updated_at = incoming.updated_at;
    }

    if incoming.context_revision >= cached.context_revision {
        cached.edit_context = incoming.edit_context.clone();
        cached.context_revision = incoming.context_revision;
        report.context_applied = true;
    }
}
