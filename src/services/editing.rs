//! Collaborative editing service
//!
//! Every operation takes the calling principal explicitly, checks its
//! capabilities, applies the change to the store and broadcasts the new
//! projection to the entity's subscribers. Presence changes are broadcast
//! the same way, so a projection always carries the current edit context.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::capability::KNOWLEDGE_KNGETEXPORT;
use crate::auth::{Action, MatchMode, Principal};
use crate::config::Args;
use crate::connection::Connection;
use crate::connectors::{ConnectorRecord, ConnectorRegistry, ExportFormat};
use crate::events::{EntityEvent, EventHub, DEFAULT_CHANNEL_CAPACITY};
use crate::logging::{AuditLogger, EditEventType};
use crate::presence::{PresenceConfig, PresenceStats, PresenceStore};
use crate::protocol::{
    ContextPatchVariables, DeletePayload, EditInput, EntitiesVariables, EntityAddInput,
    EntityAddVariables, EntityVariables, FieldPatchVariables, IdVariables, ListArgs,
    OperationName, OperationRequest, RelationAddInput, RelationAddPayload, RelationAddVariables,
    RelationDeleteVariables, RelationRemoveByNameVariables,
};
use crate::schema::EntityType;
use crate::store::{Entity, EntityProjection, EntityStore, EntityStoreStats, NodeRef};
use crate::types::{Result, ScriptoriumError};

const DEFAULT_PAGE_SIZE: usize = 25;

/// Settings of the editing service
#[derive(Debug, Clone)]
pub struct EditingConfig {
    pub node_id: String,
    pub presence: PresenceConfig,
    pub channel_capacity: usize,
    pub match_mode: MatchMode,
    pub default_page_size: usize,
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            node_id: "scriptorium-0".to_string(),
            presence: PresenceConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            match_mode: MatchMode::default(),
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EditingConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            node_id: args.node_id.clone(),
            presence: args.presence_config(),
            channel_capacity: args.broadcast_capacity,
            match_mode: args.capability_match,
            default_page_size: args.default_page_size,
        }
    }
}

/// Counts reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EditingStats {
    pub store: EntityStoreStats,
    pub presence: PresenceStats,
    pub channels: usize,
}

pub struct EditingService {
    store: EntityStore,
    presence: PresenceStore,
    hub: EventHub,
    connectors: ConnectorRegistry,
    audit: AuditLogger,
    match_mode: MatchMode,
    default_page_size: usize,
}

impl EditingService {
    pub fn new(config: EditingConfig) -> Self {
        Self {
            store: EntityStore::new(),
            presence: PresenceStore::new(config.presence),
            hub: EventHub::new(config.channel_capacity),
            connectors: ConnectorRegistry::empty(),
            audit: AuditLogger::new(config.node_id),
            match_mode: config.match_mode,
            default_page_size: config.default_page_size,
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
    }

    pub fn stats(&self) -> EditingStats {
        EditingStats {
            store: self.store.stats(),
            presence: self.presence.stats(),
            channels: self.hub.channel_count(),
        }
    }

    // ========================================================================
    // Principal
    // ========================================================================

    /// The principal plus capabilities granted through its stored roles
    pub fn effective_principal(&self, principal: &Principal) -> Principal {
        let mut effective = principal.clone();
        let is_user = self
            .store
            .get(&principal.id)
            .is_some_and(|e| e.entity_type == EntityType::User);
        if is_user {
            effective.extend_capabilities(self.store.resolve_capabilities(&principal.id));
        }
        effective
    }

    pub fn me(&self, principal: &Principal) -> Principal {
        self.effective_principal(principal)
    }

    async fn authorize(
        &self,
        principal: &Principal,
        entity_type: EntityType,
        action: Action,
        operation: &str,
    ) -> Result<()> {
        if principal.may(entity_type, action, self.match_mode) {
            return Ok(());
        }
        self.reject(principal, operation).await;
        Err(ScriptoriumError::Forbidden(format!(
            "{} may not {} {}",
            principal.name, action, entity_type
        )))
    }

    async fn reject(&self, principal: &Principal, operation: &str) {
        warn!("Refused {} for {}", operation, principal.name);
        self.audit
            .log(
                self.audit
                    .event(EditEventType::OperationRejected)
                    .with_principal(principal)
                    .with_operation(operation),
            )
            .await;
    }

    fn require(&self, id: &str) -> Result<Entity> {
        self.store
            .get(id)
            .ok_or_else(|| ScriptoriumError::NotFound(format!("Entity {} not found", id)))
    }

    /// Fields, relations and current edit context of an entity
    pub fn project(&self, entity: &Entity) -> EntityProjection {
        let (edit_context, context_revision) = self.presence.snapshot(&entity.id);
        EntityProjection {
            id: entity.id.clone(),
            entity_type: entity.entity_type,
            stix_id_key: entity.stix_id_key.clone(),
            created_at: entity.created_at,
            updated_at: entity.updated_at,
            fields: entity.fields.clone(),
            versions: entity.versions.clone(),
            relations: self.store.relations_of(&entity.id),
            edit_context,
            context_revision,
        }
    }

    /// Re-read and rebroadcast an entity; returns its projection
    fn broadcast(&self, entity_id: &str) -> Option<EntityProjection> {
        let entity = self.store.get(entity_id)?;
        let projection = self.project(&entity);
        let delivered = self.hub.publish(
            &entity.id,
            EntityEvent::Updated {
                entity: projection.clone(),
            },
        );
        debug!("Broadcast {} to {} subscribers", entity.id, delivered);
        Some(projection)
    }

    fn refreshed(&self, entity_id: &str) -> Result<EntityProjection> {
        let entity = self.require(entity_id)?;
        Ok(self.project(&entity))
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub async fn create(
        &self,
        principal: &Principal,
        input: EntityAddInput,
    ) -> Result<EntityProjection> {
        self.authorize(principal, input.entity_type, Action::Edit, "entityAdd")
            .await?;
        let entity = self.store.create(input)?;

        self.audit
            .log(
                self.audit
                    .event(EditEventType::EntityCreated)
                    .with_principal(principal)
                    .with_entity(&entity.id),
            )
            .await;
        Ok(self.project(&entity))
    }

    /// `None` when missing or of another type than `expected`
    pub async fn read(
        &self,
        principal: &Principal,
        id: &str,
        expected: Option<EntityType>,
    ) -> Result<Option<EntityProjection>> {
        let Some(entity) = self.store.get(id) else {
            return Ok(None);
        };
        if expected.is_some_and(|t| t != entity.entity_type) {
            return Ok(None);
        }
        self.authorize(principal, entity.entity_type, Action::Read, "entity")
            .await?;
        Ok(Some(self.project(&entity)))
    }

    pub async fn list(
        &self,
        principal: &Principal,
        entity_type: Option<EntityType>,
        args: &ListArgs,
    ) -> Result<Connection<EntityProjection>> {
        if let Some(t) = entity_type {
            self.authorize(principal, t, Action::Read, "entities").await?;
        }
        let mode = self.match_mode;
        let page = self.store.list_filtered(
            entity_type,
            args,
            self.default_page_size,
            |e| principal.may(e.entity_type, Action::Read, mode),
        )?;
        Ok(page.map(|e| self.project(&e)))
    }

    pub async fn field_patch(
        &self,
        principal: &Principal,
        id: &str,
        input: EditInput,
    ) -> Result<EntityProjection> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Edit, "fieldPatch")
            .await?;

        let outcome = self.store.patch_field(&entity.id, &input.key, &input.value)?;
        self.presence.touch(&entity.id, &principal.id);

        if !outcome.changed {
            return Ok(self.project(&outcome.entity));
        }

        self.audit
            .log(
                self.audit
                    .event(EditEventType::FieldPatched)
                    .with_principal(principal)
                    .with_entity(&entity.id)
                    .with_field(&input.key, outcome.version),
            )
            .await;

        Ok(self
            .broadcast(&entity.id)
            .unwrap_or_else(|| self.project(&outcome.entity)))
    }

    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<DeletePayload> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Delete, "delete")
            .await?;

        let outcome = self.store.delete(&entity.id)?;
        self.presence.remove_entity(&entity.id);
        self.hub.publish(
            &entity.id,
            EntityEvent::Deleted {
                id: entity.id.clone(),
            },
        );
        for affected in &outcome.affected {
            self.broadcast(affected);
        }

        self.audit
            .log(
                self.audit
                    .event(EditEventType::EntityDeleted)
                    .with_principal(principal)
                    .with_entity(&entity.id),
            )
            .await;
        Ok(DeletePayload { id: entity.id })
    }

    // ========================================================================
    // Relations
    // ========================================================================

    pub async fn relation_add(
        &self,
        principal: &Principal,
        id: &str,
        input: &RelationAddInput,
    ) -> Result<RelationAddPayload> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Edit, "relationAdd")
            .await?;

        let outcome = self.store.add_relation(&entity.id, input)?;
        let target = self.require(&outcome.relation.to_id)?;
        self.presence.touch(&entity.id, &principal.id);

        let from = if outcome.created {
            self.audit
                .log(
                    self.audit
                        .event(EditEventType::RelationAdded)
                        .with_principal(principal)
                        .with_entity(&entity.id)
                        .with_metadata(serde_json::json!({
                            "relation_id": outcome.relation.id,
                            "through": outcome.relation.through,
                            "to_id": outcome.relation.to_id,
                        })),
                )
                .await;
            self.broadcast(&entity.id)
        } else {
            None
        };

        Ok(RelationAddPayload {
            id: outcome.relation.id,
            from: match from {
                Some(projection) => projection,
                None => self.refreshed(&entity.id)?,
            },
            to: NodeRef::of(&target),
        })
    }

    pub async fn relation_delete(
        &self,
        principal: &Principal,
        id: &str,
        relation_id: &str,
    ) -> Result<EntityProjection> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Edit, "relationDelete")
            .await?;

        let relation = self.store.delete_relation(&entity.id, relation_id)?;
        self.presence.touch(&entity.id, &principal.id);
        self.audit
            .log(
                self.audit
                    .event(EditEventType::RelationDeleted)
                    .with_principal(principal)
                    .with_entity(&entity.id)
                    .with_metadata(serde_json::json!({
                        "relation_id": relation.id,
                        "through": relation.through,
                    })),
            )
            .await;

        match self.broadcast(&entity.id) {
            Some(projection) => Ok(projection),
            None => self.refreshed(&entity.id),
        }
    }

    pub async fn relation_remove_by_name(
        &self,
        principal: &Principal,
        id: &str,
        through: &str,
        name: &str,
    ) -> Result<EntityProjection> {
        let entity = self.require(id)?;
        self.authorize(
            principal,
            entity.entity_type,
            Action::Edit,
            "relationRemoveByName",
        )
        .await?;

        let removed = self.store.remove_relation_by_name(&entity.id, through, name)?;
        for relation in &removed {
            self.audit
                .log(
                    self.audit
                        .event(EditEventType::RelationDeleted)
                        .with_principal(principal)
                        .with_entity(&entity.id)
                        .with_metadata(serde_json::json!({
                            "relation_id": relation.id,
                            "through": relation.through,
                        })),
                )
                .await;
        }

        match self.broadcast(&entity.id) {
            Some(projection) => Ok(projection),
            None => self.refreshed(&entity.id),
        }
    }

    // ========================================================================
    // Presence
    // ========================================================================

    /// Set the caller's focused field (`""` clears focus but stays present)
    pub async fn context_patch(
        &self,
        principal: &Principal,
        id: &str,
        focus_on: &str,
    ) -> Result<EntityProjection> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Read, "contextPatch")
            .await?;

        if self.presence.focus(&entity.id, principal, focus_on) {
            if let Some(projection) = self.broadcast(&entity.id) {
                return Ok(projection);
            }
        }
        self.refreshed(&entity.id)
    }

    /// Drop the caller's edit context entry
    pub async fn context_clean(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<EntityProjection> {
        let entity = self.require(id)?;
        self.authorize(principal, entity.entity_type, Action::Read, "contextClean")
            .await?;

        if self.presence.clean(&entity.id, &principal.id) {
            if let Some(projection) = self.broadcast(&entity.id) {
                return Ok(projection);
            }
        }
        self.refreshed(&entity.id)
    }

    /// Open a live view: the principal becomes present and receives every
    /// later projection of the entity
    pub async fn subscribe(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<(broadcast::Receiver<EntityEvent>, EntityProjection)> {
        let principal = self.effective_principal(principal);
        let entity = self.require(id)?;
        self.authorize(&principal, entity.entity_type, Action::Read, "subscribe")
            .await?;

        let rx = self.hub.subscribe(&entity.id);
        let entered = self.presence.enter(&entity.id, &principal);
        if entered {
            self.audit
                .log(
                    self.audit
                        .event(EditEventType::PresenceEntered)
                        .with_principal(&principal)
                        .with_entity(&entity.id),
                )
                .await;
            self.broadcast(&entity.id);
        }

        Ok((rx, self.project(&entity)))
    }

    /// Close a live view opened with `subscribe`
    pub async fn unsubscribe(&self, principal: &Principal, id: &str) {
        let entity_id = self.store.resolve_id(id).unwrap_or_else(|| id.to_string());
        if !self.presence.leave(&entity_id, &principal.id) {
            return;
        }

        self.audit
            .log(
                self.audit
                    .event(EditEventType::PresenceLeft)
                    .with_principal(principal)
                    .with_entity(&entity_id),
            )
            .await;
        self.broadcast(&entity_id);
    }

    /// Subscription keep-alive
    pub fn keep_alive(&self, principal: &Principal, id: &str) {
        if let Some(entity_id) = self.store.resolve_id(id) {
            self.presence.touch(&entity_id, &principal.id);
        }
    }

    /// Remove stale presence entries, broadcast the affected entities and
    /// drop idle channels. Returns how many entities changed.
    pub async fn reap_presence(&self) -> usize {
        let changed = self.presence.reap();
        for entity_id in &changed {
            self.audit
                .log(
                    self.audit
                        .event(EditEventType::PresenceReaped)
                        .with_entity(entity_id),
                )
                .await;
            self.broadcast(entity_id);
        }
        self.hub.prune();
        changed.len()
    }

    // ========================================================================
    // Export registry
    // ========================================================================

    pub async fn connectors_for_export(
        &self,
        principal: &Principal,
    ) -> Result<Vec<ConnectorRecord>> {
        self.require_export(principal, "connectorsForExport").await?;
        Ok(self.connectors.records().to_vec())
    }

    pub async fn export_formats(&self, principal: &Principal) -> Result<Vec<ExportFormat>> {
        self.require_export(principal, "exportFormats").await?;
        Ok(self.connectors.export_formats())
    }

    async fn require_export(&self, principal: &Principal, operation: &str) -> Result<()> {
        if principal.can(&[KNOWLEDGE_KNGETEXPORT], false, self.match_mode) {
            return Ok(());
        }
        self.reject(principal, operation).await;
        Err(ScriptoriumError::Forbidden(format!(
            "{} may not list export connectors",
            principal.name
        )))
    }

    // ========================================================================
    // Envelope
    // ========================================================================

    /// Run one operation of the envelope and serialize its payload
    pub async fn dispatch(&self, principal: &Principal, request: &OperationRequest) -> Result<Value> {
        let principal = self.effective_principal(principal);
        let principal = &principal;
        debug!("{} by {}", request.operation, principal.name);

        match request.operation {
            OperationName::EntityAdd => {
                let vars: EntityAddVariables = request.variables()?;
                to_data(self.create(principal, vars.input).await?)
            }
            OperationName::Entity => {
                let vars: EntityVariables = request.variables()?;
                to_data(self.read(principal, &vars.id, vars.entity_type).await?)
            }
            OperationName::Entities => {
                let vars: EntitiesVariables = request.variables()?;
                to_data(self.list(principal, vars.entity_type, &vars.args).await?)
            }
            OperationName::FieldPatch => {
                let vars: FieldPatchVariables = request.variables()?;
                to_data(self.field_patch(principal, &vars.id, vars.input).await?)
            }
            OperationName::ContextPatch => {
                let vars: ContextPatchVariables = request.variables()?;
                let focus_on = vars.input.map(|i| i.focus_on).unwrap_or_default();
                to_data(self.context_patch(principal, &vars.id, &focus_on).await?)
            }
            OperationName::ContextClean => {
                let vars: IdVariables = request.variables()?;
                to_data(self.context_clean(principal, &vars.id).await?)
            }
            OperationName::RelationAdd => {
                let vars: RelationAddVariables = request.variables()?;
                to_data(self.relation_add(principal, &vars.id, &vars.input).await?)
            }
            OperationName::RelationDelete => {
                let vars: RelationDeleteVariables = request.variables()?;
                to_data(
                    self.relation_delete(principal, &vars.id, &vars.relation_id)
                        .await?,
                )
            }
            OperationName::RelationRemoveByName => {
                let vars: RelationRemoveByNameVariables = request.variables()?;
                to_data(
                    self.relation_remove_by_name(principal, &vars.id, &vars.through, &vars.name)
                        .await?,
                )
            }
            OperationName::Delete => {
                let vars: IdVariables = request.variables()?;
                to_data(self.delete(principal, &vars.id).await?)
            }
            OperationName::Me => to_data(self.me(principal)),
            OperationName::ConnectorsForExport => {
                to_data(self.connectors_for_export(principal).await?)
            }
            OperationName::ExportFormats => to_data(self.export_formats(principal).await?),
        }
    }
}

impl Default for EditingService {
    fn default() -> Self {
        Self::new(EditingConfig::default())
    }
}

fn to_data<T: Serialize>(payload: T) -> Result<Value> {
    serde_json::to_value(payload)
        .map_err(|e| ScriptoriumError::Internal(format!("Failed to encode payload: {}", e)))
}

/// Run the presence reaper every `interval`
pub fn spawn_reaper_task(
    service: Arc<EditingService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Presence reaper every {}s (ttl {}s)",
        interval.as_secs(),
        service.presence.config().ttl.as_secs()
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = service.reap_presence().await;
            if reaped > 0 {
                debug!("Presence reaper: {} entities changed", reaped);
            }
        }
    })
}
