//! Edition sessions
//!
//! An open form on one entity. Opening subscribes (the server marks the
//! principal present), focusing announces the edited field, and each field is
//! validated locally, shown optimistically, then patched on the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::cache::LocalCache;
use super::transport::{Subscription, Transport};
use crate::auth::{Action, MatchMode, Principal};
use crate::events::EntityEvent;
use crate::presence::EditContextEntry;
use crate::protocol::OperationRequest;
use crate::schema::{normalize_values, validate_field, EntityType, ValidationError};
use crate::store::EntityProjection;
use crate::types::{Result, ScriptoriumError};

/// Why a field submission did not go through
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Refused locally; nothing was sent
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Transport(ScriptoriumError),

    /// The session was closed before the response arrived
    #[error("The edition session is closed")]
    ViewClosed,
}

/// Outcome of an accepted field patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReceipt {
    pub field: String,
    /// Local sequence number of this submission
    pub sequence: u64,
    /// Server version of the field after the patch
    pub version: u64,
    /// The response was older than what the cache already held
    pub stale: bool,
}

pub struct EditionSession {
    transport: Arc<dyn Transport>,
    cache: LocalCache,
    principal: Principal,
    match_mode: MatchMode,
    entity_id: String,
    entity_type: EntityType,
    subscription: Mutex<Option<Subscription>>,
    sequence: AtomicU64,
    closed: AtomicBool,
    closing: Notify,
}

impl EditionSession {
    /// Subscribe to the entity, then load it into the cache
    pub async fn open(
        transport: Arc<dyn Transport>,
        cache: LocalCache,
        principal: Principal,
        match_mode: MatchMode,
        id: &str,
    ) -> Result<Self> {
        let subscription = transport.subscribe(id).await?;

        let data = match transport.execute(OperationRequest::entity(id)).await {
            Ok(data) => data,
            Err(e) => {
                subscription.dispose().await;
                return Err(e);
            }
        };
        if data.is_null() {
            subscription.dispose().await;
            return Err(ScriptoriumError::NotFound(format!("Entity {} not found", id)));
        }

        let projection: EntityProjection = serde_json::from_value(data)
            .map_err(|e| ScriptoriumError::Internal(format!("Invalid entity payload: {}", e)))?;
        cache.merge(&projection);
        debug!("{} opened {} ({})", principal.name, projection.id, projection.entity_type);

        Ok(Self {
            transport,
            cache,
            principal,
            match_mode,
            entity_id: projection.id,
            entity_type: projection.entity_type,
            subscription: Mutex::new(Some(subscription)),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.entity_id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cached projection with pending values shown
    pub fn current(&self) -> Option<EntityProjection> {
        self.cache.get(&self.entity_id)
    }

    /// Whether the principal may edit this entity at all
    pub fn can_edit(&self) -> bool {
        self.principal
            .may(self.entity_type, Action::Edit, self.match_mode)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ScriptoriumError::BadRequest(
                "The edition session is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Announce the field being edited; an empty name clears the focus
    pub async fn focus(&self, field: &str) -> Result<()> {
        self.ensure_open()?;
        let data = self
            .transport
            .execute(OperationRequest::context_patch(&self.entity_id, field))
            .await?;
        if !self.is_closed() {
            self.merge_payload(data)?;
        }
        Ok(())
    }

    /// Validate, show optimistically, then patch one field
    pub async fn submit_field(
        &self,
        field: &str,
        values: Vec<Value>,
    ) -> std::result::Result<PatchReceipt, SubmitError> {
        if self.is_closed() {
            return Err(SubmitError::ViewClosed);
        }
        validate_field(self.entity_type, field, &values)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(spec) = self.entity_type.schema().field(field) {
            self.cache
                .set_optimistic(&self.entity_id, field, seq, normalize_values(spec, &values));
        }

        let result = self
            .transport
            .execute(OperationRequest::field_patch(&self.entity_id, field, values))
            .await;

        if self.is_closed() {
            self.cache.clear_optimistic(&self.entity_id, field, seq);
            return Err(SubmitError::ViewClosed);
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                warn!("Patch of {}.{} failed: {}", self.entity_id, field, e);
                self.cache.clear_optimistic(&self.entity_id, field, seq);
                return Err(SubmitError::Transport(e));
            }
        };

        let projection: EntityProjection = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                self.cache.clear_optimistic(&self.entity_id, field, seq);
                return Err(SubmitError::Transport(ScriptoriumError::Internal(format!(
                    "Invalid patch payload: {}",
                    e
                ))));
            }
        };

        let report = self.cache.merge(&projection);
        self.cache.clear_optimistic(&self.entity_id, field, seq);
        if report.is_stale(field) {
            debug!("Discarded stale response for {}.{}", self.entity_id, field);
        }

        Ok(PatchReceipt {
            field: field.to_string(),
            sequence: seq,
            version: projection.version(field),
            stale: report.is_stale(field),
        })
    }

    /// Apply every push already delivered; returns how many were applied
    pub async fn pump(&self) -> usize {
        let mut guard = self.subscription.lock().await;
        let Some(subscription) = guard.as_mut() else {
            return 0;
        };

        let mut applied = 0;
        while let Some(event) = subscription.try_next() {
            if self.is_closed() {
                break;
            }
            self.apply(&event);
            applied += 1;
        }
        applied
    }

    /// Wait for the next push and apply it; `None` once closed or ended
    pub async fn next_event(&self) -> Option<EntityEvent> {
        let closing = self.closing.notified();
        if self.is_closed() {
            return None;
        }

        let mut guard = self.subscription.lock().await;
        let subscription = guard.as_mut()?;
        let event = tokio::select! {
            event = subscription.next() => event?,
            _ = closing => return None,
        };
        if self.is_closed() {
            return None;
        }
        self.apply(&event);
        Some(event)
    }

    fn apply(&self, event: &EntityEvent) {
        match event {
            EntityEvent::Updated { entity } => {
                self.cache.merge(entity);
            }
            EntityEvent::Deleted { id } => {
                self.cache.evict(id);
            }
        }
    }

    fn merge_payload(&self, data: Value) -> Result<()> {
        let projection: EntityProjection = serde_json::from_value(data)
            .map_err(|e| ScriptoriumError::Internal(format!("Invalid entity payload: {}", e)))?;
        self.cache.merge(&projection);
        Ok(())
    }

    /// Other principals present on the entity
    pub fn avatars(&self) -> Vec<EditContextEntry> {
        let (entries, _) = self.cache.edit_context(&self.entity_id);
        entries
            .into_iter()
            .filter(|e| e.name != self.principal.name)
            .collect()
    }

    /// Names of the other principals focused on `field`, if any
    pub fn focus_hint(&self, field: &str) -> Option<String> {
        let names: Vec<String> = self
            .avatars()
            .into_iter()
            .filter(|e| e.focus_on == field)
            .map(|e| e.name)
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(", "))
        }
    }

    /// Clear the focus, then end the subscription. Later results and pushes
    /// are not merged through this session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.notify_waiters();

        if let Err(e) = self
            .transport
            .execute(OperationRequest::context_patch(&self.entity_id, ""))
            .await
        {
            debug!("Clearing focus on {} failed: {}", self.entity_id, e);
        }

        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.dispose().await;
        }
        debug!("{} closed {}", self.principal.name, self.entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalTransport;
    use crate::protocol::EntityAddInput;
    use crate::services::EditingService;
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (Arc<EditingService>, EntityProjection) {
        let service = Arc::new(EditingService::default());
        let created = service
            .create(
                &Principal::admin(),
                EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
            )
            .await
            .unwrap();
        (service, created)
    }

    fn jane() -> Principal {
        Principal::new("u-jane", "jane", ["KNOWLEDGE_KNUPDATE"])
    }

    async fn open(service: &Arc<EditingService>, principal: Principal, id: &str) -> EditionSession {
        let transport = Arc::new(LocalTransport::new(Arc::clone(service), principal.clone()));
        EditionSession::open(transport, LocalCache::new(), principal, MatchMode::Segment, id)
            .await
            .unwrap()
    }

    /// Apply pushes until `done` holds
    async fn settle<F: Fn(&EditionSession) -> bool>(session: &EditionSession, done: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done(session) {
                if session.next_event().await.is_none() {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_entity() {
        let (service, _) = setup().await;
        let transport = Arc::new(LocalTransport::new(Arc::clone(&service), jane()));
        let result = EditionSession::open(
            transport,
            LocalCache::new(),
            jane(),
            MatchMode::Segment,
            "campaign--missing",
        )
        .await;
        assert!(matches!(result, Err(ScriptoriumError::NotFound(_))));
        assert_eq!(service.presence().stats().entries, 0);
    }

    #[tokio::test]
    async fn test_submit_updates_cache() {
        let (service, created) = setup().await;
        let session = open(&service, jane(), &created.id).await;
        assert!(session.can_edit());

        let receipt = session
            .submit_field("name", vec![json!("Campaign - test")])
            .await
            .unwrap();
        assert_eq!(receipt.version, 2);
        assert!(!receipt.stale);
        assert_eq!(
            session.current().unwrap().field_str("name"),
            Some("Campaign - test")
        );

        session.close().await;
        assert!(matches!(
            session.submit_field("name", vec![json!("late")]).await,
            Err(SubmitError::ViewClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_value_is_not_sent() {
        let (service, created) = setup().await;
        let session = open(&service, jane(), &created.id).await;

        let result = session.submit_field("name", vec![json!("   ")]).await;
        assert!(matches!(result, Err(SubmitError::Validation(_))));
        assert_eq!(service.store().get(&created.id).unwrap().version("name"), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_forbidden_patch_rolls_back() {
        let (service, created) = setup().await;
        let reader = Principal::new("u-reader", "reader", ["KNOWLEDGE"]);
        let session = open(&service, reader, &created.id).await;
        assert!(!session.can_edit());

        let result = session.submit_field("name", vec![json!("Renamed")]).await;
        assert!(matches!(
            result,
            Err(SubmitError::Transport(ScriptoriumError::Forbidden(_)))
        ));
        assert_eq!(session.current().unwrap().field_str("name"), Some("Campaign"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_avatars_and_focus_hint() {
        let (service, created) = setup().await;
        let mine = open(&service, jane(), &created.id).await;
        let omar = Principal::new("u-omar", "omar", ["KNOWLEDGE_KNUPDATE"]);
        let theirs = open(&service, omar, &created.id).await;

        theirs.focus("description").await.unwrap();
        settle(&mine, |s| s.focus_hint("description").is_some()).await;

        let avatars = mine.avatars();
        assert_eq!(avatars.len(), 1);
        assert_eq!(avatars[0].name, "omar");
        assert_eq!(mine.focus_hint("description").as_deref(), Some("omar"));
        assert_eq!(mine.focus_hint("name"), None);

        theirs.close().await;
        settle(&mine, |s| s.avatars().is_empty()).await;
        assert!(mine.avatars().is_empty());
        mine.close().await;
    }
}
