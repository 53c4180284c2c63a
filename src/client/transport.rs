//! Client transports
//!
//! A transport runs envelope operations and opens entity subscriptions. The
//! in-process transport drives an `EditingService` directly; the HTTP one
//! lives in `client::http`.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth::Principal;
use crate::events::EntityEvent;
use crate::protocol::OperationRequest;
use crate::services::EditingService;
use crate::types::Result;

/// Push stream of one entity. Dropping it (or `dispose`) stops the
/// forwarding task, which ends the server-side subscription.
pub struct Subscription {
    entity_id: String,
    rx: mpsc::UnboundedReceiver<EntityEvent>,
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        entity_id: String,
        rx: mpsc::UnboundedReceiver<EntityEvent>,
        close: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            entity_id,
            rx,
            close: Some(close),
            task: Some(task),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Wait for the next push; `None` once the stream ended
    pub async fn next(&mut self) -> Option<EntityEvent> {
        self.rx.recv().await
    }

    /// Next already delivered push, without waiting
    pub fn try_next(&mut self) -> Option<EntityEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop forwarding and wait until the server side has been released
    pub async fn dispose(mut self) {
        self.close.take();
        self.rx.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Subscription task for {} ended abnormally: {}", self.entity_id, e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Dropping the sender wakes the forwarding task, which cleans up
        self.close.take();
    }
}

/// Something that can carry envelope operations and subscriptions
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: OperationRequest) -> Result<Value>;

    async fn subscribe(&self, entity_id: &str) -> Result<Subscription>;
}

/// Transport calling an in-process editing service as a fixed principal
#[derive(Clone)]
pub struct LocalTransport {
    service: Arc<EditingService>,
    principal: Principal,
}

impl LocalTransport {
    pub fn new(service: Arc<EditingService>, principal: Principal) -> Self {
        Self { service, principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn service(&self) -> &Arc<EditingService> {
        &self.service
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn execute(&self, request: OperationRequest) -> Result<Value> {
        self.service.dispatch(&self.principal, &request).await
    }

    async fn subscribe(&self, entity_id: &str) -> Result<Subscription> {
        let (mut events, initial) = self.service.subscribe(&self.principal, entity_id).await?;
        let entity_id = initial.id.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let _ = tx.send(EntityEvent::Updated { entity: initial });

        let service = Arc::clone(&self.service);
        let principal = self.principal.clone();
        let id = entity_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    msg = events.recv() => match msg {
                        Ok(event) => {
                            let deleted = matches!(event, EntityEvent::Deleted { .. });
                            if tx.send(event).is_err() || deleted {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let Some(entity) = service.store().get(&id) else {
                                break;
                            };
                            let current = EntityEvent::Updated { entity: service.project(&entity) };
                            if tx.send(current).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            service.unsubscribe(&principal, &id).await;
        });

        Ok(Subscription::new(entity_id, rx, close_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntityAddInput;
    use crate::schema::EntityType;
    use crate::store::EntityProjection;

    #[tokio::test]
    async fn test_local_subscription_lifecycle() {
        let service = Arc::new(EditingService::default());
        let transport = LocalTransport::new(Arc::clone(&service), Principal::admin());

        let created = transport
            .execute(OperationRequest::entity_add(
                &EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
            ))
            .await
            .unwrap();
        let created: EntityProjection = serde_json::from_value(created).unwrap();

        let mut sub = transport.subscribe(&created.stix_id_key).await.unwrap();
        assert_eq!(sub.entity_id(), created.id);
        match sub.next().await.unwrap() {
            EntityEvent::Updated { entity } => assert_eq!(entity.edit_context.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.presence().stats().entries, 1);

        sub.dispose().await;
        assert_eq!(service.presence().stats().entries, 0);
    }
}
