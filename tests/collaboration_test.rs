//! Collaborative editing: presence, focus, idempotent and out-of-order patches

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use scriptorium::auth::{MatchMode, Principal};
use scriptorium::client::{
    EditionSession, LocalCache, LocalTransport, SubmitError, Subscription, Transport,
};
use scriptorium::events::EntityEvent;
use scriptorium::presence::{PresenceConfig, PresenceState};
use scriptorium::protocol::{EditInput, EntityAddInput, OperationName, OperationRequest};
use scriptorium::schema::EntityType;
use scriptorium::services::{EditingConfig, EditingService};
use scriptorium::store::EntityProjection;
use scriptorium::Result;

fn analyst(id: &str, name: &str) -> Principal {
    Principal::new(id, name, ["KNOWLEDGE_KNUPDATE"])
}

async fn service_with_campaign() -> (Arc<EditingService>, EntityProjection) {
    let service = Arc::new(EditingService::default());
    let campaign = service
        .create(
            &Principal::admin(),
            EntityAddInput::new(EntityType::Campaign)
                .with_field("name", "Campaign")
                .with_field("description", "Initial description"),
        )
        .await
        .unwrap();
    (service, campaign)
}

async fn open_session(
    transport: Arc<dyn Transport>,
    principal: Principal,
    id: &str,
) -> EditionSession {
    EditionSession::open(transport, LocalCache::new(), principal, MatchMode::Segment, id)
        .await
        .unwrap()
}

/// Counts field patches that reach the wire
struct CountingTransport {
    inner: LocalTransport,
    patches: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn execute(&self, request: OperationRequest) -> Result<Value> {
        if request.operation == OperationName::FieldPatch {
            self.patches.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.execute(request).await
    }

    async fn subscribe(&self, entity_id: &str) -> Result<Subscription> {
        self.inner.subscribe(entity_id).await
    }
}

/// Holds back the response of the patch writing `held_value` until released
struct ReorderingTransport {
    inner: LocalTransport,
    held_value: Value,
    release: Notify,
}

#[async_trait]
impl Transport for ReorderingTransport {
    async fn execute(&self, request: OperationRequest) -> Result<Value> {
        let held = request.operation == OperationName::FieldPatch
            && request.variables["input"]["value"][0] == self.held_value;
        let response = self.inner.execute(request).await;
        if held {
            self.release.notified().await;
        }
        response
    }

    async fn subscribe(&self, entity_id: &str) -> Result<Subscription> {
        self.inner.subscribe(entity_id).await
    }
}

#[tokio::test]
async fn test_same_patch_twice_is_idempotent() {
    let (service, campaign) = service_with_campaign().await;
    let jane = analyst("u-jane", "jane");
    let input = EditInput {
        key: "name".into(),
        value: vec![json!("Campaign - test")],
    };

    let once = service
        .field_patch(&jane, &campaign.id, input.clone())
        .await
        .unwrap();
    let twice = service.field_patch(&jane, &campaign.id, input).await.unwrap();

    assert_eq!(once.fields, twice.fields);
    assert_eq!(once.versions, twice.versions);
    assert_eq!(once.updated_at, twice.updated_at);
    assert_eq!(twice.version("name"), 2);
}

#[tokio::test]
async fn test_presence_through_a_session_lifecycle() {
    let (service, campaign) = service_with_campaign().await;
    let jane = analyst("u-jane", "jane");
    let transport = Arc::new(LocalTransport::new(Arc::clone(&service), jane.clone()));

    let session = open_session(transport, jane.clone(), &campaign.id).await;
    let (entries, _) = service.presence().snapshot(&campaign.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].focus_on, "");

    session.focus("name").await.unwrap();
    let (entries, _) = service.presence().snapshot(&campaign.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].focus_on, "name");
    assert_eq!(
        service.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Focused("name".into())
    );

    session.close().await;
    assert_eq!(
        service.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Absent
    );
    assert!(service.presence().snapshot(&campaign.id).0.is_empty());
}

#[tokio::test]
async fn test_validation_gate_counts_transport_calls() {
    let (service, campaign) = service_with_campaign().await;
    let jane = analyst("u-jane", "jane");
    let transport = Arc::new(CountingTransport {
        inner: LocalTransport::new(Arc::clone(&service), jane.clone()),
        patches: AtomicUsize::new(0),
    });

    let session = open_session(transport.clone(), jane, &campaign.id).await;

    let refused = session.submit_field("name", vec![json!("")]).await;
    assert!(matches!(refused, Err(SubmitError::Validation(_))));
    assert_eq!(transport.patches.load(Ordering::SeqCst), 0);

    let accepted = session
        .submit_field("name", vec![json!("Campaign - renamed")])
        .await
        .unwrap();
    assert_eq!(accepted.version, 2);
    assert_eq!(transport.patches.load(Ordering::SeqCst), 1);

    session.close().await;
}

#[tokio::test]
async fn test_late_response_does_not_overwrite_newer_value() {
    let (service, campaign) = service_with_campaign().await;
    let jane = analyst("u-jane", "jane");
    let transport = Arc::new(ReorderingTransport {
        inner: LocalTransport::new(Arc::clone(&service), jane.clone()),
        held_value: json!("first"),
        release: Notify::new(),
    });

    let session = open_session(transport.clone(), jane, &campaign.id).await;

    let first = session.submit_field("name", vec![json!("first")]);
    let second = async {
        let receipt = session.submit_field("name", vec![json!("second")]).await;
        transport.release.notify_one();
        receipt
    };
    let (first, second) = tokio::join!(first, second);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.version, 2);
    assert!(first.stale);
    assert_eq!(second.version, 3);
    assert!(!second.stale);

    let current = session.current().unwrap();
    assert_eq!(current.field_str("name"), Some("second"));
    assert_eq!(current.version("name"), 3);

    session.close().await;
}

#[tokio::test]
async fn test_other_views_receive_patches_and_focus() {
    let (service, campaign) = service_with_campaign().await;
    let jane = analyst("u-jane", "jane");
    let omar = analyst("u-omar", "omar");

    let jane_view = open_session(
        Arc::new(LocalTransport::new(Arc::clone(&service), jane.clone())),
        jane,
        &campaign.id,
    )
    .await;
    let omar_view = open_session(
        Arc::new(LocalTransport::new(Arc::clone(&service), omar.clone())),
        omar,
        &campaign.id,
    )
    .await;

    omar_view.focus("description").await.unwrap();
    omar_view
        .submit_field("description", vec![json!("Updated by omar")])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current = jane_view.current().unwrap();
            if current.field_str("description") == Some("Updated by omar")
                && jane_view.focus_hint("description").is_some()
            {
                break;
            }
            if jane_view.next_event().await.is_none() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(jane_view.focus_hint("description").as_deref(), Some("omar"));
    assert_eq!(jane_view.avatars().len(), 1);

    omar_view.close().await;
    jane_view.close().await;
    assert_eq!(service.presence().stats().entries, 0);
}

#[tokio::test]
async fn test_stale_presence_is_reaped_and_broadcast() {
    let config = EditingConfig {
        presence: PresenceConfig {
            ttl: Duration::from_millis(50),
            reap_interval: Duration::from_millis(10),
        },
        ..Default::default()
    };
    let service = Arc::new(EditingService::new(config));
    let campaign = service
        .create(
            &Principal::admin(),
            EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
        )
        .await
        .unwrap();

    let jane = analyst("u-jane", "jane");
    service
        .context_patch(&jane, &campaign.id, "name")
        .await
        .unwrap();
    let mut watcher = service.hub().subscribe(&campaign.id);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(service.reap_presence().await, 1);
    assert_eq!(
        service.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Absent
    );

    match watcher.recv().await.unwrap() {
        EntityEvent::Updated { entity } => assert!(entity.edit_context.is_empty()),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_open_session_outlives_presence_ttl() {
    let config = EditingConfig {
        presence: PresenceConfig {
            ttl: Duration::from_millis(50),
            reap_interval: Duration::from_millis(10),
        },
        ..Default::default()
    };
    let service = Arc::new(EditingService::new(config));
    let campaign = service
        .create(
            &Principal::admin(),
            EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
        )
        .await
        .unwrap();

    let jane = analyst("u-jane", "jane");
    let session = open_session(
        Arc::new(LocalTransport::new(Arc::clone(&service), jane.clone())),
        jane.clone(),
        &campaign.id,
    )
    .await;
    session.focus("name").await.unwrap();

    // idle well past the TTL
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(service.reap_presence().await, 0);
    assert_eq!(
        service.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Focused("name".into())
    );

    session.close().await;
    assert_eq!(
        service.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Absent
    );
}
