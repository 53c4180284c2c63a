//! A campaign from creation to deletion, driven through the operation envelope

use serde_json::{json, Value};
use std::sync::Arc;
use tokio_test::assert_ok;

use scriptorium::auth::Principal;
use scriptorium::client::{LocalTransport, Transport};
use scriptorium::protocol::{
    EntityAddInput, OperationName, OperationRequest, OperationResponse, RelationAddInput,
    RelationAddPayload,
};
use scriptorium::schema::EntityType;
use scriptorium::services::EditingService;
use scriptorium::store::EntityProjection;
use scriptorium::ScriptoriumError;

fn transport() -> LocalTransport {
    let service = Arc::new(EditingService::default());
    LocalTransport::new(service, Principal::admin())
}

async fn projection(transport: &LocalTransport, request: OperationRequest) -> EntityProjection {
    let data = assert_ok!(transport.execute(request).await);
    serde_json::from_value(data).unwrap()
}

#[tokio::test]
async fn test_campaign_lifecycle() {
    let transport = transport();

    let created = projection(
        &transport,
        OperationRequest::entity_add(
            &EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
        ),
    )
    .await;
    assert!(created.stix_id_key.starts_with("campaign--"));

    let read = projection(&transport, OperationRequest::entity(&created.id)).await;
    assert_eq!(read.field_str("name"), Some("Campaign"));

    let patched = projection(
        &transport,
        OperationRequest::field_patch(&created.id, "name", vec![json!("Campaign - test")]),
    )
    .await;
    assert_eq!(patched.field_str("name"), Some("Campaign - test"));
    assert_eq!(patched.version("name"), 2);

    let read = projection(&transport, OperationRequest::entity(&created.stix_id_key)).await;
    assert_eq!(read.field_str("name"), Some("Campaign - test"));

    let marking = projection(
        &transport,
        OperationRequest::entity_add(
            &EntityAddInput::new(EntityType::MarkingDefinition)
                .with_field("definition_type", "TLP")
                .with_field("definition", "TLP:RED")
                .with_field("color", "#c62828")
                .with_field("level", 4),
        ),
    )
    .await;

    let input = RelationAddInput::new("object_marking_refs", marking.id.clone());
    let data = assert_ok!(
        transport
            .execute(OperationRequest::relation_add(&created.id, &input))
            .await
    );
    let added: RelationAddPayload = serde_json::from_value(data).unwrap();
    assert_eq!(added.to.id, marking.id);
    let markings = added.from.related("markingDefinitions");
    assert_eq!(markings.len(), 1);
    assert_eq!(markings[0].node.id, marking.id);

    // adding the same edge again keeps a single one
    let data = assert_ok!(
        transport
            .execute(OperationRequest::relation_add(&created.id, &input))
            .await
    );
    let again: RelationAddPayload = serde_json::from_value(data).unwrap();
    assert_eq!(again.id, added.id);
    assert_eq!(again.from.related("markingDefinitions").len(), 1);

    let unmarked = projection(
        &transport,
        OperationRequest::relation_delete(&created.id, &added.id),
    )
    .await;
    assert!(unmarked.related("markingDefinitions").is_empty());

    let deleted = assert_ok!(transport.execute(OperationRequest::delete(&created.id)).await);
    assert_eq!(deleted["id"], created.id);

    for id in [&created.id, &created.stix_id_key] {
        let data = assert_ok!(transport.execute(OperationRequest::entity(id)).await);
        assert_eq!(data, Value::Null);
    }
}

#[tokio::test]
async fn test_errors_survive_the_envelope() {
    let transport = transport();

    let missing = transport
        .execute(OperationRequest::field_patch("nope", "name", vec![json!("x")]))
        .await;
    let err = missing.unwrap_err();
    assert!(matches!(err, ScriptoriumError::NotFound(_)));

    // what a remote client rebuilds from the wire
    let wire = serde_json::to_string(&OperationResponse::failure(&err)).unwrap();
    let rebuilt: OperationResponse = serde_json::from_str(&wire).unwrap();
    assert!(matches!(
        rebuilt.into_result(),
        Err(ScriptoriumError::NotFound(_))
    ));

    let invalid = transport
        .execute(OperationRequest::new(OperationName::Delete, json!({})))
        .await;
    assert!(matches!(invalid, Err(ScriptoriumError::BadRequest(_))));
}

#[tokio::test]
async fn test_roles_grant_capabilities_to_me() {
    let service = Arc::new(EditingService::default());
    let admin = LocalTransport::new(Arc::clone(&service), Principal::admin());

    let user = projection(
        &admin,
        OperationRequest::entity_add(
            &EntityAddInput::new(EntityType::User)
                .with_field("name", "jane")
                .with_field("user_email", "jane@example.org"),
        ),
    )
    .await;
    let role = projection(
        &admin,
        OperationRequest::entity_add(
            &EntityAddInput::new(EntityType::Role).with_field("name", "Analyst"),
        ),
    )
    .await;
    let capability = projection(
        &admin,
        OperationRequest::entity_add(
            &EntityAddInput::new(EntityType::Capability).with_field("name", "KNOWLEDGE_KNUPDATE"),
        ),
    )
    .await;

    assert_ok!(
        admin
            .execute(OperationRequest::relation_add(
                &role.id,
                &RelationAddInput::new("role_capability", capability.id.clone()),
            ))
            .await
    );
    assert_ok!(
        admin
            .execute(OperationRequest::relation_add(
                &user.id,
                &RelationAddInput::new("user_role", role.id.clone()),
            ))
            .await
    );

    let jane = LocalTransport::new(
        Arc::clone(&service),
        Principal::new(user.id.clone(), "jane", Vec::<String>::new()),
    );
    let me: Principal =
        serde_json::from_value(assert_ok!(jane.execute(OperationRequest::me()).await)).unwrap();
    assert!(me.capabilities.iter().any(|c| c.name == "KNOWLEDGE_KNUPDATE"));

    let stripped = projection(
        &admin,
        OperationRequest::relation_remove_by_name(&user.id, "user_role", "Analyst"),
    )
    .await;
    assert!(stripped.related("roles").is_empty());

    let me: Principal =
        serde_json::from_value(assert_ok!(jane.execute(OperationRequest::me()).await)).unwrap();
    assert!(me.capabilities.is_empty());
}
