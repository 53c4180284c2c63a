//! The gateway over real sockets: envelope routing, status codes and the
//! WebSocket subscription protocol

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::{Error, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use scriptorium::auth::Principal;
use scriptorium::client::{HttpTransport, Transport};
use scriptorium::events::EntityEvent;
use scriptorium::presence::PresenceState;
use scriptorium::protocol::{EntityAddInput, OperationRequest, RelationAddInput};
use scriptorium::schema::EntityType;
use scriptorium::store::EntityProjection;
use scriptorium::{Args, AppState, ScriptoriumError};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

/// Dev-mode gateway on an ephemeral port; token-less calls act as admin
async fn start(extra: &[&str]) -> (Arc<AppState>, String) {
    let mut argv = vec!["scriptorium", "--dev-mode"];
    argv.extend_from_slice(extra);
    let state = Arc::new(AppState::new(Args::parse_from(argv)).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(scriptorium::serve(Arc::clone(&state), listener));

    (state, format!("http://{}/", addr))
}

async fn create(transport: &HttpTransport, input: EntityAddInput) -> EntityProjection {
    let data = assert_ok!(transport.execute(OperationRequest::entity_add(&input)).await);
    serde_json::from_value(data).unwrap()
}

async fn connect(base: &str, entity_id: &str, token: Option<&str>) -> Socket {
    let mut url = format!("{}subscriptions/{}", base.replacen("http", "ws", 1), entity_id);
    if let Some(token) = token {
        url = format!("{}?token={}", url, token);
    }
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

/// Read text frames until one satisfies `pred`
async fn frame_where<F: Fn(&Value) -> bool>(socket: &mut Socket, pred: F) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if pred(&frame) {
                        return frame;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended early: {:?}", other),
            }
        }
    })
    .await
    .unwrap()
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

fn focused_on<'a>(frame: &'a Value, name: &str) -> Option<&'a str> {
    frame["entity"]["editContext"]
        .as_array()?
        .iter()
        .find(|e| e["name"] == name)
        .and_then(|e| e["focusOn"].as_str())
}

#[tokio::test]
async fn test_operations_round_trip_over_http() {
    let (_state, base) = start(&[]).await;
    let transport = HttpTransport::new(&base).unwrap();

    let created = create(
        &transport,
        EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
    )
    .await;

    let data = assert_ok!(
        transport
            .execute(OperationRequest::field_patch(&created.id, "name", vec![json!("Renamed")]))
            .await
    );
    let patched: EntityProjection = serde_json::from_value(data).unwrap();
    assert_eq!(patched.field_str("name"), Some("Renamed"));
    assert_eq!(patched.version("name"), 2);

    let data = assert_ok!(transport.execute(OperationRequest::entity(&created.stix_id_key)).await);
    let read: EntityProjection = serde_json::from_value(data).unwrap();
    assert_eq!(read.id, created.id);

    // operation failures keep status 200 and come back as the same variant
    let missing = transport
        .execute(OperationRequest::field_patch("nope", "name", vec![json!("x")]))
        .await;
    assert!(matches!(missing, Err(ScriptoriumError::NotFound(_))));
}

#[tokio::test]
async fn test_status_codes() {
    let (_state, base) = start(&[]).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}health", base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["healthy"], true);

    let garbage = client
        .post(format!("{}api/operations", base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);
    let body: Value = garbage.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "BAD_REQUEST");

    let refused = client
        .post(format!("{}api/operations", base))
        .bearer_auth("not-a-jwt")
        .json(&OperationRequest::me())
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), 401);

    let failed = client
        .post(format!("{}api/operations", base))
        .json(&OperationRequest::entity_add(&EntityAddInput::new(EntityType::Campaign)))
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), 200);
    let body: Value = failed.json().await.unwrap();
    assert!(body["errors"].as_array().is_some_and(|e| !e.is_empty()));

    let unknown = client.get(format!("{}nope", base)).send().await.unwrap();
    assert_eq!(unknown.status(), 404);

    let url = format!("{}subscriptions/nope", base.replacen("http", "ws", 1));
    let Err(Error::Http(refused)) = connect_async(url.as_str()).await else {
        panic!("subscription to a missing entity was accepted");
    };
    assert_eq!(refused.status(), 404);
}

#[tokio::test]
async fn test_subscription_protocol() {
    let (state, base) = start(&[]).await;
    let transport = HttpTransport::new(&base).unwrap();
    let campaign = create(
        &transport,
        EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
    )
    .await;
    let admin = Principal::admin();
    let presence = || state.editing.presence().state_of(&campaign.id, &admin.id);

    let mut socket = connect(&base, &campaign.id, None).await;
    let initial = frame_where(&mut socket, |f| f["type"] == "updated").await;
    assert_eq!(initial["entity"]["editContext"].as_array().unwrap().len(), 1);
    assert_eq!(presence(), PresenceState::Present);

    send(&mut socket, json!({"type": "ping"})).await;
    frame_where(&mut socket, |f| f["type"] == "pong").await;
    assert_eq!(presence(), PresenceState::Present);

    send(&mut socket, json!({"type": "focus", "focusOn": "description"})).await;
    let focused =
        frame_where(&mut socket, |f| focused_on(f, &admin.name) == Some("description")).await;
    assert_eq!(focused["type"], "updated");
    assert_eq!(presence(), PresenceState::Focused("description".into()));

    assert_ok!(transport.execute(OperationRequest::delete(&campaign.id)).await);
    let deleted = frame_where(&mut socket, |f| f["type"] == "deleted").await;
    assert_eq!(deleted["id"], campaign.id.as_str());

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    wait_until(|| state.editing.presence().stats().entries == 0).await;
}

#[tokio::test]
async fn test_role_granted_reader_can_focus_over_socket() {
    let (state, base) = start(&[]).await;
    let admin = HttpTransport::new(&base).unwrap();

    let campaign = create(
        &admin,
        EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
    )
    .await;
    let user = create(
        &admin,
        EntityAddInput::new(EntityType::User)
            .with_field("name", "jane")
            .with_field("user_email", "jane@example.org"),
    )
    .await;
    let role = create(
        &admin,
        EntityAddInput::new(EntityType::Role).with_field("name", "Reader"),
    )
    .await;
    let capability = create(
        &admin,
        EntityAddInput::new(EntityType::Capability).with_field("name", "KNOWLEDGE"),
    )
    .await;
    for (from, through, to) in [
        (&role.id, "role_capability", &capability.id),
        (&user.id, "user_role", &role.id),
    ] {
        assert_ok!(
            admin
                .execute(OperationRequest::relation_add(
                    from,
                    &RelationAddInput::new(through, to.clone()),
                ))
                .await
        );
    }

    // the token itself carries no capability
    let jane = Principal::new(user.id.clone(), "jane", Vec::<String>::new());
    let token = state.jwt.as_ref().unwrap().generate_token(&jane).unwrap();

    let mut socket = connect(&base, &campaign.id, Some(&token)).await;
    frame_where(&mut socket, |f| f["type"] == "updated").await;

    send(&mut socket, json!({"type": "focus", "focusOn": "description"})).await;
    let frame = frame_where(&mut socket, |f| {
        f["type"] == "error" || focused_on(f, "jane") == Some("description")
    })
    .await;
    assert_eq!(frame["type"], "updated", "focus refused: {}", frame);
    assert_eq!(
        state.editing.presence().state_of(&campaign.id, &jane.id),
        PresenceState::Focused("description".into())
    );
}

#[tokio::test]
async fn test_connected_client_outlives_presence_ttl() {
    let (state, base) = start(&["--presence-ttl-secs", "1", "--presence-reap-interval-secs", "1"])
        .await;
    let transport = HttpTransport::new(&base).unwrap();
    let campaign = create(
        &transport,
        EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
    )
    .await;
    let admin = Principal::admin();

    let mut subscription = assert_ok!(transport.subscribe(&campaign.id).await);
    assert!(matches!(
        subscription.next().await,
        Some(EntityEvent::Updated { .. })
    ));

    // the client answers every heartbeat, so it stays through several reaper runs
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        state.editing.presence().state_of(&campaign.id, &admin.id),
        PresenceState::Present
    );

    subscription.dispose().await;
    wait_until(|| state.editing.presence().stats().entries == 0).await;
}

#[tokio::test]
async fn test_silent_socket_is_disconnected() {
    let (state, base) = start(&["--presence-ttl-secs", "1", "--presence-reap-interval-secs", "1"])
        .await;
    let transport = HttpTransport::new(&base).unwrap();
    let campaign = create(
        &transport,
        EntityAddInput::new(EntityType::Campaign).with_field("name", "Campaign"),
    )
    .await;

    // never read, so server pings go unanswered
    let _socket = connect(&base, &campaign.id, None).await;
    wait_until(|| state.editing.presence().stats().entries == 1).await;

    tokio::time::timeout(WAIT, async {
        while state.editing.presence().stats().entries > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
}
