//! Entity subscriptions over WebSocket
//!
//! ## Protocol
//!
//! Connect: `ws://host/subscriptions/{id}?token=...`
//!
//! Messages (server → client):
//! - `updated` - full entity projection, edit context included
//! - `deleted` - the entity is gone, the socket closes after it
//! - `pong` - answer to `ping`
//! - `error` - an operation sent over the socket failed
//!
//! Messages (client → server):
//! - `ping` - keep-alive, refreshes presence
//! - `focus` - `{"type":"focus","focusOn":"name"}`, same as `contextPatch`
//!
//! The principal is present on the entity for as long as the socket is open.
//! The server pings at a third of the presence TTL; a client that stays
//! silent for a whole TTL is disconnected, which ends its presence.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::auth::Principal;
use crate::events::EntityEvent;
use crate::server::http::{error_response, AppState};
use crate::services::EditingService;
use crate::store::EntityProjection;
use crate::types::ScriptoriumError;

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Message received from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Focus {
        #[serde(rename = "focusOn", default)]
        focus_on: String,
    },
}

/// Handle WebSocket upgrade for an entity subscription
pub async fn handle_subscription_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
    entity_id: &str,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(&ScriptoriumError::BadRequest(
            "WebSocket upgrade required".into(),
        ));
    }

    let principal = match state.authenticate(&req) {
        Ok(p) => state.editing.effective_principal(&p),
        Err(e) => {
            warn!("Subscription to {} refused: {}", entity_id, e);
            return error_response(&e);
        }
    };

    // Register presence before upgrading so a missing entity is a plain 404
    let editing = Arc::clone(&state.editing);
    let (rx, projection) = match editing.subscribe(&principal, entity_id).await {
        Ok(subscribed) => subscribed,
        Err(e) => return error_response(&e),
    };

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok((resp, ws)) => (resp, ws),
        Err(e) => {
            error!("WebSocket upgrade failed: {}", e);
            editing.unsubscribe(&principal, &projection.id).await;
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("WebSocket upgrade failed")))
                .unwrap();
        }
    };

    info!("{} subscribed to {}", principal.name, projection.id);

    tokio::spawn(async move {
        let entity_id = projection.id.clone();
        match websocket.await {
            Ok(ws) => {
                let ws: HyperWebSocket = ws;
                if let Err(e) =
                    handle_subscription(ws, &editing, &principal, rx, projection).await
                {
                    warn!("Subscription WebSocket error: {}", e);
                }
            }
            Err(e) => {
                error!("WebSocket connection failed: {}", e);
            }
        }
        editing.unsubscribe(&principal, &entity_id).await;
        info!("{} left {}", principal.name, entity_id);
    });

    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

/// Pump hub events to the socket and client messages into the service
async fn handle_subscription(
    ws: HyperWebSocket,
    editing: &EditingService,
    principal: &Principal,
    mut rx: broadcast::Receiver<EntityEvent>,
    initial: EntityProjection,
) -> Result<(), ScriptoriumError> {
    let (mut sender, mut receiver) = ws.split();
    let entity_id = initial.id.clone();

    let json = serde_json::to_string(&EntityEvent::Updated { entity: initial })?;
    sender.send(WsMessage::Text(json)).await?;

    let ttl = editing.presence().config().ttl;
    let mut heartbeat = interval(editing.presence().config().heartbeat());
    heartbeat.reset();
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            // Broadcast from the entity's channel
            msg = rx.recv() => {
                match msg {
                    Ok(event) => {
                        let deleted = matches!(event, EntityEvent::Deleted { .. });
                        let json = serde_json::to_string(&event)?;
                        if sender.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                        if deleted {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Later projections supersede the skipped ones; resend the current one
                        debug!("Subscriber on {} lagged by {}", entity_id, skipped);
                        let Some(entity) = editing.store().get(&entity_id) else {
                            break;
                        };
                        let current = EntityEvent::Updated { entity: editing.project(&entity) };
                        let json = serde_json::to_string(&current)?;
                        if sender.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // Message from client
            msg = receiver.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_heard = Instant::now();
                }
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                editing.keep_alive(principal, &entity_id);
                                let pong = serde_json::json!({"type": "pong"});
                                let _ = sender.send(WsMessage::Text(pong.to_string())).await;
                            }
                            Ok(ClientMessage::Focus { focus_on }) => {
                                if let Err(e) = editing.context_patch(principal, &entity_id, &focus_on).await {
                                    let err = serde_json::json!({"type": "error", "message": e.detail()});
                                    let _ = sender.send(WsMessage::Text(err.to_string())).await;
                                }
                            }
                            Err(e) => debug!("Ignoring client message on {}: {}", entity_id, e),
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        editing.keep_alive(principal, &entity_id);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        editing.keep_alive(principal, &entity_id);
                        let _ = sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("Client closed subscription on {}", entity_id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                if last_heard.elapsed() >= ttl {
                    info!("{} silent on {} for {:?}, closing", principal.name, entity_id, ttl);
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}
