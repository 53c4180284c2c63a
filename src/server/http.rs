//! HTTP server implementation
//!
//! hyper http1 with TokioIo; connections keep upgrades enabled so
//! `/subscriptions/{id}` can switch to WebSocket.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::{extract_token_from_header, extract_token_from_query, JwtValidator, Principal};
use crate::config::Args;
use crate::routes;
use crate::server::websocket;
use crate::services::{spawn_reaper_task, EditingConfig, EditingService};
use crate::types::{Result, ScriptoriumError};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub const SUBSCRIPTIONS_PREFIX: &str = "/subscriptions/";

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Entity, relation and presence operations
    pub editing: Arc<EditingService>,
    /// Bearer token verification; `None` only when no secret is configured
    pub jwt: Option<JwtValidator>,
    pub started_at: Instant,
}

impl AppState {
    /// State with a fresh editing service built from the CLI
    pub fn new(args: Args) -> Result<Self> {
        let editing = EditingService::new(EditingConfig::from_args(&args));
        Self::with_service(args, Arc::new(editing))
    }

    /// State around an already configured editing service
    pub fn with_service(args: Args, editing: Arc<EditingService>) -> Result<Self> {
        let jwt = args
            .jwt_secret()
            .map(|secret| JwtValidator::new(secret, args.jwt_expiry_seconds))
            .transpose()?;

        Ok(Self {
            args,
            editing,
            jwt,
            started_at: Instant::now(),
        })
    }

    /// Resolve the caller from `Authorization: Bearer` or `?token=`.
    /// Dev mode lets token-less requests act as the built-in admin.
    pub fn authenticate<B>(&self, req: &Request<B>) -> Result<Principal> {
        let header = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        let token = extract_token_from_header(header)
            .or_else(|| extract_token_from_query(req.uri().query(), "token"));

        match token {
            Some(token) => {
                let jwt = self.jwt.as_ref().ok_or_else(|| {
                    ScriptoriumError::Unauthorized("Token verification is not configured".into())
                })?;
                Ok(jwt.verify_token(token)?.into_principal())
            }
            None if self.args.dev_mode => Ok(Principal::admin()),
            None => Err(ScriptoriumError::Unauthorized("Missing bearer token".into())),
        }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(state, listener).await
}

/// Serve on an already bound listener
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    info!(
        "Scriptorium listening on {} as node {}",
        listener.local_addr()?,
        state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - requests without a token act as admin");
    }

    let reap_interval = state.editing.presence().config().reap_interval;
    spawn_reaper_task(Arc::clone(&state.editing), reap_interval);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // CORS preflight
        (Method::OPTIONS, _) => to_boxed(preflight_response()),

        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)))
        }

        // Operation envelope
        (Method::POST, "/api/operations") => {
            to_boxed(routes::handle_operation(Arc::clone(&state), req).await)
        }

        // Live entity subscription
        (Method::GET, p) if p.starts_with(SUBSCRIPTIONS_PREFIX) => {
            let entity_id = &p[SUBSCRIPTIONS_PREFIX.len()..];
            if entity_id.is_empty() || entity_id.contains('/') {
                to_boxed(not_found_response(p))
            } else {
                to_boxed(
                    websocket::handle_subscription_upgrade(Arc::clone(&state), req, entity_id)
                        .await,
                )
            }
        }

        (_, p) => to_boxed(not_found_response(p)),
    };

    Ok(response)
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "POST /api/operations or WebSocket /subscriptions/{id}"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// JSON error body with the status of the error
pub fn error_response(err: &ScriptoriumError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": err.code(),
        "message": err.detail(),
    });

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
