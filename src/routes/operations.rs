//! Operation envelope endpoint
//!
//! `POST /api/operations` with `{ "operation": ..., "variables": {...} }`.
//! Operation failures come back with status 200 and an `errors` array, like
//! a GraphQL server. Only an unreadable envelope or a refused token changes
//! the HTTP status.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::protocol::{OperationRequest, OperationResponse};
use crate::server::AppState;
use crate::types::ScriptoriumError;

pub async fn handle_operation(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let principal = match state.authenticate(&req) {
        Ok(p) => p,
        Err(e) => return envelope_response(e.status_code(), &OperationResponse::failure(&e)),
    };

    let body = match req.into_body().collect().await {
        Ok(b) => b.to_bytes(),
        Err(e) => {
            let err = ScriptoriumError::BadRequest(format!("Invalid body: {}", e));
            return envelope_response(StatusCode::BAD_REQUEST, &OperationResponse::failure(&err));
        }
    };

    let request = match parse_request(&body) {
        Ok(r) => r,
        Err(e) => return envelope_response(StatusCode::BAD_REQUEST, &OperationResponse::failure(&e)),
    };

    let result = state.editing.dispatch(&principal, &request).await;
    match &result {
        Ok(_) => debug!("{} by {} ok", request.operation, principal.name),
        Err(e) => warn!("{} by {} failed: {}", request.operation, principal.name, e),
    }

    envelope_response(StatusCode::OK, &OperationResponse::from_result(result))
}

fn parse_request(body: &[u8]) -> Result<OperationRequest, ScriptoriumError> {
    serde_json::from_slice(body)
        .map_err(|e| ScriptoriumError::BadRequest(format!("Invalid operation envelope: {}", e)))
}

fn envelope_response(status: StatusCode, envelope: &OperationResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(envelope).unwrap_or_else(|_| {
        r#"{"data":null,"errors":[{"message":"Serialization failed","code":"INTERNAL"}]}"#
            .to_string()
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
