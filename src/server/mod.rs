//! HTTP front door.
//!
//! Routes follow the Durable Functions HTTP API shape:
//!
//! - `POST /orchestrators/{name}` starts an instance and answers `202` with status URIs
//! - `GET /runtime/instances/{id}` reads status (`?showHistory=true` adds the history)
//! - `POST /runtime/instances/{id}/terminate` requests termination
//! - `GET /runtime/instances` lists instances
//! - `GET /api/health`

pub mod error;

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::_typed_codec::{Codec, Json as JsonCodec};
use crate::providers::InstanceInfo;
use crate::{Client, Error, Event, OrchestrationRegistry};
pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub client: Client,
    /// Used to reject unknown orchestration names before any record is created.
    pub orchestrations: OrchestrationRegistry,
    /// Base for the URIs returned by the start call. Derived from the `Host` header when unset.
    pub public_base_url: Option<String>,
}

impl AppState {
    pub fn new(client: Client, orchestrations: OrchestrationRegistry) -> Self {
        Self {
            client,
            orchestrations,
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.public_base_url {
            return base.trim_end_matches('/').to_string();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orchestrators/{name}", post(start_orchestration))
        .route("/runtime/instances", get(list_instances))
        .route("/runtime/instances/{id}", get(get_instance_status))
        .route("/runtime/instances/{id}/terminate", post(terminate_instance))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "agentflow::server", addr = %listener.local_addr()?, "HTTP front door listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target: "agentflow::server", "Shutdown signal received");
        })
        .await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub id: String,
    pub status_query_get_uri: String,
    pub terminate_post_uri: String,
}

async fn start_orchestration(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !state.orchestrations.has(&name) {
        return Err(Error::UnknownOrchestration(name).into());
    }
    let input = decode_body(&body)?;
    let id = state.client.start_orchestration(&name, input).await?;

    let base = state.base_url(&headers);
    let status_uri = format!("{base}/runtime/instances/{id}");
    let response = StartResponse {
        terminate_post_uri: format!("{status_uri}/terminate"),
        status_query_get_uri: status_uri.clone(),
        id,
    };
    let mut resp = (StatusCode::ACCEPTED, Json(response)).into_response();
    if let Ok(location) = HeaderValue::from_str(&status_uri) {
        resp.headers_mut().insert(header::LOCATION, location);
    }
    Ok(resp)
}

/// Empty bodies start with `null`; anything else must be JSON.
fn decode_body(body: &[u8]) -> Result<String, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok("null".to_string());
    }
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| Error::InvalidInput(format!("request body is not JSON: {e}")))?;
    JsonCodec::encode(&value)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    #[serde(default)]
    show_history: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusBody {
    pub instance_id: String,
    pub name: String,
    pub runtime_status: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub error: Option<ErrorBody>,
    pub parent_instance_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_time: u64,
    pub last_updated_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Event>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl From<InstanceInfo> for InstanceStatusBody {
    fn from(info: InstanceInfo) -> Self {
        Self {
            runtime_status: info.status.to_string(),
            input: payload_value(&info.input),
            output: info.output.as_deref().map(payload_value).unwrap_or(serde_json::Value::Null),
            error: info.error.map(|e| ErrorBody {
                kind: e.kind(),
                message: e.message().to_string(),
            }),
            instance_id: info.instance_id,
            name: info.orchestration_name,
            parent_instance_id: info.parent_instance,
            created_time: info.created_at_ms,
            last_updated_time: info.updated_at_ms,
            history: None,
        }
    }
}

/// Payloads are JSON text, or a bare string when the value was a plain string.
// Handlers registered with `register` may store text that is not JSON
fn payload_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn get_instance_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<InstanceStatusBody>, ApiError> {
    let info = state.client.get_instance(&id).await?;
    let mut body = InstanceStatusBody::from(info);
    if query.show_history {
        body.history = Some(state.client.read_history(&id).await?);
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct TerminateQuery {
    reason: Option<String>,
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> Result<StatusCode, ApiError> {
    let reason = query.reason.unwrap_or_else(|| "terminated via HTTP".to_string());
    state.client.terminate_instance(&id, reason).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<InstanceStatusBody>>, ApiError> {
    let infos = state.client.list_instances().await?;
    Ok(Json(infos.into_iter().map(InstanceStatusBody::from).collect()))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_null_input() {
        assert_eq!(decode_body(b"").unwrap(), "null");
        assert_eq!(decode_body(b"  \n").unwrap(), "null");
    }

    #[test]
    fn json_bodies_are_normalized() {
        assert_eq!(decode_body(br#" {"a": 1} "#).unwrap(), r#"{"a":1}"#);
        assert_eq!(decode_body(br#""plain""#).unwrap(), r#""plain""#);
        assert_eq!(decode_body(br#""42""#).unwrap(), r#""42""#);
        assert_eq!(decode_body(b"not json").unwrap_err().kind(), "InvalidInput");
    }

    #[test]
    fn payloads_render_as_json_when_possible() {
        assert_eq!(payload_value(r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(payload_value("hello"), serde_json::json!("hello"));
        assert_eq!(payload_value(r#""42""#), serde_json::json!("42"));
    }
}
