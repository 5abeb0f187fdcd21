//! Control API
//!
//! Opens, lists and closes relay sessions. Each session is then served on
//! its own port; this router only hands out the URLs.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use iptvrelay_stream::{RelayError, RelayMode, SessionHandle, SessionManager, SessionRequest};

#[derive(Debug, Deserialize)]
pub struct OpenSessionBody {
    #[serde(flatten)]
    pub request: SessionRequest,
    /// Reuse a healthy session for the same source, mode and kind.
    #[serde(default)]
    pub shared: bool,
}

#[derive(Debug, Serialize)]
pub struct OpenSessionResponse {
    pub id: String,
    pub port: u16,
    pub local_url: String,
    pub stream_url: String,
    pub manifest_url: String,
}

impl From<&SessionHandle> for OpenSessionResponse {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            id: handle.id().to_string(),
            port: handle.port(),
            local_url: handle.local_url(),
            stream_url: handle.stream_url(),
            manifest_url: handle.manifest_url(),
        }
    }
}

/// Query of the legacy `GET /stream` entry point.
#[derive(Debug, Deserialize)]
pub struct LegacyStreamQuery {
    pub url: String,
    /// `auto` or any relay mode alias.
    pub mode: Option<String>,
    /// Base64 of a JSON object of upstream headers.
    pub headers: Option<String>,
}

pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions).post(open_session))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .route("/stream", get(legacy_stream))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

async fn open_session(
    State(manager): State<SessionManager>,
    Json(body): Json<OpenSessionBody>,
) -> Result<Response, RelayError> {
    let handle = if body.shared {
        manager.open_shared(body.request).await?
    } else {
        manager.open(body.request).await?
    };
    Ok((StatusCode::CREATED, Json(OpenSessionResponse::from(&handle))).into_response())
}

async fn list_sessions(State(manager): State<SessionManager>) -> impl IntoResponse {
    Json(manager.list())
}

async fn get_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<Response, RelayError> {
    manager
        .status(&id)
        .map(|status| Json(status).into_response())
        .ok_or(RelayError::SessionNotFound(id))
}

async fn close_session(
    State(manager): State<SessionManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, RelayError> {
    manager.close(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn legacy_stream(
    State(manager): State<SessionManager>,
    Query(query): Query<LegacyStreamQuery>,
) -> Result<Response, RelayError> {
    let request = match legacy_request(query) {
        Ok(request) => request,
        Err(message) => return Ok(bad_request(message)),
    };
    let handle = manager.open_shared(request).await?;
    info!(session_id = %handle.id(), "Legacy stream entry redirected");
    Ok((StatusCode::FOUND, [(header::LOCATION, handle.local_url())]).into_response())
}

fn legacy_request(query: LegacyStreamQuery) -> Result<SessionRequest, String> {
    let mode = match query.mode.as_deref().map(str::trim) {
        None | Some("" | "auto") => None,
        Some(mode) => Some(mode.parse::<RelayMode>().map_err(|e| e.to_string())?),
    };
    let headers = match query.headers.as_deref() {
        None | Some("") => BTreeMap::new(),
        Some(encoded) => decode_headers(encoded)?,
    };
    Ok(SessionRequest {
        url: query.url,
        headers,
        mode,
        ..SessionRequest::default()
    })
}

/// Accepts standard and URL-safe base64, padded or not.
fn decode_headers(encoded: &str) -> Result<BTreeMap<String, String>, String> {
    let encoded = encoded.trim().trim_end_matches('=');
    let raw = general_purpose::STANDARD_NO_PAD
        .decode(encoded)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| format!("headers are not base64: {e}"))?;
    serde_json::from_slice(&raw).map_err(|e| format!("headers are not a JSON object: {e}"))
}
