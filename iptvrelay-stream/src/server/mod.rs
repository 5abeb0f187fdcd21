//! Per-session HTTP surface.
//!
//! Every session listens on its own port and serves:
//!
//! - `GET /{id}/stream`: byte stream for pass-through and audio sessions,
//!   `302` to the manifest for HLS sessions
//! - `GET /{id}/stream.m3u8`: HLS manifest of the ready segment window
//! - `GET /{id}/segments/{seq}.ts`: one segment
//! - `GET /{id}/status`: JSON status

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::session::{RelayMode, Session};

/// Chunks in flight between the ring buffer and the client socket.
const RESPONSE_CHANNEL_CAPACITY: usize = 8;

const MPEGURL: &str = "application/vnd.apple.mpegurl";

#[derive(Clone)]
struct ServerState {
    session: Arc<Session>,
    read_chunk_bytes: usize,
    /// How long `/stream` and the manifest wait for the first decision or
    /// segment.
    ready_timeout: Duration,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidMode(_) | Self::UnsupportedSource(_) => StatusCode::CONFLICT,
            Self::PortExhausted { .. } | Self::RestartBudgetExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::UpstreamUnauthorized { .. } | Self::UpstreamUnreachable(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::ClassificationAmbiguous(_)
            | Self::TranscoderStartFailed(_)
            | Self::TranscoderCrashed(_)
            | Self::ClientDisconnected
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}

fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/{id}/stream", get(stream))
        .route("/{id}/stream.m3u8", get(manifest))
        .route("/{id}/segments/{segment}", get(segment))
        .route("/{id}/status", get(status))
        .layer(cors)
        .with_state(state)
}

/// Serve `session` on `listener` until the session is cancelled.
pub(crate) async fn serve(
    listener: TcpListener,
    session: Arc<Session>,
    read_chunk_bytes: usize,
    ready_timeout: Duration,
) {
    let shutdown = session.cancel.clone();
    let port = session.port;
    let app = router(ServerState {
        session,
        read_chunk_bytes,
        ready_timeout,
    });

    debug!(port, "Session server listening");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        warn!(port, "Session server error: {e}");
    }
    debug!(port, "Session server shut down");
}

fn check_id(state: &ServerState, id: &str) -> Result<(), RelayError> {
    if state.session.id == id {
        Ok(())
    } else {
        Err(RelayError::SessionNotFound(id.to_string()))
    }
}

async fn stream(
    Path(id): Path<String>,
    State(state): State<ServerState>,
) -> Result<Response, RelayError> {
    check_id(&state, &id)?;
    let session = &state.session;
    session.touch();

    let Some(mode) = session.wait_mode(state.ready_timeout).await else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, "Stream not ready").into_response());
    };
    if mode == RelayMode::VideoTranscode {
        let location = format!("/{id}/stream.m3u8");
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }
    let Some(source) = session.stream_source() else {
        return Err(RelayError::Internal(format!("no byte stream for {mode}")));
    };

    let content_type = match mode {
        RelayMode::AudioPassthrough => session
            .upstream_content_type()
            .filter(|ct| ct.starts_with("audio/"))
            .unwrap_or_else(|| "audio/mpeg".to_string()),
        RelayMode::AudioTranscode => "audio/mpeg".to_string(),
        RelayMode::VideoPassthrough | RelayMode::VideoTranscode => "video/mp2t".to_string(),
    };

    let (token, guard) = session.claim_reader();
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(RESPONSE_CHANNEL_CAPACITY);
    let pump_session = Arc::clone(session);
    let chunk = state.read_chunk_bytes;
    info!(session_id = %session.id, mode = %mode, "Downstream reader attached");

    tokio::spawn(async move {
        let _guard = guard;
        loop {
            let next = tokio::select! {
                () = token.cancelled() => break,
                next = source.read_chunk(chunk) => next,
            };
            let Some(bytes) = next else {
                debug!(session_id = %pump_session.id, "Byte stream reached EOF");
                break;
            };
            let len = bytes.len();
            tokio::select! {
                () = token.cancelled() => break,
                sent = tx.send(Ok(bytes)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            pump_session.add_served(len);
            pump_session.touch();
        }
    });

    let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(body)
        .map_err(|e| RelayError::Internal(e.to_string()))
}

async fn manifest(
    Path(id): Path<String>,
    State(state): State<ServerState>,
) -> Result<Response, RelayError> {
    check_id(&state, &id)?;
    let session = &state.session;
    session.touch();

    match session.wait_mode(state.ready_timeout).await {
        Some(RelayMode::VideoTranscode) => {}
        Some(mode) => {
            return Err(RelayError::InvalidMode(format!("{mode} sessions have no manifest")));
        }
        None => return Ok((StatusCode::SERVICE_UNAVAILABLE, "Stream not ready").into_response()),
    }

    let ready = tokio::select! {
        () = session.cancel.cancelled() => false,
        ready = session.segments.wait_ready(state.ready_timeout) => ready,
    };
    if !ready && !session.segments.is_ended() {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, "No segment ready yet").into_response());
    }

    let playlist = session
        .segments
        .manifest(|sequence| format!("segments/{sequence}.ts"));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MPEGURL),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist,
    )
        .into_response())
}

async fn segment(
    Path((id, segment)): Path<(String, String)>,
    State(state): State<ServerState>,
) -> Result<Response, RelayError> {
    check_id(&state, &id)?;
    state.session.touch();

    let data = segment
        .strip_suffix(".ts")
        .and_then(|seq| seq.parse::<u64>().ok())
        .and_then(|seq| state.session.segments.get(seq));
    match data {
        Some(data) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "video/mp2t"),
                (header::CACHE_CONTROL, "public, max-age=90"),
            ],
            data,
        )
            .into_response()),
        None => {
            debug!(session_id = %id, segment = %segment, "Segment not available");
            Ok((StatusCode::NOT_FOUND, "Segment not found or expired").into_response())
        }
    }
}

async fn status(
    Path(id): Path<String>,
    State(state): State<ServerState>,
) -> Result<Response, RelayError> {
    check_id(&state, &id)?;
    Ok(Json(state.session.status()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (RelayError::SessionNotFound("x".into()), StatusCode::NOT_FOUND),
            (RelayError::InvalidMode("bogus".into()), StatusCode::CONFLICT),
            (
                RelayError::PortExhausted {
                    start: 1,
                    end: 2,
                    attempts: 2,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RelayError::UpstreamUnauthorized { status: 401 },
                StatusCode::BAD_GATEWAY,
            ),
            (
                RelayError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
