//! Relay sessions and their registry.

mod manager;
mod port;
mod request;
mod state;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::RingBuffer;
use crate::error::{RelayError, SessionError};
use crate::firewall::FirewallManager;
use crate::hls::SegmentStore;

pub use manager::{SessionManager, SessionManagerBuilder};
pub use port::{PortAllocator, PortLease};
pub use request::{RelayMode, SessionKind, SessionRequest, Target};
pub use state::{SessionState, StateCell};

/// Snapshot of a session for callers and the `/status` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: String,
    pub url: String,
    pub local_url: String,
    /// `None` until the classifier decided.
    pub mode: Option<RelayMode>,
    pub kind: SessionKind,
    pub target: Target,
    pub state: SessionState,
    pub last_error: Option<String>,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub idle_seconds: u64,
    pub active_readers: usize,
    pub bytes_received: u64,
    pub bytes_served: u64,
    pub restarts: u32,
    pub ready_segments: usize,
}

/// One relay instance. Owned by the registry; tasks hold `Arc`s.
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) request: SessionRequest,
    pub(crate) share_key: Option<String>,
    pub(crate) port: u16,
    /// `http://host:port/{id}`
    base_url: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: StateCell,
    mode: watch::Sender<Option<RelayMode>>,
    upstream_content_type: Mutex<Option<String>>,
    error: Mutex<Option<SessionError>>,
    last_activity: Mutex<Instant>,
    active_readers: AtomicUsize,
    bytes_served: AtomicU64,
    restarts: AtomicU32,
    pub(crate) cancel: CancellationToken,
    /// Upstream bytes.
    pub(crate) input: Arc<RingBuffer>,
    /// Re-encoded bytes, audio transcode only.
    output: OnceLock<Arc<RingBuffer>>,
    output_capacity: usize,
    pub(crate) segments: Arc<SegmentStore>,
    reader: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lease: Mutex<Option<PortLease>>,
    firewall: Arc<dyn FirewallManager>,
    firewall_open: AtomicBool,
    closed: OnceCell<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("state", &self.state.get())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

pub(crate) struct SessionParts {
    pub id: String,
    pub request: SessionRequest,
    pub share_key: Option<String>,
    pub lease: PortLease,
    pub advertise_host: String,
    pub input: RingBuffer,
    pub output_capacity: usize,
    pub segments: SegmentStore,
    pub firewall: Arc<dyn FirewallManager>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let port = parts.lease.port();
        let (mode, _) = watch::channel(None);
        Self {
            base_url: format!("http://{}:{port}/{}", parts.advertise_host, parts.id),
            id: parts.id,
            request: parts.request,
            share_key: parts.share_key,
            port,
            created_at: Utc::now(),
            state: StateCell::new(),
            mode,
            upstream_content_type: Mutex::new(None),
            error: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            active_readers: AtomicUsize::new(0),
            bytes_served: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            input: Arc::new(parts.input),
            output: OnceLock::new(),
            output_capacity: parts.output_capacity,
            segments: Arc::new(parts.segments),
            reader: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            lease: Mutex::new(Some(parts.lease)),
            firewall: parts.firewall,
            firewall_open: AtomicBool::new(false),
            closed: OnceCell::new(),
        }
    }

    pub(crate) fn stream_url(&self) -> String {
        format!("{}/stream", self.base_url)
    }

    pub(crate) fn manifest_url(&self) -> String {
        format!("{}/stream.m3u8", self.base_url)
    }

    /// What the caller should hand to a player. Forced HLS sessions point
    /// straight at the manifest, everything else at the mode-agnostic entry.
    pub(crate) fn local_url(&self) -> String {
        if self.request.mode == Some(RelayMode::VideoTranscode) {
            self.manifest_url()
        } else {
            self.stream_url()
        }
    }

    pub(crate) fn mode(&self) -> Option<RelayMode> {
        *self.mode.borrow()
    }

    /// Record the mode. The first decision sticks.
    pub(crate) fn set_mode(&self, mode: RelayMode) -> RelayMode {
        if mode == RelayMode::AudioTranscode {
            let _ = self
                .output
                .get_or_init(|| Arc::new(RingBuffer::new(self.output_capacity, 0)));
        }
        self.mode.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });
        self.mode().unwrap_or(mode)
    }

    /// Wait for the mode decision. `None` on timeout or teardown.
    pub(crate) async fn wait_mode(&self, timeout: Duration) -> Option<RelayMode> {
        let mut rx = self.mode.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => None,
            decided = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)) => {
                decided.ok()?.ok().and_then(|mode| *mode)
            }
        }
    }

    pub(crate) fn output(&self) -> Option<Arc<RingBuffer>> {
        self.output.get().cloned()
    }

    /// The ring a downstream byte stream drains, `None` for HLS sessions.
    pub(crate) fn stream_source(&self) -> Option<Arc<RingBuffer>> {
        match self.mode()? {
            RelayMode::VideoTranscode => None,
            RelayMode::AudioTranscode => self.output(),
            RelayMode::VideoPassthrough | RelayMode::AudioPassthrough => {
                Some(Arc::clone(&self.input))
            }
        }
    }

    pub(crate) fn set_upstream_content_type(&self, content_type: Option<String>) {
        *self.upstream_content_type.lock() = content_type;
    }

    pub(crate) fn upstream_content_type(&self) -> Option<String> {
        self.upstream_content_type.lock().clone()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub(crate) fn active_readers(&self) -> usize {
        self.active_readers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_served(&self, bytes: usize) {
        self.bytes_served.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a downstream byte-stream reader, preempting the previous
    /// one. The returned token fires when this reader is preempted or the
    /// session goes away.
    ///
    /// Chunks already queued toward the preempted client go down with its
    /// response. The new reader picks up at the ring's read position, so a
    /// takeover skips at most one response channel's worth of data.
    pub(crate) fn claim_reader(self: &Arc<Self>) -> (CancellationToken, ReaderGuard) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.reader.lock().replace(token.clone()) {
            debug!(session_id = %self.id, "Preempting previous reader");
            previous.cancel();
        }
        (token, ReaderGuard::new(Arc::clone(self)))
    }

    pub(crate) fn push_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn last_error(&self) -> Option<SessionError> {
        self.error.lock().clone()
    }

    /// Move to `Error`, keep the structured error for the caller, and drop
    /// everything the session holds. The record stays in the registry until
    /// closed or reaped.
    pub(crate) fn fail(&self, error: RelayError) {
        let state = self.state.get();
        if state.is_terminal() {
            return;
        }
        let failure = SessionError {
            session_id: self.id.clone(),
            state,
            error,
        };
        error!(session_id = %self.id, "{failure}");
        *self.error.lock() = Some(failure);
        self.state.transition(SessionState::Error);
        self.release();
    }

    pub(crate) fn expose_firewall(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            match session.firewall.expose(session.port).await {
                Ok(()) => {
                    debug!(port = session.port, "Firewall rule added");
                    session.firewall_open.store(true, Ordering::SeqCst);
                    if session.cancel.is_cancelled() {
                        session.revoke_firewall();
                    }
                }
                Err(e) => warn!(port = session.port, "Could not expose session port: {e}"),
            }
        });
    }

    fn revoke_firewall(&self) {
        if !self.firewall_open.swap(false, Ordering::SeqCst) {
            return;
        }
        let firewall = Arc::clone(&self.firewall);
        let port = self.port;
        tokio::spawn(async move {
            if let Err(e) = firewall.revoke(port).await {
                warn!(port, "Could not remove firewall rule: {e}");
            }
        });
    }

    /// Stop every pump and free buffers, segments, port and firewall rule.
    /// Transcoder processes belong to the supervisor task, which exits on
    /// the cancellation.
    fn release(&self) {
        self.cancel.cancel();
        self.input.abort();
        if let Some(output) = self.output.get() {
            output.abort();
        }
        self.segments.clear();
        self.revoke_firewall();
        if self.lease.lock().take().is_some() {
            debug!(session_id = %self.id, port = self.port, "Session port released");
        }
    }

    /// Tear the session down. Concurrent and repeated calls all wait for the
    /// same single teardown.
    pub(crate) async fn close(&self, timeout: Duration) {
        self.closed
            .get_or_init(|| async {
                if !self.state.get().is_terminal() {
                    self.state.transition(SessionState::Ended);
                }
                self.cancel.cancel();

                let deadline = Instant::now() + timeout;
                let tasks = std::mem::take(&mut *self.tasks.lock());
                for mut task in tasks {
                    if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                        warn!(session_id = %self.id, "Session task did not stop in time, aborting");
                        task.abort();
                    }
                }

                self.release();
                info!(session_id = %self.id, "Session closed");
            })
            .await;
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id.clone(),
            url: self.request.url.clone(),
            local_url: self.local_url(),
            mode: self.mode(),
            kind: self.request.kind,
            target: self.request.target,
            state: self.state.get(),
            last_error: self.last_error().map(|e| e.error.to_string()),
            port: self.port,
            created_at: self.created_at,
            idle_seconds: self.last_activity().elapsed().as_secs(),
            active_readers: self.active_readers(),
            bytes_received: self.input.total_written(),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::SeqCst),
            ready_segments: self.segments.ready_count(),
        }
    }
}

/// Counts a downstream reader for as long as it lives.
pub(crate) struct ReaderGuard {
    session: Arc<Session>,
}

impl ReaderGuard {
    fn new(session: Arc<Session>) -> Self {
        session.active_readers.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let result = self
            .session
            .active_readers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if result.is_err() {
            warn!("Attempted to decrement reader count below zero");
        }
        self.session.touch();
        debug!(session_id = %self.session.id, "{}", RelayError::ClientDisconnected);
    }
}

/// Caller's handle on an open session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub(crate) const fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.session.id
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.session.port
    }

    /// URL a player or cast receiver opens.
    #[must_use]
    pub fn local_url(&self) -> String {
        self.session.local_url()
    }

    #[must_use]
    pub fn stream_url(&self) -> String {
        self.session.stream_url()
    }

    #[must_use]
    pub fn manifest_url(&self) -> String {
        self.session.manifest_url()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state.get()
    }

    #[must_use]
    pub fn mode(&self) -> Option<RelayMode> {
        self.session.mode()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.state.subscribe()
    }

    /// Resolve once the session ends. `Error` sessions yield their
    /// structured error.
    pub async fn wait_terminal(&self) -> Result<SessionState, SessionError> {
        let mut rx = self.session.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.session.state.get(),
        };
        if state == SessionState::Error {
            return Err(self.session.last_error().unwrap_or_else(|| SessionError {
                session_id: self.session.id.clone(),
                state,
                error: RelayError::Internal("session failed without a recorded error".into()),
            }));
        }
        Ok(state)
    }
}
