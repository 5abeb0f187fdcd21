use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use iptvrelay_core::Config;
use parking_lot::Mutex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    PortAllocator, RelayMode, Session, SessionHandle, SessionParts, SessionRequest, SessionStatus,
};
use crate::buffer::RingBuffer;
use crate::classify::Classifier;
use crate::continuity::{RestartBudget, Supervisor, SupervisorOptions};
use crate::error::{RelayError, RelayResult};
use crate::firewall::{self, FirewallManager};
use crate::hls::{BootstrapSource, SegmentStore};
use crate::net;
use crate::server;
use crate::transcode::{FfmpegLauncher, TranscoderLauncher};
use crate::upstream::UpstreamConnector;

/// Length of generated session ids. Ids are URL path components.
const SESSION_ID_LEN: usize = 12;

/// Owns every session in the process: the registry, the shared port
/// allocator and the collaborators sessions are built from.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    sessions: DashMap<String, Arc<Session>>,
    /// Share key to session id, for [`SessionManager::open_shared`].
    shared: DashMap<String, String>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    ports: Arc<PortAllocator>,
    client: Client,
    classifier: Classifier,
    launcher: Arc<dyn TranscoderLauncher>,
    bootstrap: Arc<BootstrapSource>,
    firewall: Arc<dyn FirewallManager>,
    advertise_host: String,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.sessions.len())
            .field("advertise_host", &self.inner.advertise_host)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionManager`]. Collaborators not set explicitly are
/// derived from the config.
#[must_use]
pub struct SessionManagerBuilder {
    config: Config,
    client: Option<Client>,
    launcher: Option<Arc<dyn TranscoderLauncher>>,
    bootstrap: Option<Arc<BootstrapSource>>,
    firewall: Option<Arc<dyn FirewallManager>>,
    advertise_host: Option<String>,
}

impl SessionManagerBuilder {
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn TranscoderLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn bootstrap(mut self, bootstrap: BootstrapSource) -> Self {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    pub fn firewall(mut self, firewall: Arc<dyn FirewallManager>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn build(self) -> RelayResult<SessionManager> {
        let config = self.config;
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .connect_timeout(config.relay.connect_timeout())
                .build()
                .map_err(|e| RelayError::Internal(format!("HTTP client: {e}")))?,
        };
        let launcher: Arc<dyn TranscoderLauncher> = self
            .launcher
            .unwrap_or_else(|| Arc::new(FfmpegLauncher::new(config.transcoder.clone())));
        let bootstrap = self.bootstrap.unwrap_or_else(|| {
            if config.transcoder.enabled {
                Arc::new(BootstrapSource::new(&config.hls, Arc::clone(&launcher)))
            } else {
                Arc::new(BootstrapSource::disabled())
            }
        });
        let firewall = self
            .firewall
            .unwrap_or_else(|| firewall::from_config(&config.firewall));
        let advertise_host = self
            .advertise_host
            .unwrap_or_else(|| net::advertise_host(config.server.advertise_host.as_deref()));

        let ports = PortAllocator::new(
            config.server.bind_host.clone(),
            config.server.port_range_start,
            config.server.port_range_end,
            config.server.port_bind_attempts,
        );
        let classifier = Classifier::new(&config.classifier, config.transcoder.enabled);

        info!(
            advertise_host = %advertise_host,
            ports = %format!("{}-{}", config.server.port_range_start, config.server.port_range_end),
            transcoder = config.transcoder.enabled,
            "Session manager ready"
        );

        Ok(SessionManager {
            inner: Arc::new(ManagerInner {
                config,
                sessions: DashMap::new(),
                shared: DashMap::new(),
                creation_locks: DashMap::new(),
                ports,
                client,
                classifier,
                launcher,
                bootstrap,
                firewall,
                advertise_host,
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        })
    }
}

impl SessionManager {
    pub fn builder(config: Config) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            client: None,
            launcher: None,
            bootstrap: None,
            firewall: None,
            advertise_host: None,
        }
    }

    pub fn new(config: Config) -> RelayResult<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Render the bootstrap segment in the background so the first HLS
    /// session does not wait for it.
    pub fn prewarm_bootstrap(&self) {
        let bootstrap = Arc::clone(&self.inner.bootstrap);
        tokio::spawn(async move {
            if bootstrap.get().await.is_none() {
                debug!("No bootstrap segment available");
            }
        });
    }

    /// Start a new session for `request`.
    ///
    /// Fails with `InvalidMode` when a transcode mode is forced but the
    /// transcoder is disabled, and with `PortExhausted` when no port could be
    /// bound. No session record exists after a failure.
    pub async fn open(&self, request: SessionRequest) -> RelayResult<SessionHandle> {
        self.open_with_key(request, None).await
    }

    /// Like [`open`](Self::open), but reuse a healthy session already
    /// relaying the same url, mode and kind.
    pub async fn open_shared(&self, request: SessionRequest) -> RelayResult<SessionHandle> {
        let key = share_key(&request);

        if let Some(handle) = self.find_shared(&key) {
            debug!(session_id = %handle.id(), "Reusing shared session");
            return Ok(handle);
        }

        let lock = self
            .inner
            .creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(handle) = self.find_shared(&key) {
            debug!(session_id = %handle.id(), "Reusing session created by concurrent request");
            return Ok(handle);
        }

        let handle = self.open_with_key(request, Some(key.clone())).await;
        match &handle {
            Ok(handle) => {
                self.inner.shared.insert(key, handle.id().to_string());
            }
            // Keep the lock only while other requests are queued on it.
            Err(_) => {
                self.inner
                    .creation_locks
                    .remove_if(&key, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) <= 2);
            }
        }
        handle
    }

    fn find_shared(&self, key: &str) -> Option<SessionHandle> {
        let id = self.inner.shared.get(key)?.value().clone();
        match self.inner.sessions.get(&id) {
            Some(session) if !session.state.get().is_terminal() => {
                session.touch();
                Some(SessionHandle::new(Arc::clone(session.value())))
            }
            _ => {
                self.inner.shared.remove_if(key, |_, v| *v == id);
                None
            }
        }
    }

    async fn open_with_key(
        &self,
        request: SessionRequest,
        share_key: Option<String>,
    ) -> RelayResult<SessionHandle> {
        let inner = &self.inner;
        let config = &inner.config;

        validate_url(&request.url)?;
        if let Some(mode) = request.mode {
            if mode.is_transcode() && !config.transcoder.enabled {
                return Err(RelayError::InvalidMode(format!(
                    "{mode} requested but the transcoder is disabled"
                )));
            }
        }

        let (lease, listener) = inner.ports.allocate().await?;
        let id = nanoid::nanoid!(SESSION_ID_LEN);
        let session = Arc::new(Session::new(SessionParts {
            id: id.clone(),
            request,
            share_key,
            lease,
            advertise_host: inner.advertise_host.clone(),
            input: RingBuffer::new(config.relay.ring_buffer_bytes, config.relay.prebuffer_bytes),
            output_capacity: config.relay.ring_buffer_bytes,
            segments: SegmentStore::new(
                config.hls.window_segments,
                Duration::from_secs(u64::from(config.transcoder.segment_seconds)),
            ),
            firewall: Arc::clone(&inner.firewall),
        }));
        inner.sessions.insert(id.clone(), Arc::clone(&session));

        let span = info_span!("session", session_id = %id, port = session.port);
        info!(
            parent: &span,
            url = %session.request.url,
            mode = ?session.request.mode,
            kind = ?session.request.kind,
            target = ?session.request.target,
            "Opening session"
        );

        let ready_timeout = config.relay.probe_timeout();
        session.push_task(tokio::spawn(
            server::serve(
                listener,
                Arc::clone(&session),
                config.relay.read_chunk_bytes,
                ready_timeout,
            )
            .instrument(span.clone()),
        ));

        let supervisor = Supervisor::new(
            Arc::clone(&session),
            UpstreamConnector::new(
                inner.client.clone(),
                session.request.url.clone(),
                &session.request.headers,
                &config.relay.default_user_agent,
                config.relay.connect_timeout(),
                config.relay.stall_timeout(),
            ),
            inner.classifier.clone(),
            Arc::clone(&inner.launcher),
            Arc::clone(&inner.bootstrap),
            RestartBudget::from_config(&config.continuity),
            SupervisorOptions {
                sniff_bytes: config.relay.sniff_bytes,
                probe_timeout: config.relay.probe_timeout(),
                stop_grace: config.transcoder.stop_grace(),
                segment_seconds: config.transcoder.segment_seconds,
                poll_interval: config.transcoder.poll_interval(),
                read_chunk_bytes: config.relay.read_chunk_bytes,
            },
        );
        session.push_task(tokio::spawn(supervisor.run().instrument(span)));

        session.expose_firewall();
        Ok(SessionHandle::new(session))
    }

    /// Tear a session down and forget it. Closing an unknown or already
    /// closed id is a no-op.
    pub async fn close(&self, id: &str) -> RelayResult<()> {
        let Some(session) = self.inner.sessions.get(id).map(|s| Arc::clone(s.value())) else {
            debug!(session_id = %id, "Close on unknown session");
            return Ok(());
        };

        session.close(self.inner.config.relay.close_timeout()).await;
        self.inner
            .sessions
            .remove_if(id, |_, s| Arc::ptr_eq(s, &session));
        if let Some(key) = &session.share_key {
            self.inner.shared.remove_if(key, |_, v| v == id);
            self.inner.creation_locks.remove(key);
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .get(id)
            .map(|s| SessionHandle::new(Arc::clone(s.value())))
    }

    #[must_use]
    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.inner.sessions.get(id).map(|s| s.status())
    }

    #[must_use]
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Ports currently leased to sessions.
    #[must_use]
    pub fn ports_in_use(&self) -> usize {
        self.inner.ports.in_use()
    }

    /// Close every session nobody has read from for the idle timeout.
    /// Returns the closed ids.
    pub async fn reap_idle_sessions(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.inner.config.relay.idle_timeout();
        let idle: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.active_readers() == 0
                    && now.saturating_duration_since(session.last_activity()) >= idle_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &idle {
            info!(session_id = %id, "Closing idle session");
            if let Err(e) = self.close(id).await {
                warn!(session_id = %id, "Failed to close idle session: {e}");
            }
        }
        idle
    }

    /// Run [`reap_idle_sessions`](Self::reap_idle_sessions) periodically
    /// until [`shutdown`](Self::shutdown).
    pub fn start_idle_reaper(&self) {
        let mut slot = self.inner.reaper.lock();
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let check_interval = self.inner.config.relay.idle_check_interval();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let closed = manager.reap_idle_sessions(Instant::now()).await;
                        if !closed.is_empty() {
                            debug!("Reaped {} idle sessions", closed.len());
                        }
                    }
                }
            }
        }));
    }

    /// Stop the reaper and close every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                warn!("Idle reaper ended abnormally: {e}");
            }
        }

        let ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!("Shutting down {} sessions", ids.len());
        let closes = ids.iter().map(|id| self.close(id));
        for result in futures::future::join_all(closes).await {
            if let Err(e) = result {
                warn!("Failed to close session during shutdown: {e}");
            }
        }
    }
}

/// Stable digest of the fields that make two requests the same relay.
fn share_key(request: &SessionRequest) -> String {
    let mode = request.mode.map_or("auto", RelayMode::as_str);
    let mut hasher = Sha256::new();
    hasher.update(request.url.as_bytes());
    hasher.update(b"|");
    hasher.update(mode.as_bytes());
    hasher.update(b"|");
    hasher.update(request.kind.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_url(raw: &str) -> RelayResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| RelayError::UnsupportedSource(format!("invalid url {raw}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(RelayError::UnsupportedSource(format!(
            "unsupported scheme {other}"
        ))),
    }
}
