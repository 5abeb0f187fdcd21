//! End-to-end session tests against a wiremock upstream.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iptvrelay_core::Config;
use iptvrelay_stream::firewall::NoopFirewall;
use iptvrelay_stream::{
    BootstrapSegment, BootstrapSource, RelayError, RelayMode, SessionKind, SessionManager,
    SessionRequest, SessionState, TranscodeJob, TranscoderLauncher,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn test_config() -> Config {
    let start = free_port().await;
    let mut config = Config::default();
    config.server.bind_host = "127.0.0.1".to_string();
    config.server.port_range_start = start;
    config.server.port_range_end = start.saturating_add(40);
    config.relay.ring_buffer_bytes = 128 * 1024;
    config.relay.prebuffer_bytes = 1024;
    config.relay.read_chunk_bytes = 16 * 1024;
    config.relay.connect_timeout_seconds = 5;
    config.relay.stall_timeout_seconds = 2;
    config.relay.probe_timeout_seconds = 3;
    config.relay.close_timeout_seconds = 5;
    config.transcoder.enabled = false;
    config.transcoder.stop_grace_ms = 300;
    config.transcoder.poll_interval_ms = 20;
    config.continuity.max_restarts = 100;
    config.continuity.backoff_initial_ms = 5;
    config.continuity.backoff_max_ms = 20;
    config.firewall.enabled = false;
    config
}

fn manager(config: Config) -> SessionManager {
    SessionManager::builder(config)
        .advertise_host("127.0.0.1")
        .firewall(Arc::new(NoopFirewall))
        .build()
        .unwrap()
}

/// 188-byte MPEG-TS packets with a counter payload.
fn ts_body(packets: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(packets * 188);
    for i in 0..packets {
        body.push(0x47);
        body.extend((1..188).map(|j| ((i + j) % 251) as u8));
    }
    body
}

async fn mount_body(server: &MockServer, route: &str, content_type: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).to_ascii_lowercase()
}

async fn write_ok_head(stream: &mut TcpStream, extra: &str) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: video/mp2t\r\nconnection: close\r\n{extra}\r\n"
    );
    stream.write_all(head.as_bytes()).await
}

/// Hand-written HTTP upstream for bodies wiremock cannot shape: ones that
/// hang, drip or get cut off. `serve` gets the connection index, the
/// lowercased request head and the socket.
async fn raw_upstream<F, Fut>(serve: F) -> String
where
    F: Fn(usize, String, TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            let head = read_request_head(&mut stream).await;
            tokio::spawn(serve(index, head, stream));
            index += 1;
        }
    });
    format!("http://{addr}/channel.ts")
}

/// Sends a few packets, then holds the connection open without data.
async fn hanging_upstream(connections: Arc<AtomicUsize>) -> String {
    raw_upstream(move |_, _, mut stream| {
        connections.fetch_add(1, Ordering::SeqCst);
        async move {
            if write_ok_head(&mut stream, "").await.is_ok() {
                let _ = stream.write_all(&ts_body(20)).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    })
    .await
}

#[tokio::test]
async fn test_live_passthrough_survives_false_eof() {
    let upstream = MockServer::start().await;
    let body = ts_body(300);
    mount_body(&upstream, "/live.ts", "video/mp2t", body.clone()).await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(
            SessionRequest::new(format!("{}/live.ts", upstream.uri()))
                .with_mode(RelayMode::VideoPassthrough),
        )
        .await
        .unwrap();

    let mut response = reqwest::get(handle.local_url()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "video/mp2t"
    );

    let wanted = body.len() * 3;
    let mut received = Vec::with_capacity(wanted);
    while received.len() < wanted {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("downstream stalled")
            .unwrap()
            .expect("downstream closed");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(&received[..wanted], body.repeat(3).as_slice());

    let status = handle.status();
    assert!(status.restarts >= 2);
    assert!(!status.state.is_terminal());

    manager.close(handle.id()).await.unwrap();
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_catch_up_ends_cleanly_on_eof() {
    let upstream = MockServer::start().await;
    let body = ts_body(50);
    mount_body(&upstream, "/vod.ts", "video/mp2t", body.clone()).await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(
            SessionRequest::new(format!("{}/vod.ts", upstream.uri()))
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();

    let response = reqwest::get(handle.local_url()).await.unwrap();
    let received = response.bytes().await.unwrap();
    assert_eq!(received.as_ref(), body.as_slice());

    assert_eq!(handle.wait_terminal().await.unwrap(), SessionState::Ended);
    assert_eq!(handle.mode(), Some(RelayMode::VideoPassthrough));
    assert_eq!(handle.status().restarts, 0);
    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_ambiguous_content_type_with_ts_sync_is_video() {
    let upstream = MockServer::start().await;
    mount_body(
        &upstream,
        "/play",
        "application/octet-stream",
        ts_body(40),
    )
    .await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(
            SessionRequest::new(format!("{}/play", upstream.uri()))
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();

    assert!(wait_until(|| handle.mode().is_some()).await);
    assert_eq!(handle.mode(), Some(RelayMode::VideoPassthrough));
    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_unauthorized_upstream_surfaces_session_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&upstream)
        .await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(SessionRequest::new(format!("{}/secret", upstream.uri())))
        .await
        .unwrap();

    let err = handle.wait_terminal().await.unwrap_err();
    assert_eq!(err.session_id, handle.id());
    assert_eq!(err.state, SessionState::Starting);
    assert_eq!(err.error, RelayError::UpstreamUnauthorized { status: 401 });

    // The record stays for inspection, the port does not.
    let status = manager.status(handle.id()).unwrap();
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_error.unwrap().contains("401"));
    assert!(wait_until(|| manager.ports_in_use() == 0).await);

    manager.close(handle.id()).await.unwrap();
    assert!(manager.status(handle.id()).is_none());
}

#[tokio::test]
async fn test_port_exhaustion_creates_no_session() {
    let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let mut config = test_config().await;
    config.server.port_range_start = port;
    config.server.port_range_end = port;
    let manager = manager(config);

    let err = manager
        .open(SessionRequest::new("http://127.0.0.1:9/none"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::PortExhausted { .. }));
    assert!(manager.is_empty());
    assert_eq!(manager.ports_in_use(), 0);
}

#[tokio::test]
async fn test_forced_transcode_without_transcoder_is_invalid() {
    let manager = manager(test_config().await);
    let err = manager
        .open(SessionRequest::new("http://127.0.0.1:9/none").with_mode(RelayMode::VideoTranscode))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidMode(_)));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(100)).await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(SessionRequest::new(format!("{}/live.ts", upstream.uri())))
        .await
        .unwrap();
    let id = handle.id().to_string();

    let (a, b) = tokio::join!(manager.close(&id), manager.close(&id));
    assert!(a.is_ok() && b.is_ok());
    assert!(manager.close(&id).await.is_ok());

    assert!(manager.status(&id).is_none());
    assert_eq!(manager.ports_in_use(), 0);
    assert_eq!(handle.state(), SessionState::Ended);
    assert!(reqwest::get(handle.local_url()).await.is_err());
}

#[tokio::test]
async fn test_open_shared_reuses_healthy_session() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(100)).await;
    let url = format!("{}/live.ts", upstream.uri());

    let manager = manager(test_config().await);
    let (a, b) = tokio::join!(
        manager.open_shared(SessionRequest::new(url.clone())),
        manager.open_shared(SessionRequest::new(url.clone())),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id(), b.id());
    assert_eq!(manager.len(), 1);

    let other = manager
        .open_shared(SessionRequest::new(url).with_kind(SessionKind::CatchUp))
        .await
        .unwrap();
    assert_ne!(other.id(), a.id());

    manager.shutdown().await;
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(100)).await;

    let config = test_config().await;
    let idle_timeout = config.relay.idle_timeout();
    let manager = manager(config);
    let handle = manager
        .open(SessionRequest::new(format!("{}/live.ts", upstream.uri())))
        .await
        .unwrap();

    assert!(manager.reap_idle_sessions(Instant::now()).await.is_empty());

    let later = Instant::now() + idle_timeout + Duration::from_secs(1);
    let reaped = manager.reap_idle_sessions(later).await;
    assert_eq!(reaped, vec![handle.id().to_string()]);
    assert!(manager.is_empty());
    assert_eq!(manager.ports_in_use(), 0);
}

#[tokio::test]
async fn test_new_reader_preempts_previous() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(2000)).await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(
            SessionRequest::new(format!("{}/live.ts", upstream.uri()))
                .with_mode(RelayMode::VideoPassthrough),
        )
        .await
        .unwrap();

    let mut first = reqwest::get(handle.local_url()).await.unwrap();
    assert!(first.chunk().await.unwrap().is_some());

    let mut second = reqwest::get(handle.local_url()).await.unwrap();
    assert!(second.chunk().await.unwrap().is_some());

    // The first body ends once its pump notices the preemption.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.chunk().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_status_route_reports_session() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(100)).await;

    let manager = manager(test_config().await);
    let handle = manager
        .open(SessionRequest::new(format!("{}/live.ts", upstream.uri())))
        .await
        .unwrap();

    let url = format!("http://127.0.0.1:{}/{}/status", handle.port(), handle.id());
    let status: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(status["id"], handle.id());
    assert_eq!(status["kind"], "live");

    let missing = format!("http://127.0.0.1:{}/nope/status", handle.port());
    assert_eq!(reqwest::get(&missing).await.unwrap().status(), 404);

    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_live_stall_triggers_restart() {
    let connections = Arc::new(AtomicUsize::new(0));
    let url = hanging_upstream(connections.clone()).await;

    let mut config = test_config().await;
    config.relay.stall_timeout_seconds = 1;
    let manager = manager(config);
    let handle = manager
        .open(SessionRequest::new(url).with_mode(RelayMode::VideoPassthrough))
        .await
        .unwrap();

    assert!(wait_until(|| connections.load(Ordering::SeqCst) >= 2).await);
    assert!(wait_until(|| handle.status().restarts >= 1).await);
    assert!(!handle.state().is_terminal());

    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_catch_up_stall_is_an_error() {
    let connections = Arc::new(AtomicUsize::new(0));
    let url = hanging_upstream(connections.clone()).await;

    let mut config = test_config().await;
    config.relay.stall_timeout_seconds = 1;
    let manager = manager(config);
    let handle = manager
        .open(
            SessionRequest::new(url)
                .with_mode(RelayMode::VideoPassthrough)
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), handle.wait_terminal())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err.error, RelayError::UpstreamUnreachable(_)));
    assert!(err.error.to_string().contains("no data"));
    assert_eq!(handle.status().state, SessionState::Error);
    assert_eq!(handle.status().restarts, 0);
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    manager.close(handle.id()).await.unwrap();
}

#[tokio::test]
async fn test_resume_ignoring_range_does_not_repeat_bytes() {
    let body = Arc::new(ts_body(200));
    let cut = 188 * 10;
    let heads = Arc::new(Mutex::new(Vec::new()));

    let url = {
        let body = body.clone();
        let heads = heads.clone();
        raw_upstream(move |index, head, mut stream| {
            heads.lock().push(head);
            let body = body.clone();
            async move {
                let extra = format!("content-length: {}\r\naccept-ranges: bytes\r\n", body.len());
                if write_ok_head(&mut stream, &extra).await.is_err() {
                    return;
                }
                // The first connection drops mid-body; later ones send the
                // whole resource even when a range was asked for.
                let part = if index == 0 { &body[..cut] } else { &body[..] };
                let _ = stream.write_all(part).await;
                let _ = stream.flush().await;
            }
        })
        .await
    };

    let manager = manager(test_config().await);
    let handle = manager
        .open(SessionRequest::new(url).with_mode(RelayMode::VideoPassthrough))
        .await
        .unwrap();

    let mut response = reqwest::get(handle.local_url()).await.unwrap();
    let mut received = Vec::with_capacity(body.len());
    while received.len() < body.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("downstream stalled")
            .unwrap()
            .expect("downstream closed");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(&received[..body.len()], body.as_slice());

    let heads = heads.lock().clone();
    assert!(heads.len() >= 2);
    assert!(!heads[0].contains("range:"));
    assert!(heads[1].contains(&format!("range: bytes={cut}-")));

    manager.close(handle.id()).await.unwrap();
}

/// Runs a shell script as the transcoder; `$1` is the output directory.
#[cfg(unix)]
#[derive(Debug)]
struct ShellLauncher(&'static str);

#[cfg(unix)]
impl TranscoderLauncher for ShellLauncher {
    fn command(&self, job: &TranscodeJob) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(self.0).arg("sh").arg(&job.output_dir);
        command
    }
}

#[cfg(unix)]
fn transcoding_manager(config: Config, script: &'static str) -> SessionManager {
    SessionManager::builder(config)
        .advertise_host("127.0.0.1")
        .firewall(Arc::new(NoopFirewall))
        .launcher(Arc::new(ShellLauncher(script)))
        .bootstrap(BootstrapSource::fixed(BootstrapSegment {
            data: bytes::Bytes::from_static(b"BOOTSTRAP"),
            duration: Duration::from_secs(1),
        }))
        .build()
        .unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn test_bootstrap_segment_served_before_first_real_segment() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/live.ts", "video/mp2t", ts_body(500)).await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    // A transcoder that never produces a segment.
    let manager = transcoding_manager(config, "cat > /dev/null");

    let handle = manager
        .open(
            SessionRequest::new(format!("{}/live.ts", upstream.uri()))
                .with_mode(RelayMode::VideoTranscode)
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();
    assert!(handle.local_url().ends_with("/stream.m3u8"));

    let started = Instant::now();
    let manifest = tokio::time::timeout(Duration::from_millis(1500), async {
        reqwest::get(handle.local_url()).await?.text().await
    })
    .await
    .expect("manifest not served in time")
    .unwrap();
    assert!(started.elapsed() <= Duration::from_millis(1500));
    assert!(manifest.contains("#EXTINF:1.000,"));
    assert!(manifest.contains("segments/0.ts"));

    let segment_url = format!(
        "http://127.0.0.1:{}/{}/segments/0.ts",
        handle.port(),
        handle.id()
    );
    let segment = reqwest::get(&segment_url).await.unwrap();
    assert_eq!(segment.headers()["content-type"].to_str().unwrap(), "video/mp2t");
    assert_eq!(segment.bytes().await.unwrap().as_ref(), b"BOOTSTRAP");

    // The mode-agnostic entry redirects to the manifest.
    let no_redirect = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let entry = no_redirect.get(handle.stream_url()).send().await.unwrap();
    assert_eq!(entry.status(), 302);

    manager.close(handle.id()).await.unwrap();
    assert_eq!(manager.ports_in_use(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_first_real_segment_follows_discontinuity() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/vod.ts", "video/mp2t", ts_body(100)).await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    let script = r#"
        cat > /dev/null
        printf 'REAL' > "$1/seg_0.ts"
        printf '#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.0,\nseg_0.ts\n' > "$1/stream.m3u8"
    "#;
    let manager = transcoding_manager(config, script);

    let handle = manager
        .open(
            SessionRequest::new(format!("{}/vod.ts", upstream.uri()))
                .with_mode(RelayMode::VideoTranscode)
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();
    assert_eq!(handle.wait_terminal().await.unwrap(), SessionState::Ended);

    let manifest = reqwest::get(handle.manifest_url())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let bootstrap_at = manifest.find("segments/0.ts").unwrap();
    let discontinuity_at = manifest.find("#EXT-X-DISCONTINUITY\n").unwrap();
    let real_at = manifest.find("segments/1.ts").unwrap();
    assert!(bootstrap_at < discontinuity_at && discontinuity_at < real_at);
    assert!(manifest.ends_with("#EXT-X-ENDLIST\n"));

    manager.close(handle.id()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_live_transcoder_crashes_exhaust_budget() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/radio", "audio/aac", vec![0u8; 4096]).await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    config.continuity.max_restarts = 3;
    let manager = transcoding_manager(config, "exit 1");

    let handle = manager
        .open(
            SessionRequest::new(format!("{}/radio", upstream.uri()))
                .with_mode(RelayMode::AudioTranscode),
        )
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), handle.wait_terminal())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err.error,
        RelayError::RestartBudgetExceeded {
            restarts: 3,
            window_secs: 30
        }
    );
    assert_eq!(handle.status().restarts, 3);

    manager.close(handle.id()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_catch_up_transcoder_exit_ends_session() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/show", "audio/aac", vec![0u8; 4096]).await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    let manager = transcoding_manager(config, "exit 1");

    let handle = manager
        .open(
            SessionRequest::new(format!("{}/show", upstream.uri()))
                .with_mode(RelayMode::AudioTranscode)
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();

    let state = tokio::time::timeout(Duration::from_secs(10), handle.wait_terminal())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SessionState::Ended);
    manager.close(handle.id()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_audio_transcode_streams_transcoder_output() {
    let upstream = MockServer::start().await;
    mount_body(&upstream, "/show.aac", "audio/aac", b"source-bytes".to_vec()).await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    config.relay.prebuffer_bytes = 0;
    let manager = transcoding_manager(config, "tr 'a-z' 'A-Z'");

    let handle = manager
        .open(
            SessionRequest::new(format!("{}/show.aac", upstream.uri()))
                .with_mode(RelayMode::AudioTranscode)
                .with_kind(SessionKind::CatchUp),
        )
        .await
        .unwrap();

    let response = reqwest::get(handle.local_url()).await.unwrap();
    assert_eq!(response.headers()["content-type"].to_str().unwrap(), "audio/mpeg");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"SOURCE-BYTES");
    assert_eq!(handle.wait_terminal().await.unwrap(), SessionState::Ended);

    manager.close(handle.id()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_live_transcoder_restart_marks_discontinuity() {
    // Drips packets until the relay hangs up.
    let url = raw_upstream(|_, _, mut stream| async move {
        if write_ok_head(&mut stream, "").await.is_err() {
            return;
        }
        let packet = ts_body(1);
        while stream.write_all(&packet).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    let mut config = test_config().await;
    config.transcoder.enabled = true;
    // Every run publishes one segment, then crashes.
    let script = r#"
        printf 'RUN' > "$1/seg_0.ts"
        printf '#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.0,\nseg_0.ts\n' > "$1/stream.m3u8"
        sleep 0.5
        exit 1
    "#;
    let manager = transcoding_manager(config, script);

    let handle = manager
        .open(SessionRequest::new(url).with_mode(RelayMode::VideoTranscode))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let manifest = loop {
        let manifest = reqwest::get(handle.manifest_url())
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if manifest.contains("segments/2.ts") {
            break manifest;
        }
        assert!(Instant::now() < deadline, "no segment after restart:\n{manifest}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert!(manifest.contains("#EXT-X-DISCONTINUITY\n#EXTINF:2.000,\nsegments/2.ts\n"));
    let sequences: Vec<u64> = manifest
        .lines()
        .filter_map(|line| line.strip_prefix("segments/")?.strip_suffix(".ts")?.parse().ok())
        .collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1), "{sequences:?}");

    let segment_url = format!(
        "http://127.0.0.1:{}/{}/segments/2.ts",
        handle.port(),
        handle.id()
    );
    assert_eq!(reqwest::get(&segment_url).await.unwrap().bytes().await.unwrap().as_ref(), b"RUN");
    assert!(handle.status().restarts >= 1);
    assert!(!handle.state().is_terminal());

    manager.close(handle.id()).await.unwrap();
}
