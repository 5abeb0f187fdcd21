use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ExitReport, OUTPUT_PLAYLIST};
use crate::buffer::RingBuffer;
use crate::hls::SegmentStore;

/// Ring buffer -> transcoder stdin. Dropping stdin on EOF lets the
/// transcoder flush and exit.
pub(super) async fn feed_stdin(
    mut stdin: ChildStdin,
    input: Arc<RingBuffer>,
    read_chunk: usize,
    cancel: CancellationToken,
) {
    let mut fed: u64 = 0;
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = input.read_chunk(read_chunk) => chunk,
        };
        let Some(chunk) = chunk else {
            debug!(bytes = fed, "Transcoder input reached EOF");
            break;
        };
        let write = tokio::select! {
            () = cancel.cancelled() => break,
            write = stdin.write_all(&chunk) => write,
        };
        if let Err(e) = write {
            debug!(bytes = fed, "Transcoder stdin closed: {e}");
            break;
        }
        fed += chunk.len() as u64;
    }
    let _ = stdin.shutdown().await;
}

/// Transcoder stdout -> output ring buffer.
pub(super) async fn drain_stdout(
    mut stdout: ChildStdout,
    output: Arc<RingBuffer>,
    read_chunk: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; read_chunk.max(1)];
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = stdout.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let write = tokio::select! {
                    () = cancel.cancelled() => break,
                    write = output.write_all(&buf[..n]) => write,
                };
                if write.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed reading transcoder output: {e}");
                break;
            }
        }
    }
}

/// Forward transcoder diagnostics to the log.
pub(super) async fn log_stderr(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if !line.trim().is_empty() => debug!(target: "iptvrelay::transcoder", "{line}"),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

/// Poll the transcoder's playlist and move finished segments into `store`.
/// A final scan runs after the process exits so the tail is not lost.
pub(super) async fn ingest_segments(
    dir: PathBuf,
    store: Arc<SegmentStore>,
    interval: Duration,
    mut exit: watch::Receiver<Option<ExitReport>>,
    cancel: CancellationToken,
) {
    let mut next_sequence: Option<u64> = None;
    loop {
        // A dropped sender also means the process is gone.
        let signalled = tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => false,
            _ = exit.wait_for(Option::is_some) => true,
        };
        let exited = signalled || exit.borrow().is_some();
        ingest_once(&dir, &store, &mut next_sequence).await;
        if exited {
            break;
        }
    }
}

async fn ingest_once(dir: &Path, store: &SegmentStore, next_sequence: &mut Option<u64>) {
    let text = match tokio::fs::read_to_string(dir.join(OUTPUT_PLAYLIST)).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Failed to read transcoder playlist: {e}");
            return;
        }
    };
    let playlist = parse_media_playlist(&text);

    for (offset, entry) in playlist.entries.iter().enumerate() {
        let sequence = playlist.media_sequence + offset as u64;
        if next_sequence.is_some_and(|next| sequence < next) {
            continue;
        }
        let path = dir.join(&entry.uri);
        // Numbers are only handed out for segments that were actually read.
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let bytes = data.len();
                let stored = store.push(entry.duration, Bytes::from(data));
                trace!(sequence = stored, bytes, "Segment ready");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    trace!("Could not remove ingested segment: {e}");
                }
            }
            Err(e) => {
                // Rotated away before it was read.
                debug!(uri = %entry.uri, "Skipping unreadable segment: {e}");
            }
        }
        *next_sequence = Some(sequence + 1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub duration: Duration,
    pub uri: String,
}

/// The subset of a media playlist needed to follow a segmenter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub entries: Vec<PlaylistEntry>,
    pub ended: bool,
}

#[must_use]
pub fn parse_media_playlist(text: &str) -> MediaPlaylist {
    let mut playlist = MediaPlaylist::default();
    let mut pending_duration: Option<Duration> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let seconds = value
                .split(',')
                .next()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(0.0);
            pending_duration = Some(Duration::from_secs_f64(seconds));
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if !line.starts_with('#') {
            if let Some(duration) = pending_duration.take() {
                playlist.entries.push(PlaylistEntry {
                    duration,
                    uri: line.to_string(),
                });
            }
        }
    }
    playlist
}
