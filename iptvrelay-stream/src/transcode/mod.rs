//! External transcoder process per transcoding session.
//!
//! The child reads the session's ring buffer on stdin. Video output is
//! written by the transcoder as HLS segments into a private temp directory
//! and ingested into the session's [`SegmentStore`]; audio output is read
//! from stdout into a second ring buffer. Input and output run on separate
//! tasks.

mod ffmpeg;
mod pump;

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::buffer::RingBuffer;
use crate::error::{RelayError, RelayResult};
use crate::hls::SegmentStore;
use crate::session::RelayMode;

pub use ffmpeg::FfmpegLauncher;
pub use pump::{parse_media_playlist, MediaPlaylist, PlaylistEntry};

/// Name of the playlist the transcoder maintains inside `output_dir`.
pub const OUTPUT_PLAYLIST: &str = "stream.m3u8";

const KILL_WAIT: Duration = Duration::from_secs(2);

/// Parameters for one transcoder run.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub mode: RelayMode,
    /// Where segmenting transcoders write `stream.m3u8` and its segments.
    pub output_dir: PathBuf,
    pub segment_seconds: u32,
    pub max_bitrate_kbps: Option<u32>,
}

/// Builds the transcoder command line. The process reads source bytes on
/// stdin; video jobs write HLS into `job.output_dir`, audio jobs write the
/// re-encoded stream to stdout.
pub trait TranscoderLauncher: Send + Sync + fmt::Debug {
    fn command(&self, job: &TranscodeJob) -> Command;

    /// Command that prints a short MPEG-TS warm-up clip on stdout.
    fn bootstrap_command(&self, duration: Duration) -> Option<Command> {
        let _ = duration;
        None
    }
}

/// Per-session transcoder settings.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub mode: RelayMode,
    pub segment_seconds: u32,
    pub max_bitrate_kbps: Option<u32>,
    /// How often the segment directory is scanned.
    pub poll_interval: Duration,
    pub read_chunk_bytes: usize,
}

/// Where a transcoder's output goes.
#[derive(Debug, Clone)]
pub enum TranscodeOutput {
    Segments(Arc<SegmentStore>),
    Stream(Arc<RingBuffer>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub status: String,
    pub success: bool,
    /// The exit followed a `stop()` call.
    pub requested: bool,
}

/// A running transcoder process and its pumps. At most one exists per
/// session at any time.
pub struct Transcoder {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitReport>>,
    requested: Arc<AtomicBool>,
    input_cancel: CancellationToken,
    output_cancel: CancellationToken,
    kill: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _workdir: Option<tempfile::TempDir>,
}

impl fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcoder")
            .field("pid", &self.pid)
            .field("exited", &self.exit.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl Transcoder {
    /// Launch the process and its pumps.
    pub fn spawn(
        launcher: &dyn TranscoderLauncher,
        options: &TranscodeOptions,
        input: Arc<RingBuffer>,
        output: TranscodeOutput,
    ) -> RelayResult<Self> {
        let mode = options.mode;
        let read_chunk = options.read_chunk_bytes;
        let workdir = match output {
            TranscodeOutput::Segments(_) => Some(
                tempfile::Builder::new()
                    .prefix("iptvrelay-")
                    .tempdir()
                    .map_err(|e| RelayError::TranscoderStartFailed(format!("temp dir: {e}")))?,
            ),
            TranscodeOutput::Stream(_) => None,
        };
        let job = TranscodeJob {
            mode,
            output_dir: workdir
                .as_ref()
                .map(|dir| dir.path().to_path_buf())
                .unwrap_or_default(),
            segment_seconds: options.segment_seconds,
            max_bitrate_kbps: options.max_bitrate_kbps,
        };

        let mut command = launcher.command(&job);
        command
            .stdin(Stdio::piped())
            .stdout(match output {
                TranscodeOutput::Stream(_) => Stdio::piped(),
                TranscodeOutput::Segments(_) => Stdio::null(),
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RelayError::TranscoderStartFailed(e.to_string()))?;
        let pid = child.id();
        info!(pid = ?pid, mode = %mode, "Transcoder started");

        let input_cancel = CancellationToken::new();
        let output_cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut tasks = Vec::new();

        if let Some(stdin) = child.stdin.take() {
            tasks.push(tokio::spawn(
                pump::feed_stdin(stdin, input, read_chunk, input_cancel.clone()).in_current_span(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(
                pump::log_stderr(stderr, output_cancel.clone()).in_current_span(),
            ));
        }
        match output {
            TranscodeOutput::Stream(ring) => {
                if let Some(stdout) = child.stdout.take() {
                    tasks.push(tokio::spawn(
                        pump::drain_stdout(stdout, ring, read_chunk, output_cancel.clone())
                            .in_current_span(),
                    ));
                }
            }
            TranscodeOutput::Segments(store) => {
                tasks.push(tokio::spawn(
                    pump::ingest_segments(
                        job.output_dir.clone(),
                        store,
                        options.poll_interval,
                        exit_rx.clone(),
                        output_cancel.clone(),
                    )
                    .in_current_span(),
                ));
            }
        }

        let watcher = {
            let kill = kill.clone();
            let requested = requested.clone();
            async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    () = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            debug!("start_kill failed: {e}");
                        }
                        child.wait().await
                    }
                };
                let report = match status {
                    Ok(status) => ExitReport {
                        status: status.to_string(),
                        success: status.success(),
                        requested: requested.load(Ordering::SeqCst),
                    },
                    Err(e) => ExitReport {
                        status: format!("wait failed: {e}"),
                        success: false,
                        requested: requested.load(Ordering::SeqCst),
                    },
                };
                debug!(status = %report.status, requested = report.requested, "Transcoder exited");
                let _ = exit_tx.send(Some(report));
            }
        };
        tasks.push(tokio::spawn(watcher.in_current_span()));

        Ok(Self {
            pid,
            exit: exit_rx,
            requested,
            input_cancel,
            output_cancel,
            kill,
            tasks: Mutex::new(tasks),
            _workdir: workdir,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves when the process has exited, for whatever reason.
    pub async fn wait_exit(&self) -> ExitReport {
        let mut exit = self.exit.clone();
        let report = match exit.wait_for(Option::is_some).await {
            Ok(report) => report.clone().unwrap_or_else(lost_watcher),
            Err(_) => lost_watcher(),
        };
        report
    }

    /// Let the process finish on its own after its input hits EOF, then
    /// wait for the output pump to ingest what it produced.
    pub async fn finish(&self) -> ExitReport {
        let report = self.wait_exit().await;
        self.join_tasks().await;
        report
    }

    /// Graceful stop: close stdin and send SIGTERM, force-kill after
    /// `grace`. Returns once the process and every pump are gone.
    pub async fn stop(&self, grace: Duration) -> ExitReport {
        self.requested.store(true, Ordering::SeqCst);
        self.input_cancel.cancel();

        if !self.has_exited() {
            self.terminate();
            if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
                warn!(pid = ?self.pid, "Transcoder ignored SIGTERM, killing");
                self.kill.cancel();
            }
        }

        let report = match tokio::time::timeout(KILL_WAIT, self.wait_exit()).await {
            Ok(report) => report,
            Err(_) => ExitReport {
                status: "did not exit after kill".to_string(),
                success: false,
                requested: true,
            },
        };
        self.output_cancel.cancel();
        self.join_tasks().await;
        report
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    debug!(pid, "SIGTERM failed: {e}");
                }
            }
            None => self.kill.cancel(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        // No SIGTERM; closing stdin lets the transcoder flush and exit.
        if self.pid.is_none() {
            self.kill.cancel();
        }
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Transcoder pump panicked: {e}");
                }
            }
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.input_cancel.cancel();
        self.output_cancel.cancel();
        self.kill.cancel();
    }
}

fn lost_watcher() -> ExitReport {
    ExitReport {
        status: "exit watcher gone".to_string(),
        success: false,
        requested: false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Runs an arbitrary shell script; `$1` is the job's output directory.
    #[derive(Debug)]
    struct ShellLauncher(&'static str);

    impl TranscoderLauncher for ShellLauncher {
        fn command(&self, job: &TranscodeJob) -> Command {
            let mut command = Command::new("sh");
            command.arg("-c").arg(self.0).arg("sh").arg(&job.output_dir);
            command
        }
    }

    fn options() -> TranscodeOptions {
        TranscodeOptions {
            mode: RelayMode::AudioTranscode,
            segment_seconds: 2,
            max_bitrate_kbps: None,
            poll_interval: Duration::from_millis(20),
            read_chunk_bytes: 4096,
        }
    }

    fn spawn(script: &'static str, input: Arc<RingBuffer>, output: TranscodeOutput) -> Transcoder {
        Transcoder::spawn(&ShellLauncher(script), &options(), input, output).unwrap()
    }

    #[tokio::test]
    async fn test_stream_output_passes_through_cat() {
        let input = Arc::new(RingBuffer::new(1024, 0));
        let output = Arc::new(RingBuffer::new(1024, 0));
        let transcoder = spawn("cat", input.clone(), TranscodeOutput::Stream(output.clone()));

        input.write_all(b"hello transcoder").await.unwrap();
        input.close();

        let report = transcoder.finish().await;
        assert!(report.success);
        assert!(!report.requested);

        let mut received = Vec::new();
        while let Some(chunk) = output.read_chunk(1024).await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"hello transcoder");
    }

    #[tokio::test]
    async fn test_segments_are_ingested() {
        let script = r#"
            cat > /dev/null
            printf 'seg-a' > "$1/seg_0.ts"
            printf 'seg-b' > "$1/seg_1.ts"
            printf '#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.0,\nseg_0.ts\n#EXTINF:1.5,\nseg_1.ts\n' > "$1/stream.m3u8"
        "#;
        let input = Arc::new(RingBuffer::new(1024, 0));
        let store = Arc::new(SegmentStore::new(6, Duration::from_secs(2)));
        let transcoder = spawn(script, input.clone(), TranscodeOutput::Segments(store.clone()));

        input.write_all(b"source").await.unwrap();
        input.close();
        transcoder.finish().await;

        assert_eq!(store.ready_sequences(), vec![0, 1]);
        assert_eq!(store.get(1), Some(Bytes::from_static(b"seg-b")));
        assert!(store.manifest(|s| s.to_string()).contains("#EXTINF:1.500,"));
    }

    #[tokio::test]
    async fn test_stop_terminates_stuck_process() {
        let input = Arc::new(RingBuffer::new(1024, 0));
        let output = Arc::new(RingBuffer::new(1024, 0));
        let transcoder = spawn(
            "trap '' TERM; exec sleep 30",
            input,
            TranscodeOutput::Stream(output),
        );

        let started = tokio::time::Instant::now();
        let report = transcoder.stop(Duration::from_millis(200)).await;
        assert!(report.requested);
        assert!(!report.success);
        assert!(transcoder.has_exited());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_crash_is_reported_unrequested() {
        let input = Arc::new(RingBuffer::new(1024, 0));
        let output = Arc::new(RingBuffer::new(1024, 0));
        let transcoder = spawn("exit 3", input, TranscodeOutput::Stream(output));
        let report = transcoder.wait_exit().await;
        assert!(!report.success);
        assert!(!report.requested);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        #[derive(Debug)]
        struct Missing;
        impl TranscoderLauncher for Missing {
            fn command(&self, _job: &TranscodeJob) -> Command {
                Command::new("/nonexistent/ffmpeg")
            }
        }

        let err = Transcoder::spawn(
            &Missing,
            &options(),
            Arc::new(RingBuffer::new(16, 0)),
            TranscodeOutput::Stream(Arc::new(RingBuffer::new(16, 0))),
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::TranscoderStartFailed(_)));
    }
}
