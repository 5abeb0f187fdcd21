use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{RestartBudget, RestartDecision};
use crate::classify::{Classifier, ProbeInput};
use crate::error::{RelayError, RelayResult};
use crate::hls::BootstrapSource;
use crate::session::{RelayMode, Session, SessionKind, SessionState};
use crate::transcode::{ExitReport, TranscodeOptions, TranscodeOutput, Transcoder, TranscoderLauncher};
use crate::upstream::{UpstreamConnector, UpstreamOutcome, UpstreamResponse};

#[derive(Debug, Clone)]
pub(crate) struct SupervisorOptions {
    pub sniff_bytes: usize,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
    pub segment_seconds: u32,
    pub poll_interval: Duration,
    pub read_chunk_bytes: usize,
}

/// Why the data path stopped.
#[derive(Debug)]
enum Trigger {
    Upstream(UpstreamOutcome),
    Transcoder(ExitReport),
}

/// Drives one session: connect, classify once, run the transcoder, and
/// reconnect live sources until the budget runs out.
pub(crate) struct Supervisor {
    session: Arc<Session>,
    connector: UpstreamConnector,
    classifier: Classifier,
    launcher: Arc<dyn TranscoderLauncher>,
    bootstrap: Arc<BootstrapSource>,
    budget: RestartBudget,
    options: SupervisorOptions,
    transcoder: Option<Transcoder>,
}

impl Supervisor {
    pub(crate) fn new(
        session: Arc<Session>,
        connector: UpstreamConnector,
        classifier: Classifier,
        launcher: Arc<dyn TranscoderLauncher>,
        bootstrap: Arc<BootstrapSource>,
        budget: RestartBudget,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            session,
            connector,
            classifier,
            launcher,
            bootstrap,
            budget,
            options,
            transcoder: None,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(mode) = self.session.request.mode {
            self.decide(mode).await;
        }

        let result = self.drive().await;
        if let Err(e) = result {
            self.session.fail(e);
        }

        if let Some(transcoder) = self.transcoder.take() {
            let report = transcoder.stop(self.options.stop_grace).await;
            debug!(status = %report.status, "Transcoder stopped");
        }
        debug!(state = %self.session.state.get(), "Supervisor finished");
    }

    fn is_live(&self) -> bool {
        self.session.request.kind == SessionKind::Live
    }

    async fn drive(&mut self) -> RelayResult<()> {
        let mut resume_from = 0;

        loop {
            let opened = tokio::select! {
                () = self.session.cancel.cancelled() => return Ok(()),
                opened = self.connector.open(resume_from) => opened,
            };
            let mut response = match opened {
                Ok(response) => response,
                Err(e) if e.is_fatal() || !self.is_live() => return Err(e),
                Err(e) => {
                    if !self.restart(&e.to_string()).await? {
                        return Ok(());
                    }
                    continue;
                }
            };

            let state = self.session.state.get();
            if state == SessionState::Starting || self.session.mode().is_none() {
                self.session.state.transition(SessionState::Probing);
            }
            let mode = match self.session.mode() {
                Some(mode) => mode,
                None => match self.classify(&mut response).await {
                    Ok(Some(mode)) => self.decide(mode).await,
                    Ok(None) => return Ok(()),
                    Err(e) if e.is_fatal() || !self.is_live() => return Err(e),
                    Err(e) => {
                        if !self.restart(&e.to_string()).await? {
                            return Ok(());
                        }
                        continue;
                    }
                },
            };
            self.session
                .set_upstream_content_type(response.content_type.clone());

            if mode.is_transcode() && self.transcoder.is_none() {
                self.start_transcoder(mode)?;
            }
            self.session.state.transition(SessionState::Live);

            let resume = response.resume_point();
            let before = self.session.input.total_written();
            let trigger = self.pump(response).await;
            let received = self.session.input.total_written().saturating_sub(before);
            debug!(?trigger, received, "Data path stopped");

            let reason = match trigger {
                Trigger::Upstream(UpstreamOutcome::Cancelled | UpstreamOutcome::BufferClosed) => {
                    return Ok(());
                }
                Trigger::Transcoder(report) if report.requested => return Ok(()),
                Trigger::Upstream(UpstreamOutcome::Finished) if !self.is_live() => {
                    return self.finish_catch_up().await;
                }
                Trigger::Transcoder(report) if !self.is_live() => {
                    info!(status = %report.status, "Transcoder exited, ending catch-up session");
                    return self.finish_catch_up().await;
                }
                Trigger::Upstream(UpstreamOutcome::Stalled) if !self.is_live() => {
                    return Err(RelayError::UpstreamUnreachable(format!(
                        "no data for {}s",
                        self.connector.stall_timeout().as_secs()
                    )));
                }
                Trigger::Upstream(UpstreamOutcome::Interrupted(e)) if !self.is_live() => {
                    return Err(RelayError::UpstreamUnreachable(e));
                }
                Trigger::Upstream(UpstreamOutcome::Finished) => "upstream closed (false EOF)".to_string(),
                Trigger::Upstream(UpstreamOutcome::Stalled) => "upstream stalled".to_string(),
                Trigger::Upstream(UpstreamOutcome::Interrupted(e)) => format!("upstream interrupted: {e}"),
                Trigger::Transcoder(report) => {
                    RelayError::TranscoderCrashed(report.status).to_string()
                }
            };

            resume_from = resume.after(received).unwrap_or(0);
            if !self.restart(&reason).await? {
                return Ok(());
            }
        }
    }

    /// Sniff the head of `response`. `None` when the session was closed
    /// while waiting.
    async fn classify(&self, response: &mut UpstreamResponse) -> RelayResult<Option<RelayMode>> {
        let head = tokio::select! {
            () = self.session.cancel.cancelled() => return Ok(None),
            head = response.peek_head(self.options.sniff_bytes, self.options.probe_timeout) => {
                head?.to_vec()
            }
        };

        let probe = ProbeInput {
            url: self.connector.url(),
            content_type: response.content_type.as_deref(),
            icy: response.icy,
            icy_bitrate_kbps: response.icy_bitrate_kbps,
            head: &head,
        };
        let request = &self.session.request;
        let classification =
            self.classifier
                .classify(&probe, request.target, request.max_bitrate_kbps)?;

        info!(
            mode = %classification.mode,
            container = %classification.container,
            evidence = ?classification.evidence,
            ambiguous = classification.ambiguous,
            bitrate_kbps = ?classification.bitrate_kbps,
            "Source classified"
        );
        Ok(Some(classification.mode))
    }

    /// Fix the session mode; HLS sessions get their warm-up segment now.
    async fn decide(&self, mode: RelayMode) -> RelayMode {
        let mode = self.session.set_mode(mode);
        if mode == RelayMode::VideoTranscode {
            let bootstrap = tokio::select! {
                () = self.session.cancel.cancelled() => None,
                segment = self.bootstrap.get() => segment,
            };
            if let Some(segment) = bootstrap {
                if self.session.segments.insert_bootstrap(&segment) {
                    debug!(bytes = segment.data.len(), "Bootstrap segment on air");
                }
            }
        }
        info!(mode = %mode, "Relay mode decided");
        mode
    }

    fn start_transcoder(&mut self, mode: RelayMode) -> RelayResult<()> {
        let output = match mode {
            RelayMode::VideoTranscode => TranscodeOutput::Segments(Arc::clone(&self.session.segments)),
            _ => TranscodeOutput::Stream(self.session.output().ok_or_else(|| {
                RelayError::Internal("audio transcode without an output buffer".into())
            })?),
        };
        let options = TranscodeOptions {
            mode,
            segment_seconds: self.options.segment_seconds,
            max_bitrate_kbps: self.session.request.max_bitrate_kbps,
            poll_interval: self.options.poll_interval,
            read_chunk_bytes: self.options.read_chunk_bytes,
        };
        let transcoder = Transcoder::spawn(
            self.launcher.as_ref(),
            &options,
            Arc::clone(&self.session.input),
            output,
        )?;
        self.transcoder = Some(transcoder);
        Ok(())
    }

    /// Run the upstream body into the input buffer until it or the
    /// transcoder stops.
    async fn pump(&self, response: UpstreamResponse) -> Trigger {
        let upstream = response.pump_into(
            &self.session.input,
            self.connector.stall_timeout(),
            &self.session.cancel,
        );
        match &self.transcoder {
            Some(transcoder) => tokio::select! {
                (outcome, _) = upstream => Trigger::Upstream(outcome),
                report = transcoder.wait_exit() => Trigger::Transcoder(report),
            },
            None => Trigger::Upstream(upstream.await.0),
        }
    }

    /// Spend one unit of the restart budget. `Ok(false)` means the session
    /// was closed during the back-off.
    async fn restart(&mut self, reason: &str) -> RelayResult<bool> {
        let (attempt, delay) = match self.budget.record(Instant::now()) {
            RestartDecision::Restart { attempt, delay } => (attempt, delay),
            RestartDecision::Exhausted { restarts } => {
                return Err(RelayError::RestartBudgetExceeded {
                    restarts,
                    window_secs: self.budget.window().as_secs(),
                });
            }
        };

        self.session.state.transition(SessionState::Restarting);
        let total = self.session.record_restart();
        warn!(
            attempt,
            total,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Restarting live session"
        );

        if let Some(transcoder) = self.transcoder.take() {
            let report = transcoder.stop(self.options.stop_grace).await;
            debug!(status = %report.status, "Transcoder stopped for restart");
            self.session.input.reset();
            if self.session.mode() == Some(RelayMode::VideoTranscode) {
                self.session.segments.mark_discontinuity();
            }
        }

        tokio::select! {
            () = self.session.cancel.cancelled() => Ok(false),
            () = tokio::time::sleep(delay) => Ok(true),
        }
    }

    /// The catch-up program is over: let the transcoder flush, then mark the
    /// output finished so readers drain it and stop.
    async fn finish_catch_up(&mut self) -> RelayResult<()> {
        self.session.input.close();
        if let Some(transcoder) = &self.transcoder {
            let report = tokio::select! {
                () = self.session.cancel.cancelled() => return Ok(()),
                report = transcoder.finish() => report,
            };
            debug!(status = %report.status, success = report.success, "Transcoder drained");
            self.transcoder = None;
        }

        match self.session.mode() {
            Some(RelayMode::VideoTranscode) => self.session.segments.finish(),
            Some(RelayMode::AudioTranscode) => {
                if let Some(output) = self.session.output() {
                    output.close();
                }
            }
            _ => {}
        }
        self.session.state.transition(SessionState::Ended);
        info!("Catch-up session complete");
        Ok(())
    }
}
