use std::time::Duration;

use iptvrelay_core::config::TranscoderConfig;
use tokio::process::Command;

use super::{TranscodeJob, TranscoderLauncher, OUTPUT_PLAYLIST};
use crate::session::RelayMode;

/// Launches `ffmpeg` with a receiver-safe encode profile.
///
/// Video: H.264 with a fixed profile/level, keyframes forced on every
/// segment boundary with scene-cut disabled and closed GOPs, so each HLS
/// segment decodes on its own. Audio is re-encoded to AAC at a fixed rate
/// and layout. Audio-only jobs re-encode to MP3 on stdout.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    config: TranscoderConfig,
}

impl FfmpegLauncher {
    #[must_use]
    pub const fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    fn input_args() -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-analyzeduration",
            "5000000",
            "-probesize",
            "5000000",
            "-fflags",
            "+genpts+igndts+discardcorrupt",
            "-i",
            "pipe:0",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    /// Arguments for an HLS video transcode of `job`.
    #[must_use]
    pub fn video_args(&self, job: &TranscodeJob) -> Vec<String> {
        let cfg = &self.config;
        let seconds = job.segment_seconds.max(1);
        let mut args = Self::input_args();
        args.extend(
            [
                "-map", "0:v:0?", "-map", "0:a:0?",
                "-c:v", "libx264",
                "-preset", cfg.video_preset.as_str(),
                "-profile:v", cfg.video_profile.as_str(),
                "-level:v", cfg.video_level.as_str(),
                "-pix_fmt", "yuv420p",
                "-sc_threshold", "0",
                "-flags", "+cgop",
            ]
            .iter()
            .map(ToString::to_string),
        );
        args.push("-force_key_frames".into());
        args.push(format!("expr:gte(t,n_forced*{seconds})"));

        let ceiling = match (job.max_bitrate_kbps, cfg.video_max_bitrate_kbps) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(kbps) = ceiling {
            args.extend([
                "-maxrate".to_string(),
                format!("{kbps}k"),
                "-bufsize".to_string(),
                format!("{}k", kbps.saturating_mul(2)),
            ]);
        }

        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", cfg.audio_bitrate_kbps),
            "-ar".to_string(),
            cfg.audio_sample_rate.to_string(),
            "-ac".to_string(),
            cfg.audio_channels.to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            seconds.to_string(),
            "-hls_list_size".to_string(),
            "10".to_string(),
            "-hls_flags".to_string(),
            "temp_file+independent_segments".to_string(),
            "-start_number".to_string(),
            "0".to_string(),
            "-hls_segment_filename".to_string(),
            job.output_dir.join("seg_%d.ts").to_string_lossy().into_owned(),
            job.output_dir.join(OUTPUT_PLAYLIST).to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Arguments for an MP3 re-encode written to stdout.
    #[must_use]
    pub fn audio_args(&self, job: &TranscodeJob) -> Vec<String> {
        let cfg = &self.config;
        let kbps = job
            .max_bitrate_kbps
            .map_or(cfg.mp3_bitrate_kbps, |ceiling| ceiling.min(cfg.mp3_bitrate_kbps));
        let mut args = Self::input_args();
        args.extend([
            "-vn".to_string(),
            "-c:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            format!("{kbps}k"),
            "-ar".to_string(),
            cfg.audio_sample_rate.to_string(),
            "-ac".to_string(),
            cfg.audio_channels.to_string(),
            "-f".to_string(),
            "mp3".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    /// One black 640x360 frame sequence with silent stereo audio, as MPEG-TS.
    #[must_use]
    pub fn bootstrap_args(&self, duration: Duration) -> Vec<String> {
        let secs = format!("{:.3}", duration.as_secs_f64());
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("color=c=black:s=640x360:r=10:d={secs}"),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={}:cl=stereo", self.config.audio_sample_rate),
            "-t".into(),
            secs,
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-profile:v".into(),
            self.config.video_profile.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-b:v".into(),
            "1M".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "64k".into(),
            "-f".into(),
            "mpegts".into(),
            "-muxrate".into(),
            "2M".into(),
            "pipe:1".into(),
        ]
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn command(&self, job: &TranscodeJob) -> Command {
        let args = match job.mode {
            RelayMode::AudioTranscode | RelayMode::AudioPassthrough => self.audio_args(job),
            RelayMode::VideoTranscode | RelayMode::VideoPassthrough => self.video_args(job),
        };
        let mut command = Command::new(&self.config.binary);
        command.args(args);
        command
    }

    fn bootstrap_command(&self, duration: Duration) -> Option<Command> {
        let mut command = Command::new(&self.config.binary);
        command.args(self.bootstrap_args(duration));
        Some(command)
    }
}
