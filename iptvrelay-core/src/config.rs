use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub classifier: ClassifierConfig,
    pub transcoder: TranscoderConfig,
    pub hls: HlsConfig,
    pub continuity: ContinuityConfig,
    pub firewall: FirewallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every per-session listener binds to.
    pub bind_host: String,
    /// Host written into session URLs. Detected from the primary route when unset.
    pub advertise_host: Option<String>,
    pub control_port: u16,
    /// Inclusive range of ports handed out to sessions.
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_bind_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            control_port: 8090,
            port_range_start: 47100,
            port_range_end: 47199,
            port_bind_attempts: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ring_buffer_bytes: usize,
    /// Bytes withheld from the first downstream read so receivers start smoothly.
    pub prebuffer_bytes: usize,
    pub read_chunk_bytes: usize,
    /// Leading body bytes collected before classification.
    pub sniff_bytes: usize,
    pub connect_timeout_seconds: u64,
    pub stall_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub idle_check_interval_ms: u64,
    pub close_timeout_seconds: u64,
    pub default_user_agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ring_buffer_bytes: 16 * 1024 * 1024,
            prebuffer_bytes: 64 * 1024,
            read_chunk_bytes: 64 * 1024,
            sniff_bytes: 4096,
            connect_timeout_seconds: 15,
            stall_timeout_seconds: 8,
            probe_timeout_seconds: 10,
            idle_timeout_seconds: 60,
            idle_check_interval_ms: 10_000,
            close_timeout_seconds: 5,
            default_user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub const fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// MP3 sources at or above this bitrate are relayed untouched.
    pub audio_passthrough_min_kbps: u32,
    /// Consecutive 0x47 sync bytes required to call a body MPEG-TS.
    pub ts_sync_packets: usize,
    /// Content types that say nothing about the container.
    pub ambiguous_content_types: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            audio_passthrough_min_kbps: 128,
            ts_sync_packets: 3,
            ambiguous_content_types: vec![
                "application/octet-stream".to_string(),
                "binary/octet-stream".to_string(),
                "application/x-octet-stream".to_string(),
                "application/unknown".to_string(),
                "application/binary".to_string(),
                "text/plain".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub enabled: bool,
    pub binary: String,
    pub stop_grace_ms: u64,
    pub segment_seconds: u32,
    pub video_profile: String,
    pub video_level: String,
    pub video_preset: String,
    pub video_max_bitrate_kbps: Option<u32>,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub mp3_bitrate_kbps: u32,
    /// How often the segment directory is scanned for finished segments.
    pub poll_interval_ms: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "ffmpeg".to_string(),
            stop_grace_ms: 2000,
            segment_seconds: 2,
            video_profile: "main".to_string(),
            video_level: "4.0".to_string(),
            video_preset: "veryfast".to_string(),
            video_max_bitrate_kbps: None,
            audio_bitrate_kbps: 320,
            audio_sample_rate: 44100,
            audio_channels: 2,
            mp3_bitrate_kbps: 320,
            poll_interval_ms: 200,
        }
    }
}

impl TranscoderConfig {
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub window_segments: usize,
    pub bootstrap_path: Option<PathBuf>,
    pub bootstrap_seconds: f64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            window_segments: 6,
            bootstrap_path: None,
            bootstrap_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    pub max_restarts: u32,
    /// A quiet period this long resets the restart counter.
    pub decay_window_seconds: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            decay_window_seconds: 30,
            backoff_initial_ms: 500,
            backoff_max_ms: 5000,
        }
    }
}

impl ContinuityConfig {
    #[must_use]
    pub const fn decay_window(&self) -> Duration {
        Duration::from_secs(self.decay_window_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub rule_prefix: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(windows),
            rule_prefix: "IPTV Relay".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // IPTVRELAY_RELAY__STALL_TIMEOUT_SECONDS=4, etc.
        builder = builder.add_source(
            Environment::with_prefix("IPTVRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// [`Config::load`] followed by [`Config::validate`].
    pub fn load_validated(config_file: Option<&str>) -> crate::Result<Self> {
        let config = Self::load(config_file)?;
        config.validate().map_err(crate::Error::Validation)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port_range_start == 0 || self.server.port_range_end == 0 {
            errors.push("server.port_range_start/end must be non-zero".to_string());
        }
        if self.server.port_range_start > self.server.port_range_end {
            errors.push(format!(
                "server.port_range_start ({}) is above port_range_end ({})",
                self.server.port_range_start, self.server.port_range_end
            ));
        }
        if self.server.port_bind_attempts == 0 {
            errors.push("server.port_bind_attempts must be at least 1".to_string());
        }
        if self.relay.ring_buffer_bytes == 0 {
            errors.push("relay.ring_buffer_bytes must be non-zero".to_string());
        }
        if self.relay.prebuffer_bytes > self.relay.ring_buffer_bytes {
            errors.push(format!(
                "relay.prebuffer_bytes ({}) exceeds ring_buffer_bytes ({})",
                self.relay.prebuffer_bytes, self.relay.ring_buffer_bytes
            ));
        }
        if self.relay.read_chunk_bytes == 0 {
            errors.push("relay.read_chunk_bytes must be non-zero".to_string());
        }
        if self.relay.stall_timeout_seconds == 0 {
            errors.push("relay.stall_timeout_seconds must be non-zero".to_string());
        }
        if self.hls.window_segments == 0 {
            errors.push("hls.window_segments must be at least 1".to_string());
        }
        if self.transcoder.segment_seconds == 0 {
            errors.push("transcoder.segment_seconds must be at least 1".to_string());
        }
        if self.continuity.backoff_initial_ms > self.continuity.backoff_max_ms {
            errors.push("continuity.backoff_initial_ms exceeds backoff_max_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.control_port)
    }
}
