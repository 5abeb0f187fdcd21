use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// How a session serves its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    VideoPassthrough,
    VideoTranscode,
    AudioPassthrough,
    AudioTranscode,
}

impl RelayMode {
    #[must_use]
    pub const fn is_transcode(self) -> bool {
        matches!(self, Self::VideoTranscode | Self::AudioTranscode)
    }

    #[must_use]
    pub const fn is_audio(self) -> bool {
        matches!(self, Self::AudioPassthrough | Self::AudioTranscode)
    }

    /// Video transcode output is segmented HLS; every other mode is a single
    /// continuous body.
    #[must_use]
    pub const fn is_hls(self) -> bool {
        matches!(self, Self::VideoTranscode)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VideoPassthrough => "video-passthrough",
            Self::VideoTranscode => "video-transcode",
            Self::AudioPassthrough => "audio-passthrough",
            Self::AudioTranscode => "audio-transcode",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "video-passthrough" | "passthrough" | "raw" => Ok(Self::VideoPassthrough),
            "video-transcode" | "video" | "hls" => Ok(Self::VideoTranscode),
            "audio-passthrough" => Ok(Self::AudioPassthrough),
            "audio-transcode" | "audio" => Ok(Self::AudioTranscode),
            other => Err(RelayError::InvalidMode(format!("unknown mode '{other}'"))),
        }
    }
}

/// Live sessions restart on false EOF; catch-up sessions end there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    #[default]
    Live,
    CatchUp,
}

impl SessionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::CatchUp => "catch-up",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "live" => Ok(Self::Live),
            "catch-up" | "catchup" | "vod" => Ok(Self::CatchUp),
            other => Err(RelayError::InvalidMode(format!("unknown kind '{other}'"))),
        }
    }
}

/// Who will consume the session. Cast receivers cannot play a progressive
/// MPEG-TS body, so auto classification sends their video through HLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    #[default]
    Player,
    Cast,
}

/// Everything the caller knows about a channel it wants relayed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    pub url: String,
    /// Sent upstream verbatim (user agent, cookies, tokens).
    pub headers: BTreeMap<String, String>,
    /// `None` classifies the source on first connect.
    pub mode: Option<RelayMode>,
    pub kind: SessionKind,
    pub target: Target,
    /// Receiver quality ceiling.
    pub max_bitrate_kbps: Option<u32>,
}

impl SessionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RelayMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: SessionKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
