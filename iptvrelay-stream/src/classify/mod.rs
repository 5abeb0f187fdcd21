//! Decides once per session how a source is served.
//!
//! Evidence is weighed in order: a specific `Content-Type`, then the URL
//! extension, then the leading body bytes through a [`SniffPolicy`]. The
//! container found that way maps to one of the four relay modes.

mod sniff;

use std::sync::Arc;

use iptvrelay_core::config::ClassifierConfig;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::session::{RelayMode, Target};

pub use sniff::{has_ts_sync, Container, SignatureSniffer, Sniffed, SniffPolicy};

#[cfg(test)]
pub(crate) use sniff::fixtures;

/// What the connector saw of the upstream response before the first byte
/// went downstream.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInput<'a> {
    pub url: &'a str,
    pub content_type: Option<&'a str>,
    /// Any `icy-*` header was present (SHOUTcast/Icecast radio).
    pub icy: bool,
    pub icy_bitrate_kbps: Option<u32>,
    pub head: &'a [u8],
}

/// Which piece of evidence settled the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    ContentType,
    Extension,
    Sniff,
    /// Nothing matched; a safe default was picked.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub mode: RelayMode,
    pub container: Container,
    pub bitrate_kbps: Option<u32>,
    pub evidence: Evidence,
    /// True when the mode is a fallback rather than a match.
    pub ambiguous: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    audio_passthrough_min_kbps: u32,
    ambiguous_content_types: Vec<String>,
    transcode_enabled: bool,
    policy: Arc<dyn SniffPolicy>,
}

impl Classifier {
    #[must_use]
    pub fn new(config: &ClassifierConfig, transcode_enabled: bool) -> Self {
        Self {
            audio_passthrough_min_kbps: config.audio_passthrough_min_kbps,
            ambiguous_content_types: config
                .ambiguous_content_types
                .iter()
                .map(|ct| ct.to_ascii_lowercase())
                .collect(),
            transcode_enabled,
            policy: Arc::new(SignatureSniffer {
                ts_sync_packets: config.ts_sync_packets,
            }),
        }
    }

    /// Swap the byte sniffing heuristic.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SniffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Pick a mode for `probe`.
    ///
    /// Only an HLS playlist upstream is an error; ambiguous sources fall back
    /// to video with `ambiguous` set.
    pub fn classify(
        &self,
        probe: &ProbeInput<'_>,
        target: Target,
        max_bitrate_kbps: Option<u32>,
    ) -> RelayResult<Classification> {
        let mut reasons = Vec::new();
        let media_type = probe.content_type.map(normalize_content_type);
        let sniffed = self.policy.sniff(probe.head);

        let (mut container, evidence) = if let Some(c) = media_type
            .as_deref()
            .filter(|ct| !self.is_ambiguous(ct))
            .and_then(container_for_content_type)
        {
            reasons.push(format!("content type names {c}"));
            (c, Evidence::ContentType)
        } else if let Some(c) = container_for_extension(probe.url) {
            reasons.push(format!("url extension names {c}"));
            (c, Evidence::Extension)
        } else if sniffed.container != Container::Unknown {
            reasons.push(format!("leading bytes look like {}", sniffed.container));
            (sniffed.container, Evidence::Sniff)
        } else {
            (Container::Unknown, Evidence::Fallback)
        };

        // Some panels serve raw TS from URLs ending in .m3u8.
        if container == Container::HlsPlaylist
            && !matches!(sniffed.container, Container::HlsPlaylist | Container::Unknown)
        {
            reasons.push(format!("body is {}, not a playlist", sniffed.container));
            container = sniffed.container;
        }

        if container == Container::HlsPlaylist {
            return Err(RelayError::UnsupportedSource(format!(
                "{} is an HLS playlist",
                probe.url
            )));
        }

        let bitrate_kbps = probe.icy_bitrate_kbps.or(if sniffed.container == container {
            sniffed.bitrate_kbps
        } else {
            None
        });

        let labelled_audio = probe.icy
            || media_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("audio/"));
        let audio = match container {
            Container::Unknown => labelled_audio,
            c if c.is_video() => labelled_audio,
            _ => true,
        };

        let mut ambiguous = false;
        let mut mode = if audio {
            if self.audio_passthrough_ok(container, bitrate_kbps, max_bitrate_kbps) {
                RelayMode::AudioPassthrough
            } else {
                reasons.push(format!(
                    "{container} at {} kbps needs re-encoding",
                    bitrate_kbps.map_or_else(|| "unknown".to_string(), |b| b.to_string())
                ));
                RelayMode::AudioTranscode
            }
        } else if container == Container::Unknown {
            ambiguous = true;
            reasons.push("no container evidence, defaulting to video".to_string());
            RelayMode::VideoTranscode
        } else if container == Container::MpegTs && target == Target::Player {
            RelayMode::VideoPassthrough
        } else {
            RelayMode::VideoTranscode
        };

        if mode.is_transcode() && !self.transcode_enabled {
            reasons.push("transcoder disabled, relaying as-is".to_string());
            mode = if mode.is_audio() {
                RelayMode::AudioPassthrough
            } else {
                RelayMode::VideoPassthrough
            };
        }

        if ambiguous {
            let err = RelayError::ClassificationAmbiguous(probe.url.to_string());
            warn!(url = probe.url, mode = %mode, "{err}, using fallback mode");
        } else {
            debug!(
                url = probe.url,
                container = %container,
                mode = %mode,
                ?evidence,
                "classification complete"
            );
        }

        Ok(Classification {
            mode,
            container,
            bitrate_kbps,
            evidence,
            ambiguous,
            reasons,
        })
    }

    fn is_ambiguous(&self, media_type: &str) -> bool {
        self.ambiguous_content_types.iter().any(|ct| ct == media_type)
    }

    fn audio_passthrough_ok(
        &self,
        container: Container,
        bitrate_kbps: Option<u32>,
        ceiling_kbps: Option<u32>,
    ) -> bool {
        let Some(bitrate) = bitrate_kbps else {
            return false;
        };
        container == Container::Mp3
            && bitrate >= self.audio_passthrough_min_kbps
            && ceiling_kbps.is_none_or(|ceiling| bitrate <= ceiling)
    }
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

fn container_for_content_type(media_type: &str) -> Option<Container> {
    let container = match media_type {
        "video/mp2t" | "video/mpeg" | "video/mpegts" | "video/x-mpegts" => Container::MpegTs,
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" => Container::Mp3,
        "audio/aac" | "audio/aacp" | "audio/x-aac" => Container::Aac,
        "audio/ogg" | "application/ogg" | "audio/opus" | "audio/vorbis" => Container::Ogg,
        "audio/flac" | "audio/x-flac" => Container::Flac,
        "video/mp4" | "audio/mp4" | "audio/x-m4a" => Container::Mp4,
        "video/x-flv" | "video/flv" => Container::Flv,
        "video/x-matroska" | "video/webm" | "audio/webm" | "audio/x-matroska" => {
            Container::Matroska
        }
        "application/vnd.apple.mpegurl"
        | "application/x-mpegurl"
        | "audio/mpegurl"
        | "audio/x-mpegurl" => Container::HlsPlaylist,
        _ => return None,
    };
    Some(container)
}

fn container_for_extension(raw_url: &str) -> Option<Container> {
    let path = url::Url::parse(raw_url).map_or_else(
        |_| {
            raw_url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        },
        |u| u.path().to_string(),
    );
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    let container = match ext.to_ascii_lowercase().as_str() {
        "ts" | "m2ts" | "mts" => Container::MpegTs,
        "mp3" => Container::Mp3,
        "aac" | "adts" => Container::Aac,
        "ogg" | "oga" | "opus" => Container::Ogg,
        "flac" => Container::Flac,
        "mp4" | "m4a" | "m4v" => Container::Mp4,
        "flv" => Container::Flv,
        "mkv" | "mka" | "webm" => Container::Matroska,
        "m3u8" | "m3u" => Container::HlsPlaylist,
        _ => return None,
    };
    Some(container)
}
