//! Byte-level container detection for upstreams that mislabel their content.

use std::fmt;

/// Container families the relay can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    MpegTs,
    /// MPEG-1/2 audio layer III.
    Mp3,
    /// MPEG audio layer I/II.
    Mp2,
    Aac,
    Ogg,
    Flac,
    Mp4,
    Flv,
    Matroska,
    HlsPlaylist,
    Unknown,
}

impl Container {
    /// Whether a container of this family normally carries video.
    #[must_use]
    pub const fn is_video(self) -> bool {
        matches!(self, Self::MpegTs | Self::Mp4 | Self::Flv | Self::Matroska)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MpegTs => "mpegts",
            Self::Mp3 => "mp3",
            Self::Mp2 => "mp2",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Mp4 => "mp4",
            Self::Flv => "flv",
            Self::Matroska => "matroska",
            Self::HlsPlaylist => "hls-playlist",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the leading bytes of a body look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub container: Container,
    /// Bitrate read from the first audio frame header, when there is one.
    pub bitrate_kbps: Option<u32>,
}

impl Sniffed {
    const fn of(container: Container) -> Self {
        Self {
            container,
            bitrate_kbps: None,
        }
    }
}

/// Decides a container from the first bytes of a response body.
///
/// Providers disagree on how their live channels look on the wire, so the
/// heuristic is swappable per `Classifier`.
pub trait SniffPolicy: Send + Sync + fmt::Debug {
    fn sniff(&self, head: &[u8]) -> Sniffed;
}

const TS_SYNC_BYTE: u8 = 0x47;
/// Plain TS, M2TS with a 4-byte timestamp prefix, and TS with Reed-Solomon parity.
const TS_PACKET_SIZES: [usize; 3] = [188, 192, 204];

/// Magic-number and sync-pattern sniffer.
#[derive(Debug, Clone)]
pub struct SignatureSniffer {
    /// Sync bytes that must line up before a body counts as MPEG-TS.
    pub ts_sync_packets: usize,
}

impl Default for SignatureSniffer {
    fn default() -> Self {
        Self { ts_sync_packets: 3 }
    }
}

impl SniffPolicy for SignatureSniffer {
    fn sniff(&self, head: &[u8]) -> Sniffed {
        if looks_like_playlist(head) {
            return Sniffed::of(Container::HlsPlaylist);
        }
        if head.starts_with(b"ID3") {
            return sniff_after_id3(head);
        }
        if has_ts_sync(head, self.ts_sync_packets) {
            return Sniffed::of(Container::MpegTs);
        }
        if head.starts_with(b"fLaC") {
            return Sniffed::of(Container::Flac);
        }
        if head.starts_with(b"OggS") {
            return Sniffed::of(Container::Ogg);
        }
        if head.starts_with(b"FLV") {
            return Sniffed::of(Container::Flv);
        }
        if head.len() >= 8 && &head[4..8] == b"ftyp" {
            return Sniffed::of(Container::Mp4);
        }
        if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Sniffed::of(Container::Matroska);
        }
        sniff_mpeg_audio(head).unwrap_or(Sniffed::of(Container::Unknown))
    }
}

fn looks_like_playlist(head: &[u8]) -> bool {
    let head = head.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    head[start..].starts_with(b"#EXTM3U")
}

/// True when `0x47` repeats at a fixed packet stride. The first sync byte
/// may sit anywhere inside the first packet, since a live body can start
/// mid-packet.
pub fn has_ts_sync(head: &[u8], packets: usize) -> bool {
    let packets = packets.max(1);
    TS_PACKET_SIZES.iter().any(|&size| {
        let whole = head.len() / size;
        // Short heads still need two aligned sync bytes.
        let needed = packets.min(whole.max(2));
        (0..size).any(|offset| {
            (0..needed).all(|k| head.get(offset + k * size) == Some(&TS_SYNC_BYTE))
        })
    })
}

fn sniff_after_id3(head: &[u8]) -> Sniffed {
    if head.len() < 10 {
        return Sniffed::of(Container::Mp3);
    }
    // Tag size is a 28-bit syncsafe integer.
    let size = head[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if head[5] & 0x10 != 0 { 10 } else { 0 };
    let body = 10 + size + footer;
    match head.get(body..) {
        Some(rest) if !rest.is_empty() => {
            sniff_mpeg_audio(rest).unwrap_or(Sniffed::of(Container::Mp3))
        }
        _ => Sniffed::of(Container::Mp3),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    layer: u8,
    bitrate_kbps: u32,
    length: usize,
}

const MPEG1_SAMPLE_RATES: [u32; 3] = [44100, 48000, 32000];
const MPEG1_L3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const MPEG1_L2_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const MPEG1_L1_KBPS: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const MPEG2_L23_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
const MPEG2_L1_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];

fn parse_frame_header(bytes: &[u8]) -> Option<FrameHeader> {
    let (b0, b1, b2) = match bytes {
        [b0, b1, b2, ..] => (*b0, *b1, *b2),
        _ => return None,
    };
    if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
        return None;
    }
    let version = (b1 >> 3) & 0x03; // 3 = MPEG1, 2 = MPEG2, 0 = MPEG2.5
    let layer = match (b1 >> 1) & 0x03 {
        1 => 3,
        2 => 2,
        3 => 1,
        _ => return None,
    };
    if version == 1 {
        return None;
    }
    let bitrate_index = usize::from(b2 >> 4);
    let rate_index = usize::from((b2 >> 2) & 0x03);
    if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }
    let mpeg1 = version == 3;
    let table = match (mpeg1, layer) {
        (true, 3) => &MPEG1_L3_KBPS,
        (true, 2) => &MPEG1_L2_KBPS,
        (true, _) => &MPEG1_L1_KBPS,
        (false, 1) => &MPEG2_L1_KBPS,
        (false, _) => &MPEG2_L23_KBPS,
    };
    let bitrate_kbps = table[bitrate_index];
    let divisor = match version {
        3 => 1,
        2 => 2,
        _ => 4,
    };
    let sample_rate = MPEG1_SAMPLE_RATES[rate_index] / divisor;
    let padding = usize::from((b2 >> 1) & 0x01);
    let bits_per_sec = bitrate_kbps as usize * 1000;
    let length = match layer {
        1 => (12 * bits_per_sec / sample_rate as usize + padding) * 4,
        3 if !mpeg1 => 72 * bits_per_sec / sample_rate as usize + padding,
        _ => 144 * bits_per_sec / sample_rate as usize + padding,
    };
    if length < 4 {
        return None;
    }
    Some(FrameHeader {
        layer,
        bitrate_kbps,
        length,
    })
}

fn is_adts_header(bytes: &[u8]) -> bool {
    matches!(bytes, [0xFF, b1, b2, ..] if *b1 & 0xF6 == 0xF0 && (*b2 >> 2) & 0x0F < 13)
}

/// Scan for an MPEG audio frame (confirmed by the frame that follows it when
/// the head is long enough) or an ADTS header.
fn sniff_mpeg_audio(head: &[u8]) -> Option<Sniffed> {
    let scan_end = head.len().min(2048);
    for offset in 0..scan_end {
        let window = &head[offset..];
        if is_adts_header(window) {
            let frame_len = window
                .get(3..6)
                .map(|b| {
                    (usize::from(b[0] & 0x03) << 11) | (usize::from(b[1]) << 3) | usize::from(b[2] >> 5)
                })
                .unwrap_or(0);
            if frame_len > 7
                && (window.len() <= frame_len || is_adts_header(&window[frame_len..]))
            {
                return Some(Sniffed::of(Container::Aac));
            }
            continue;
        }
        let Some(frame) = parse_frame_header(window) else {
            continue;
        };
        let confirmed = match window.get(frame.length..) {
            Some(next) if next.len() >= 3 => parse_frame_header(next).is_some(),
            _ => true,
        };
        if confirmed {
            let container = if frame.layer == 3 {
                Container::Mp3
            } else {
                Container::Mp2
            };
            return Some(Sniffed {
                container,
                bitrate_kbps: Some(frame.bitrate_kbps),
            });
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// `count` 188-byte TS packets with a null PID payload.
    pub fn ts_packets(count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count * 188);
        for i in 0..count {
            let mut packet = vec![0xFFu8; 188];
            packet[0] = 0x47;
            packet[1] = 0x1F;
            packet[2] = 0xFF;
            packet[3] = 0x10 | (i as u8 & 0x0F);
            out.extend_from_slice(&packet);
        }
        out
    }

    /// MPEG-1 layer III frames, 44.1 kHz, no padding.
    pub fn mp3_frames(bitrate_index: u8, count: usize) -> Vec<u8> {
        let kbps = super::MPEG1_L3_KBPS[usize::from(bitrate_index)] as usize;
        let length = 144 * kbps * 1000 / 44100;
        let mut out = Vec::new();
        for _ in 0..count {
            let mut frame = vec![0u8; length];
            frame[0] = 0xFF;
            frame[1] = 0xFB;
            frame[2] = bitrate_index << 4;
            frame[3] = 0x64;
            out.extend_from_slice(&frame);
        }
        out
    }
}
