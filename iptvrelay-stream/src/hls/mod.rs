//! Rolling segment window and manifest generation for transcoded video.

mod bootstrap;

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;

pub use bootstrap::{BootstrapSegment, BootstrapSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Sequence number allocated, bytes still being produced.
    Pending,
    Ready,
    /// Evicted from the window; storage released.
    Expired,
}

/// One unit of HLS output.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub duration: Duration,
    /// Timestamps do not continue from the previous segment.
    pub discontinuity: bool,
    pub state: SegmentState,
    pub data: Bytes,
    pub created_at: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    segments: VecDeque<Segment>,
    next_sequence: u64,
    /// Discontinuity tags that have scrolled out of the window.
    discontinuity_sequence: u64,
    mark_next_discontinuity: bool,
    ended: bool,
}

/// Segment storage owned by one transcoding session.
///
/// Holds at most `window` ready segments in ascending sequence order; older
/// ones are expired as new ones complete.
#[derive(Debug)]
pub struct SegmentStore {
    state: RwLock<StoreState>,
    window: usize,
    target_duration: Duration,
    updates: watch::Sender<u64>,
}

impl SegmentStore {
    #[must_use]
    pub fn new(window: usize, target_duration: Duration) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            state: RwLock::new(StoreState::default()),
            window: window.max(1),
            target_duration,
            updates,
        }
    }

    /// Serve `bootstrap` as sequence 0 until real output arrives. The first
    /// real segment carries a discontinuity marker. Ignored once any segment
    /// exists.
    pub fn insert_bootstrap(&self, bootstrap: &BootstrapSegment) -> bool {
        {
            let mut state = self.state.write();
            if state.next_sequence != 0 {
                return false;
            }
            state.segments.push_back(Segment {
                sequence: 0,
                duration: bootstrap.duration,
                discontinuity: false,
                state: SegmentState::Ready,
                data: bootstrap.data.clone(),
                created_at: Instant::now(),
            });
            state.next_sequence = 1;
            state.mark_next_discontinuity = true;
        }
        self.publish();
        true
    }

    /// Allocate the next sequence number for a segment still being written.
    pub fn reserve(&self, duration: Duration) -> u64 {
        let mut state = self.state.write();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let discontinuity = std::mem::take(&mut state.mark_next_discontinuity);
        state.segments.push_back(Segment {
            sequence,
            duration,
            discontinuity,
            state: SegmentState::Pending,
            data: Bytes::new(),
            created_at: Instant::now(),
        });
        sequence
    }

    /// Attach bytes to a reserved segment and make it visible.
    pub fn complete(&self, sequence: u64, data: Bytes) -> bool {
        {
            let mut state = self.state.write();
            let Some(segment) = state
                .segments
                .iter_mut()
                .find(|s| s.sequence == sequence && s.state == SegmentState::Pending)
            else {
                return false;
            };
            segment.data = data;
            segment.state = SegmentState::Ready;
            self.evict(&mut state);
        }
        self.publish();
        true
    }

    /// Reserve and complete in one step.
    pub fn push(&self, duration: Duration, data: Bytes) -> u64 {
        let sequence = self.reserve(duration);
        self.complete(sequence, data);
        sequence
    }

    /// Drop a reservation whose bytes never arrived. The newest reservation
    /// hands its number back so the sequence stays contiguous; resolve
    /// reservations in order to keep it that way.
    pub fn abandon(&self, sequence: u64) {
        let mut state = self.state.write();
        let Some(pos) = state
            .segments
            .iter()
            .position(|s| s.sequence == sequence && s.state == SegmentState::Pending)
        else {
            return;
        };
        if let Some(segment) = state.segments.remove(pos) {
            if segment.discontinuity {
                state.mark_next_discontinuity = true;
            }
        }
        if sequence + 1 == state.next_sequence {
            state.next_sequence = sequence;
        }
    }

    /// The next reserved segment starts a new timeline.
    pub fn mark_discontinuity(&self) {
        self.state.write().mark_next_discontinuity = true;
    }

    /// No more segments will follow; the manifest gets `#EXT-X-ENDLIST`.
    pub fn finish(&self) {
        self.state.write().ended = true;
        self.publish();
    }

    /// Release all segment storage.
    pub fn clear(&self) {
        let mut state = self.state.write();
        for segment in &mut state.segments {
            segment.state = SegmentState::Expired;
            segment.data = Bytes::new();
        }
        state.segments.clear();
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state.read().ended
    }

    #[must_use]
    pub fn get(&self, sequence: u64) -> Option<Bytes> {
        self.state
            .read()
            .segments
            .iter()
            .find(|s| s.sequence == sequence && s.state == SegmentState::Ready)
            .map(|s| s.data.clone())
    }

    #[must_use]
    pub fn segment_state(&self, sequence: u64) -> Option<SegmentState> {
        let state = self.state.read();
        if let Some(segment) = state.segments.iter().find(|s| s.sequence == sequence) {
            return Some(segment.state);
        }
        (sequence < state.next_sequence).then_some(SegmentState::Expired)
    }

    /// Sequence numbers currently listed in the manifest.
    #[must_use]
    pub fn ready_sequences(&self) -> Vec<u64> {
        self.state
            .read()
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::Ready)
            .map(|s| s.sequence)
            .collect()
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.state
            .read()
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::Ready)
            .count()
    }

    /// Wait until at least one segment is ready or the store has ended.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.updates.subscribe();
        let ready = tokio::time::timeout(timeout, async {
            loop {
                if self.ready_count() > 0 || self.is_ended() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        ready.is_ok() && self.ready_count() > 0
    }

    /// Render the media playlist for the current window.
    pub fn manifest<F>(&self, mut segment_url: F) -> String
    where
        F: FnMut(u64) -> String,
    {
        let state = self.state.read();
        let ready: Vec<&Segment> = state
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::Ready)
            .collect();

        let target = ready
            .iter()
            .map(|s| s.duration)
            .chain(std::iter::once(self.target_duration))
            .max()
            .unwrap_or(self.target_duration);
        let target_secs = target.as_secs() + u64::from(target.subsec_nanos() > 0);
        let media_sequence = ready.first().map_or(state.next_sequence, |s| s.sequence);

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_secs.max(1));
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
        let _ = writeln!(
            out,
            "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
            state.discontinuity_sequence
        );

        for segment in ready {
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
            let _ = writeln!(out, "{}", segment_url(segment.sequence));
        }

        if state.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    fn evict(&self, state: &mut StoreState) {
        loop {
            let ready = state
                .segments
                .iter()
                .filter(|s| s.state == SegmentState::Ready)
                .count();
            if ready <= self.window {
                break;
            }
            let Some(pos) = state
                .segments
                .iter()
                .position(|s| s.state == SegmentState::Ready)
            else {
                break;
            };
            if let Some(mut old) = state.segments.remove(pos) {
                old.state = SegmentState::Expired;
                old.data = Bytes::new();
                if old.discontinuity {
                    state.discontinuity_sequence += 1;
                }
            }
        }
    }

    fn publish(&self) {
        self.updates.send_modify(|version| *version += 1);
    }
}
