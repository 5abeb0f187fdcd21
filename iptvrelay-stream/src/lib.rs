// iptvrelay-stream - Local relay between IPTV providers and players/cast receivers
//
// Layout:
// - session/    - Session records, registry (SessionManager) and port allocation
// - upstream/   - Provider fetch into the ring buffer
// - buffer/     - Bounded producer/consumer byte queue
// - classify/   - Once-per-session mode decision
// - transcode/  - External transcoder process and its pumps
// - hls/        - Segment window, manifest and bootstrap segment
// - continuity/ - Restart budget and the per-session supervisor
// - server/     - Per-session HTTP surface
//
// Every session is independent; only the port allocator and the registry
// are shared.

pub mod buffer;
pub mod classify;
pub mod continuity;
pub mod error;
pub mod firewall;
pub mod hls;
pub mod net;
pub mod server;
pub mod session;
pub mod transcode;
pub mod upstream;

// Re-exports for convenience
pub use buffer::RingBuffer;
pub use classify::{Classification, Classifier, Container};
pub use error::{RelayError, RelayResult, SessionError};
pub use firewall::{FirewallError, FirewallManager};
pub use hls::{BootstrapSegment, BootstrapSource, SegmentStore};
pub use session::{
    RelayMode, SessionHandle, SessionKind, SessionManager, SessionManagerBuilder, SessionRequest,
    SessionState, SessionStatus, Target,
};
pub use transcode::{FfmpegLauncher, TranscodeJob, TranscoderLauncher};
