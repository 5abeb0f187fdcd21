use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

/// Process-wide allocator for per-session listening ports.
#[derive(Debug)]
pub struct PortAllocator {
    bind_host: String,
    start: u16,
    end: u16,
    attempts: u32,
    state: Mutex<PortState>,
}

#[derive(Debug)]
struct PortState {
    in_use: HashSet<u16>,
    cursor: u16,
}

impl PortAllocator {
    #[must_use]
    pub fn new(bind_host: impl Into<String>, start: u16, end: u16, attempts: u32) -> Arc<Self> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Arc::new(Self {
            bind_host: bind_host.into(),
            start,
            end,
            attempts: attempts.max(1),
            state: Mutex::new(PortState {
                in_use: HashSet::new(),
                cursor: start,
            }),
        })
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Bind a listener on a free port of the range. Ports that fail to bind
    /// (taken by another process) are skipped; after `attempts` failures
    /// the allocation gives up with `PortExhausted`.
    pub async fn allocate(self: &Arc<Self>) -> RelayResult<(PortLease, TcpListener)> {
        let mut tried = HashSet::new();
        let mut attempts = 0;

        while attempts < self.attempts {
            let Some(port) = self.reserve_next(&mut tried) else {
                break;
            };
            attempts += 1;
            match TcpListener::bind((self.bind_host.as_str(), port)).await {
                Ok(listener) => {
                    debug!(port, "Allocated session port");
                    return Ok((
                        PortLease {
                            port,
                            allocator: Arc::clone(self),
                        },
                        listener,
                    ));
                }
                Err(e) => {
                    debug!(port, "Port unavailable: {e}");
                    self.release(port);
                }
            }
        }

        warn!(start = self.start, end = self.end, attempts, "Session port range exhausted");
        Err(RelayError::PortExhausted {
            start: self.start,
            end: self.end,
            attempts,
        })
    }

    /// Mark the next untried, unused port as taken.
    fn reserve_next(&self, tried: &mut HashSet<u16>) -> Option<u16> {
        let mut state = self.state.lock();
        let span = u32::from(self.end - self.start) + 1;
        for _ in 0..span {
            let port = state.cursor;
            state.cursor = if port >= self.end { self.start } else { port + 1 };
            if !state.in_use.contains(&port) && tried.insert(port) {
                state.in_use.insert(port);
                return Some(port);
            }
        }
        None
    }

    fn release(&self, port: u16) {
        self.state.lock().in_use.remove(&port);
    }
}

/// A reserved port. Dropping the lease returns it to the allocator.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
        debug!(port = self.port, "Released session port");
    }
}
