use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Returned by writers once the buffer stops accepting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferClosed;

impl std::fmt::Display for BufferClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ring buffer closed")
    }
}

impl std::error::Error for BufferClosed {}

/// Bounded single-producer byte queue between an upstream reader and one
/// consumer (an HTTP response body or a transcoder's stdin).
///
/// Cursors are monotonically increasing byte counters; the storage index is
/// `cursor % capacity`. `read_pos <= write_pos` and
/// `write_pos - read_pos <= capacity` hold at all times.
pub struct RingBuffer {
    state: Mutex<RingState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

struct RingState {
    data: Box<[u8]>,
    write_pos: u64,
    read_pos: u64,
    /// Bytes that must accumulate before the first read is released.
    prebuffer: usize,
    primed: bool,
    /// Producer is done; readers drain what is left and then see EOF.
    closed: bool,
    /// Hard stop; both sides give up immediately.
    aborted: bool,
}

impl RingState {
    fn available(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }
}

impl RingBuffer {
    #[must_use]
    pub fn new(capacity: usize, prebuffer: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                prebuffer: prebuffer.min(capacity),
                primed: prebuffer == 0,
                closed: false,
                aborted: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written but not yet read.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().available()
    }

    #[must_use]
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.state.lock().write_pos
    }

    #[must_use]
    pub fn total_read(&self) -> u64 {
        self.state.lock().read_pos
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.aborted
    }

    /// Append all of `buf`, waiting for free space as needed.
    ///
    /// Never drops bytes: a full buffer blocks the producer until the
    /// consumer catches up or the buffer is closed.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), BufferClosed> {
        while !buf.is_empty() {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let written = {
                let mut state = self.state.lock();
                if state.closed || state.aborted {
                    return Err(BufferClosed);
                }
                let free = self.capacity - state.available();
                let n = free.min(buf.len());
                if n > 0 {
                    let start = (state.write_pos % self.capacity as u64) as usize;
                    let first = n.min(self.capacity - start);
                    state.data[start..start + first].copy_from_slice(&buf[..first]);
                    if first < n {
                        state.data[..n - first].copy_from_slice(&buf[first..n]);
                    }
                    state.write_pos += n as u64;
                    if !state.primed && state.available() >= state.prebuffer {
                        state.primed = true;
                    }
                    debug_assert!(state.available() <= self.capacity);
                }
                n
            };

            if written > 0 {
                buf = &buf[written..];
                self.readable.notify_waiters();
            } else {
                notified.await;
            }
        }
        Ok(())
    }

    /// Read up to `max` bytes. Returns `None` at EOF: the producer closed and
    /// everything was drained, or the buffer was aborted.
    pub async fn read_chunk(&self, max: usize) -> Option<Bytes> {
        let max = max.max(1);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.aborted {
                    return None;
                }
                let available = state.available();
                let released = state.primed || state.closed;
                if released && available > 0 {
                    state.primed = true;
                    let n = available.min(max);
                    let start = (state.read_pos % self.capacity as u64) as usize;
                    let first = n.min(self.capacity - start);
                    let mut out = Vec::with_capacity(n);
                    out.extend_from_slice(&state.data[start..start + first]);
                    if first < n {
                        out.extend_from_slice(&state.data[..n - first]);
                    }
                    state.read_pos += n as u64;
                    debug_assert!(state.read_pos <= state.write_pos);
                    drop(state);
                    self.writable.notify_waiters();
                    return Some(Bytes::from(out));
                }
                if state.closed && available == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Producer finished. Readers drain the remaining bytes, then get EOF.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Stop both sides immediately, discarding unread bytes.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.aborted = true;
            state.read_pos = state.write_pos;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Discard unread bytes and reopen a closed buffer for a fresh producer.
    /// An aborted buffer stays aborted.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.read_pos = state.write_pos;
            state.closed = false;
        }
        self.writable.notify_waiters();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("write_pos", &state.write_pos)
            .field("read_pos", &state.read_pos)
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}
