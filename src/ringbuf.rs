//! Byte ring buffers — the sole data channel between adjacent elements.
//!
//! A [`RingBuffer`] is a fixed-capacity byte FIFO shared by exactly two
//! workers: the upstream element writes, the downstream element reads.
//! Both sides block with an optional timeout, which gives natural
//! backpressure while keeping worst-case memory bounded.
//!
//! Two flags control shutdown:
//!
//! - [`mark_done`](RingBuffer::mark_done): the producer signals
//!   end-of-stream; the consumer drains the remaining bytes and then
//!   observes a zero-length read instead of blocking forever.
//! - [`abort`](RingBuffer::abort): either side (in practice, element
//!   stop) wakes all waiters immediately with [`Error::Aborted`]. This
//!   is the fundamental cancellation primitive — it is the only way to
//!   guarantee that a blocked worker unblocks.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default capacity for rings created by element configuration.
pub const DEFAULT_RING_CAPACITY: usize = 8 * 1024;

struct Inner {
    buf: Box<[u8]>,
    /// Read cursor (index of the oldest byte).
    read: usize,
    /// Occupied bytes; the write cursor is `(read + fill) % capacity`.
    fill: usize,
    done: bool,
    aborted: bool,
}

/// Fixed-capacity byte queue with blocking, backpressured read and write.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring buffer with the given capacity in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                fill: 0,
                done: false,
                aborted: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    /// The fixed byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn occupied(&self) -> usize {
        self.inner.lock().unwrap().fill
    }

    /// Free space in bytes.
    pub fn free(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        self.capacity - inner.fill
    }

    /// Whether the producer has signalled end-of-stream.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Whether the buffer has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    /// Copy `bytes` into the buffer, blocking for free space.
    ///
    /// Returns the number of bytes accepted:
    ///
    /// - equal to `bytes.len()` on full completion;
    /// - smaller when the write made partial progress and then timed
    ///   out or observed abort/done (the count tells the caller exactly
    ///   where to resume, and keeps byte accounting exact during
    ///   shutdown);
    /// - `Err(Timeout)` when the timeout elapsed with no progress at
    ///   all, `Err(Aborted)` if the buffer was aborted before any byte
    ///   was accepted, `Err(Done)` if the producer already marked the
    ///   buffer done.
    ///
    /// `timeout` of `None` waits forever; `abort` remains the escape
    /// hatch for shutdown.
    pub fn write(&self, bytes: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut written = 0usize;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.aborted {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Error::Aborted)
                };
            }
            if inner.done {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Error::Done)
                };
            }
            let free = self.capacity - inner.fill;
            if free > 0 {
                let n = free.min(bytes.len() - written);
                let write_at = (inner.read + inner.fill) % self.capacity;
                copy_in(&mut inner.buf, write_at, &bytes[written..written + n]);
                inner.fill += n;
                written += n;
                self.readable.notify_all();
                if written == bytes.len() {
                    return Ok(written);
                }
                continue;
            }
            match wait_until(&self.writable, inner, deadline) {
                (guard, false) => inner = guard,
                (_, true) => {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(Error::Timeout)
                    };
                }
            }
        }
    }

    /// Copy buffered bytes into `into`, blocking until at least one
    /// byte is available.
    ///
    /// Returns the number of bytes read (at least 1), or `Ok(0)` once
    /// the producer has marked the buffer done and all bytes are
    /// drained — the end-of-stream signal. `Err(Timeout)` when no byte
    /// arrived within `timeout`, `Err(Aborted)` if the buffer was
    /// aborted.
    pub fn read(&self, into: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if into.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.aborted {
                return Err(Error::Aborted);
            }
            if inner.fill > 0 {
                let n = inner.fill.min(into.len());
                let read_at = inner.read;
                copy_out(&inner.buf, read_at, &mut into[..n]);
                inner.read = (inner.read + n) % self.capacity;
                inner.fill -= n;
                self.writable.notify_all();
                return Ok(n);
            }
            if inner.done {
                return Ok(0);
            }
            match wait_until(&self.readable, inner, deadline) {
                (guard, false) => inner = guard,
                (_, true) => return Err(Error::Timeout),
            }
        }
    }

    /// Producer-side end-of-stream. Idempotent.
    ///
    /// Wakes any blocked reader so it can drain and observe the
    /// zero-length completion instead of blocking forever.
    pub fn mark_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.done = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Abort the buffer. Idempotent.
    ///
    /// Wakes any blocked reader or writer immediately with
    /// [`Error::Aborted`]. Used during stop/terminate so no worker can
    /// block forever on a buffer that will never progress again.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Clear contents and both flags, returning the buffer to its
    /// freshly-created state. Used when a stopped pipeline is reset for
    /// another run.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read = 0;
        inner.fill = 0;
        inner.done = false;
        inner.aborted = false;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("occupied", &inner.fill)
            .field("done", &inner.done)
            .field("aborted", &inner.aborted)
            .finish()
    }
}

/// Copy `src` into the ring storage starting at `at`, wrapping once.
fn copy_in(buf: &mut [u8], at: usize, src: &[u8]) {
    let cap = buf.len();
    let first = src.len().min(cap - at);
    buf[at..at + first].copy_from_slice(&src[..first]);
    let rest = src.len() - first;
    if rest > 0 {
        buf[..rest].copy_from_slice(&src[first..]);
    }
}

/// Copy out of the ring storage starting at `at` into `dst`, wrapping once.
fn copy_out(buf: &[u8], at: usize, dst: &mut [u8]) {
    let cap = buf.len();
    let first = dst.len().min(cap - at);
    dst[..first].copy_from_slice(&buf[at..at + first]);
    let rest = dst.len() - first;
    if rest > 0 {
        dst[first..].copy_from_slice(&buf[..rest]);
    }
}

/// Wait on `cvar` until notified or `deadline` passes.
///
/// Returns the reacquired guard and whether the deadline elapsed.
fn wait_until<'a>(
    cvar: &Condvar,
    guard: MutexGuard<'a, Inner>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, Inner>, bool) {
    match deadline {
        None => (cvar.wait(guard).unwrap(), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, result) = cvar.wait_timeout(guard, deadline - now).unwrap();
            (guard, result.timed_out())
        }
    }
}
