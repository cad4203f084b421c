//! The self-pipe wakeup primitive.
//!
//! One byte written to the pipe makes the read end pollable and wakes a
//! sleeping multiplexer. Wakeups coalesce and may be lost; the loop is
//! idempotent to both.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::net::sockets::{self, INVALID_SOCKET};

/// A cross-thread wakeup source backed by a connected stream socketpair.
///
/// Starts inert (both descriptor slots invalid); `adopt` installs a pair
/// created by `sockets::socketpair_stream`. The descriptor slots are
/// atomics so `interrupt` can race initialization and shutdown without a
/// lock.
pub struct InterruptSource {
    reader: AtomicI32,
    writer: AtomicI32,
}

impl InterruptSource {
    pub const fn new() -> Self {
        Self {
            reader: AtomicI32::new(INVALID_SOCKET),
            writer: AtomicI32::new(INVALID_SOCKET),
        }
    }

    /// Installs a connected pair: `fds[0]` becomes the read end polled by
    /// the loop, `fds[1]` the write end used by `interrupt`.
    pub fn adopt(&self, fds: [RawFd; 2]) {
        self.reader.store(fds[0], Ordering::Release);
        self.writer.store(fds[1], Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.writer.load(Ordering::Acquire) != INVALID_SOCKET
    }

    /// Writes one wakeup byte. Never blocks; all errors are swallowed
    /// because duplicate and lost wakeups are both harmless.
    pub fn interrupt(&self) {
        let fd = self.writer.load(Ordering::Acquire);
        if fd == INVALID_SOCKET {
            return;
        }
        let _ = sockets::send_socket(fd, b"!", libc::MSG_DONTWAIT);
    }

    /// Transfers ownership of the read end to the caller.
    pub fn take_reader(&self) -> Option<RawFd> {
        let fd = self.reader.swap(INVALID_SOCKET, Ordering::AcqRel);
        if fd == INVALID_SOCKET {
            None
        } else {
            Some(fd)
        }
    }

    /// Closes the write end; later `interrupt` calls become no-ops.
    pub fn close_writer(&self) {
        let fd = self.writer.swap(INVALID_SOCKET, Ordering::AcqRel);
        if fd != INVALID_SOCKET {
            sockets::close_socket(fd);
        }
    }

    pub(crate) fn swap_with(&self, other: &InterruptSource) {
        let reader = self.reader.load(Ordering::Acquire);
        let writer = self.writer.load(Ordering::Acquire);
        self.reader.store(other.reader.load(Ordering::Acquire), Ordering::Release);
        self.writer.store(other.writer.load(Ordering::Acquire), Ordering::Release);
        other.reader.store(reader, Ordering::Release);
        other.writer.store(writer, Ordering::Release);
    }
}

impl Default for InterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptSource {
    fn drop(&mut self) {
        for slot in [&self.reader, &self.writer] {
            let fd = slot.swap(INVALID_SOCKET, Ordering::AcqRel);
            if fd != INVALID_SOCKET {
                sockets::close_socket(fd);
            }
        }
    }
}
