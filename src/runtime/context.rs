//! The shared surface of one event loop.
//!
//! `ContextShared` is the `Sync` half — lifecycle state, signal mask and
//! timer wheel — handed to caller threads behind an `Arc`. The full
//! `AsyncContext` adds the thread-affine scope and poller and never
//! leaves the loop thread; continuations receive it by reference.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::runtime::ops;
use crate::runtime::poller::{Poller, SocketDialog};
use crate::runtime::scope::AsyncScope;
use crate::runtime::state::{ContextState, StateCell};
use crate::runtime::timer_wheel::TimerWheel;

/// Signal number requesting a graceful shutdown.
pub const TERMINATE: u8 = 0;
/// First application signal; carries no built-in semantics.
pub const USER1: u8 = 1;
/// One past the last built-in signal number.
pub const SIGNAL_END: u8 = 2;

/// Width of the signal mask; application-defined signals must stay below
/// this bound.
const SIGNAL_BITS: u8 = u64::BITS as u8;

/// The cross-thread face of an event loop: lifecycle state, pending
/// signal mask, and the timer wheel (which owns the loop's interrupt
/// source).
pub struct ContextShared {
    state: StateCell,
    sigmask: AtomicU64,
    timers: TimerWheel,
}

impl ContextShared {
    pub fn new() -> Self {
        Self {
            state: StateCell::new(ContextState::Pending),
            sigmask: AtomicU64::new(0),
            timers: TimerWheel::new(),
        }
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    /// Marks signal `signum` pending and wakes the loop. Callable from
    /// any thread. The bit is observed by the next ISR pass unless the
    /// loop has already stopped.
    pub fn signal(&self, signum: u8) {
        assert!(signum < SIGNAL_BITS, "signal number out of range");
        self.sigmask.fetch_or(1 << signum, Ordering::AcqRel);
        self.interrupt();
    }

    /// Wakes the loop without raising a signal.
    pub fn interrupt(&self) {
        self.timers.interrupt();
    }

    /// Atomically snapshots and clears the pending signal mask.
    pub(crate) fn take_signals(&self) -> u64 {
        self.sigmask.swap(0, Ordering::AcqRel)
    }
}

impl Default for ContextShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one event loop, cloned into continuations. Not `Send`; all
/// clones live on the loop thread.
#[derive(Clone)]
pub struct AsyncContext {
    shared: Arc<ContextShared>,
    scope: AsyncScope,
    poller: Poller,
}

impl AsyncContext {
    /// A context with a private shared half, for loops driven directly
    /// rather than through a context thread.
    pub fn new() -> io::Result<Self> {
        Self::with_shared(Arc::new(ContextShared::new()))
    }

    pub fn with_shared(shared: Arc<ContextShared>) -> io::Result<Self> {
        Ok(Self { shared, scope: AsyncScope::new(), poller: Poller::new()? })
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn scope(&self) -> &AsyncScope {
        &self.scope
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn timers(&self) -> &TimerWheel {
        self.shared.timers()
    }

    pub fn signal(&self, signum: u8) {
        self.shared.signal(signum);
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Installs the interrupt service routine on the self-pipe's read
    /// end. `routine` runs once immediately — so signals raised before
    /// the pipe existed are drained — and then after every wakeup on
    /// `socket`; returning `false` requests stop on the scope and halts
    /// the respawn. The first failed (or end-of-stream) read retires the
    /// routine without respawning.
    pub fn isr<F>(&self, socket: &SocketDialog, mut routine: F)
    where
        F: FnMut() -> bool + 'static,
    {
        if !routine() {
            self.scope.request_stop();
            return;
        }
        if self.scope.stop_requested() {
            return;
        }
        let dialog = socket.clone();
        ops::drain(self, socket, move |ctx, result| match result {
            Ok(len) if len > 0 => ctx.isr(&dialog, routine),
            Ok(_) => debug!("interrupt pipe closed; isr retiring"),
            Err(error) => debug!(%error, "interrupt pipe read failed; isr retiring"),
        });
    }

    /// Drives the loop to quiescence: resolve timers, wait for readiness
    /// bounded by the next deadline, dispatch, repeat. Exits when the
    /// scope has emptied and a wait completes no work.
    pub fn run(&self) {
        let is_empty = Arc::new(AtomicBool::new(false));
        {
            let is_empty = is_empty.clone();
            self.scope.on_empty(move || is_empty.store(true, Ordering::Release));
        }

        loop {
            let next = self.shared.timers().resolve();
            // Once the scope has drained, never block: the next zero-work
            // wait is the exit condition.
            let timeout = if is_empty.load(Ordering::Acquire) {
                Some(Duration::ZERO)
            } else {
                next
            };

            let ran = match self.poller.wait_for(self, timeout) {
                Ok(ran) => ran,
                Err(error) => {
                    warn!(%error, "multiplexer wait failed; stopping loop");
                    break;
                }
            };

            if ran == 0 && is_empty.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ReadContext;
    use crate::runtime::timer_wheel::INVALID_TIMER;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_returns_immediately_with_empty_scope() {
        let ctx = AsyncContext::new().unwrap();
        ctx.run();
    }

    #[test]
    fn loop_carries_bytes_between_pipe_ends() {
        let ctx = AsyncContext::new().unwrap();
        let fds = crate::net::sockets::socketpair_stream().unwrap();
        let reader = ctx.poller().adopt(fds[0]).unwrap();
        let writer = ctx.poller().adopt(fds[1]).unwrap();

        let received = Rc::new(Cell::new(0usize));
        let rctx = ReadContext::fresh();
        {
            let received = received.clone();
            let rctx = rctx.clone();
            ops::recv(&ctx, &reader, &rctx, move |_ctx, result| {
                received.set(result.unwrap());
            });
        }
        ops::send(&ctx, &writer, b"ping".to_vec(), |_ctx, result| {
            assert_eq!(result.unwrap(), 4);
        });

        ctx.run();

        assert_eq!(received.get(), 4);
        assert_eq!(&rctx.borrow().buffer[..4], b"ping");
    }

    #[test]
    fn connect_completes_against_a_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx = AsyncContext::new().unwrap();
        let handle = crate::net::SocketHandle::stream(libc::AF_INET).unwrap();
        let dialog = ctx.poller().emplace(handle).unwrap();

        let done = Rc::new(Cell::new(false));
        {
            let done = done.clone();
            ops::connect(&ctx, &dialog, addr, move |_ctx, result| {
                result.unwrap();
                done.set(true);
            });
        }
        ctx.run();

        assert!(done.get());
        let _ = listener.accept();
    }

    #[test]
    fn timers_fire_while_the_loop_waits() {
        let ctx = AsyncContext::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        // Keep the scope busy long enough for the timer to expire.
        let fds = crate::net::sockets::socketpair_stream().unwrap();
        let reader = ctx.poller().adopt(fds[0]).unwrap();
        let writer = ctx.poller().adopt(fds[1]).unwrap();
        let rctx = ReadContext::fresh();
        ops::recv(&ctx, &reader, &rctx, |_ctx, _result| {});

        {
            let fired = fired.clone();
            let shared = ctx.shared().clone();
            let release_fd = writer.raw();
            ctx.timers().add_after(
                Duration::from_millis(20),
                move |id| {
                    assert_ne!(id, INVALID_TIMER);
                    fired.fetch_add(1, Ordering::SeqCst);
                    // Unblock the parked read so the loop can drain.
                    let _ = crate::net::sockets::send_socket(release_fd, b"x", 0);
                    shared.interrupt();
                },
                Duration::ZERO,
            );
        }

        ctx.run();
        drop(writer);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
