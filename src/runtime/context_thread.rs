//! A worker-thread owner of one event loop.
//!
//! The context thread spawns a private thread, builds the service there,
//! installs the interrupt service routine, runs the loop to quiescence,
//! and reports lifecycle through the shared state cell. The caller-side
//! surface is `signal` plus lifecycle queries; everything else belongs
//! to the worker.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::net::constants::DRAIN_REARM_INTERVAL;
use crate::net::sockets;
use crate::runtime::context::{AsyncContext, ContextShared, TERMINATE};
use crate::runtime::service::Service;
use crate::runtime::state::ContextState;

/// Constructor for the interrupt self-pipe. Injectable so tests can
/// exercise the creation-failure path without touching the real
/// `socketpair`.
pub type PipeFactory = fn() -> io::Result<[RawFd; 2]>;

/// Owns one async context and one service on a private worker thread.
pub struct ContextThread {
    shared: Arc<ContextShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
    pipe_factory: PipeFactory,
}

impl ContextThread {
    pub fn new() -> Self {
        Self::with_pipe_factory(sockets::socketpair_stream)
    }

    /// A context thread whose self-pipe comes from `factory` instead of
    /// `sockets::socketpair_stream`.
    pub fn with_pipe_factory(factory: PipeFactory) -> Self {
        Self {
            shared: Arc::new(ContextShared::new()),
            worker: Mutex::new(None),
            started: Mutex::new(false),
            pipe_factory: factory,
        }
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn state(&self) -> ContextState {
        self.shared.state().get()
    }

    /// Blocks until the lifecycle satisfies `pred`, at most `timeout`.
    pub fn wait_state(
        &self,
        pred: impl FnMut(ContextState) -> bool,
        timeout: Duration,
    ) -> Option<ContextState> {
        self.shared.state().wait_until_timeout(pred, timeout)
    }

    /// Marks signal `signum` pending on the worker's loop.
    pub fn signal(&self, signum: u8) {
        self.shared.signal(signum);
    }

    /// Spawns the worker thread, which builds the service via `factory`
    /// and serves it until terminated. Fails with `AlreadyStarted` on a
    /// second call; the running worker is unaffected.
    pub fn start<S, F>(&self, factory: F) -> crate::error::Result<()>
    where
        S: Service,
        F: FnOnce() -> Arc<S> + Send + 'static,
    {
        let mut started = self.started.lock();
        if *started {
            return Err(Error::AlreadyStarted);
        }

        let shared = self.shared.clone();
        let pipe_factory = self.pipe_factory;
        let handle = thread::Builder::new()
            .name("coil-context".into())
            .spawn(move || worker_main(shared, pipe_factory, factory))
            .map_err(Error::Io)?;

        *self.worker.lock() = Some(handle);
        *started = true;
        Ok(())
    }
}

impl Default for ContextThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContextThread {
    fn drop(&mut self) {
        if *self.started.lock() {
            self.shared.signal(TERMINATE);
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn worker_main<S, F>(shared: Arc<ContextShared>, pipe_factory: PipeFactory, factory: F)
where
    S: Service,
    F: FnOnce() -> Arc<S>,
{
    let service = factory();

    'serve: {
        let pipe = match pipe_factory() {
            Ok(pipe) => pipe,
            Err(error) => {
                warn!(%error, "interrupt pipe creation failed");
                break 'serve;
            }
        };
        shared.timers().interrupt_source().adopt(pipe);

        let ctx = match AsyncContext::with_shared(shared.clone()) {
            Ok(ctx) => ctx,
            Err(error) => {
                warn!(%error, "multiplexer creation failed");
                break 'serve;
            }
        };

        let Some(reader) = shared.timers().interrupt_source().take_reader() else {
            break 'serve;
        };
        let dialog = match ctx.poller().adopt(reader) {
            Ok(dialog) => dialog,
            Err(error) => {
                warn!(%error, "interrupt pipe registration failed");
                break 'serve;
            }
        };

        let routine = {
            let shared = shared.clone();
            let service = service.clone();
            move || drain_signals(&shared, &service)
        };
        ctx.isr(&dialog, routine);
        drop(dialog);

        Arc::clone(&service).start(&ctx);

        if ctx.scope().stop_requested() {
            // Startup failed; skip Started so observers see the context
            // go straight from Pending to Stopped, and raise terminate
            // so the installed isr drains and the scope empties.
            shared.signal(TERMINATE);
        } else {
            shared.state().set(ContextState::Started);
        }

        ctx.run();
        debug!("event loop drained");
    }

    shared.timers().interrupt_source().close_writer();
    shared.state().set(ContextState::Stopped);
}

/// One ISR pass: snapshot the pending mask, hand each set bit to the
/// service in ascending order, and on terminate arm the safety net that
/// keeps re-firing `signal_handler(TERMINATE)` while the loop drains.
/// Returns `false` to stop the ISR respawn.
fn drain_signals<S: Service>(shared: &Arc<ContextShared>, service: &Arc<S>) -> bool {
    let mask = shared.take_signals();

    let mut bits = mask;
    let mut signum: u8 = 0;
    while bits != 0 {
        if bits & 1 == 1 {
            service.signal_handler(signum);
        }
        bits >>= 1;
        signum += 1;
    }

    if mask & (1 << TERMINATE) != 0 {
        let service = Arc::clone(service);
        shared.timers().add_after(
            DRAIN_REARM_INTERVAL,
            move |_| service.signal_handler(TERMINATE),
            DRAIN_REARM_INTERVAL,
        );
        return false;
    }
    true
}
