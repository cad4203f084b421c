//! Tracking for in-flight continuations on one event loop.
//!
//! The scope is thread-affine (the loop thread spawns and completes);
//! only the stop flag crosses threads, so it lives in an `Arc` while the
//! counter and the on-empty callbacks stay in `Rc`/`Cell` form.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-only view of a scope's stop flag.
#[derive(Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Requesting side of a scope's stop flag; sendable across threads so a
/// service's stop hook can hold one.
#[derive(Clone)]
pub struct StopSource {
    flag: Arc<AtomicBool>,
}

impl StopSource {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

struct ScopeInner {
    live: Cell<usize>,
    on_empty: RefCell<Vec<Box<dyn FnOnce()>>>,
}

/// A set of outstanding continuations with cooperative stop and an
/// on-empty completion hook.
#[derive(Clone)]
pub struct AsyncScope {
    inner: Rc<ScopeInner>,
    stop: Arc<AtomicBool>,
}

impl AsyncScope {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                live: Cell::new(0),
                on_empty: RefCell::new(Vec::new()),
            }),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of continuations currently in flight.
    pub fn live(&self) -> usize {
        self.inner.live.get()
    }

    pub(crate) fn spawned(&self) {
        self.inner.live.set(self.inner.live.get() + 1);
    }

    pub(crate) fn completed(&self) {
        let live = self.inner.live.get();
        debug_assert!(live > 0, "scope completion without a matching spawn");
        let live = live.saturating_sub(1);
        self.inner.live.set(live);
        if live == 0 {
            self.fire_on_empty();
        }
    }

    /// Registers a callback fired when the live count reaches zero.
    /// Fires immediately if the scope is already empty.
    pub fn on_empty(&self, callback: impl FnOnce() + 'static) {
        if self.inner.live.get() == 0 {
            callback();
        } else {
            self.inner.on_empty.borrow_mut().push(Box::new(callback));
        }
    }

    fn fire_on_empty(&self) {
        let callbacks: Vec<_> = self.inner.on_empty.borrow_mut().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stop_token(&self) -> StopToken {
        StopToken { flag: self.stop.clone() }
    }

    pub fn stop_source(&self) -> StopSource {
        StopSource { flag: self.stop.clone() }
    }
}

impl Default for AsyncScope {
    fn default() -> Self {
        Self::new()
    }
}
