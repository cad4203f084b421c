//! Lifecycle state with wait-on-value semantics.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Lifecycle of an async context. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Pending = 0,
    Started = 1,
    Stopped = 2,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Pending,
            1 => ContextState::Started,
            _ => ContextState::Stopped,
        }
    }
}

/// An atomic `ContextState` bundled with a mutex/condvar pair so threads
/// can wait for a transition; every `set` notifies all waiters.
pub struct StateCell {
    value: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StateCell {
    pub fn new(state: ContextState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> ContextState {
        ContextState::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ContextState) {
        // The store happens under the lock so a waiter cannot observe the
        // old value after deciding to sleep and then miss the notify.
        let _guard = self.lock.lock();
        self.value.store(state as u8, Ordering::Release);
        self.cond.notify_all();
    }

    /// Blocks until `pred` accepts the current state; returns that state.
    pub fn wait_until(&self, mut pred: impl FnMut(ContextState) -> bool) -> ContextState {
        let mut guard = self.lock.lock();
        loop {
            let state = self.get();
            if pred(state) {
                return state;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Bounded `wait_until`; `None` on timeout.
    pub fn wait_until_timeout(
        &self,
        mut pred: impl FnMut(ContextState) -> bool,
        timeout: Duration,
    ) -> Option<ContextState> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let state = self.get();
            if pred(state) {
                return Some(state);
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                let state = self.get();
                return if pred(state) { Some(state) } else { None };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_and_get() {
        let cell = StateCell::new(ContextState::Pending);
        assert_eq!(cell.get(), ContextState::Pending);
        cell.set(ContextState::Started);
        assert_eq!(cell.get(), ContextState::Started);
    }

    #[test]
    fn wait_observes_cross_thread_transition() {
        let cell = Arc::new(StateCell::new(ContextState::Pending));

        let setter = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cell.set(ContextState::Started);
            })
        };

        let state = cell
            .wait_until_timeout(|s| s != ContextState::Pending, Duration::from_secs(5))
            .expect("transition observed");
        assert_eq!(state, ContextState::Started);
        setter.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_transition() {
        let cell = StateCell::new(ContextState::Pending);
        let observed =
            cell.wait_until_timeout(|s| s == ContextState::Stopped, Duration::from_millis(20));
        assert!(observed.is_none());
    }
}
