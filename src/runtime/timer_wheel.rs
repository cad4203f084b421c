//! Monotonic-clock timer wheel resolved cooperatively by the event loop.
//!
//! Callbacks never run on a private thread: the loop calls `resolve` on
//! every iteration and sleeps no longer than the returned duration. The
//! wheel embeds the loop's interrupt source so an `add` from any thread
//! can shorten a sleep already in progress.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::mem;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::runtime::interrupt::InterruptSource;

pub type TimerId = usize;

/// Sentinel id accepted (and ignored) by `remove`.
pub const INVALID_TIMER: TimerId = usize::MAX;

type Handler = Box<dyn FnMut(TimerId) + Send + 'static>;

struct Event {
    /// Taken out of the slot while the handler runs so the lock can be
    /// released around the call.
    handler: Option<Handler>,
    /// Absolute deadline of the next fire.
    start: Instant,
    /// Zero for one-shot, strictly positive for periodic.
    period: Duration,
    armed: bool,
}

/// Heap entry. The heap may hold stale refs for removed or rearmed
/// events; they are skipped at resolution by id/deadline mismatch.
#[derive(Clone, Copy)]
struct EventRef {
    expires_at: Instant,
    id: TimerId,
}

impl PartialEq for EventRef {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl Eq for EventRef {}

impl PartialOrd for EventRef {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventRef {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the std max-heap yields the nearest deadline.
        other.expires_at.cmp(&self.expires_at)
    }
}

#[derive(Default)]
struct WheelState {
    events: Vec<Option<Event>>,
    heap: BinaryHeap<EventRef>,
    free_ids: Vec<TimerId>,
}

/// Min-heap timer container with stable, recycled ids.
pub struct TimerWheel {
    state: Mutex<WheelState>,
    interrupt: InterruptSource,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WheelState::default()),
            interrupt: InterruptSource::new(),
        }
    }

    pub fn interrupt_source(&self) -> &InterruptSource {
        &self.interrupt
    }

    /// Wakes the loop that resolves this wheel.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Arms a timer firing at `when`, periodic when `period` is non-zero.
    /// Recycles a free id when one exists, then wakes the loop so it can
    /// recompute its wait.
    pub fn add(
        &self,
        when: Instant,
        handler: impl FnMut(TimerId) + Send + 'static,
        period: Duration,
    ) -> TimerId {
        let id = {
            let mut state = self.state.lock();
            let id = match state.free_ids.pop() {
                Some(id) => id,
                None => {
                    state.events.push(None);
                    state.events.len() - 1
                }
            };
            state.events[id] = Some(Event {
                handler: Some(Box::new(handler)),
                start: when,
                period,
                armed: true,
            });
            state.heap.push(EventRef { expires_at: when, id });
            id
        };
        self.interrupt.interrupt();
        id
    }

    /// `add` with a relative first deadline.
    pub fn add_after(
        &self,
        delay: Duration,
        handler: impl FnMut(TimerId) + Send + 'static,
        period: Duration,
    ) -> TimerId {
        self.add(Instant::now() + delay, handler, period)
    }

    /// Disarms the timer and returns its id to the free list. The event
    /// record stays behind until the heap surfaces its ref. Unknown ids
    /// and `INVALID_TIMER` are ignored.
    pub fn remove(&self, id: TimerId) {
        if id == INVALID_TIMER {
            return;
        }
        let mut state = self.state.lock();
        let Some(Some(event)) = state.events.get_mut(id) else {
            return;
        };
        if !event.armed {
            return;
        }
        event.armed = false;
        event.handler = None;
        state.free_ids.push(id);
    }

    /// Fires every handler whose deadline has passed and reports how long
    /// the loop may sleep before the next live deadline. `None` means the
    /// wheel holds no armed timer.
    ///
    /// Expired refs are collected in one batch before any handler runs,
    /// so a handler that re-enters `add` cannot fire in the same pass.
    /// The lock is released around each handler invocation; `add` and
    /// `remove` from inside a handler are permitted.
    pub fn resolve(&self) -> Option<Duration> {
        let now = Instant::now();

        let due: Vec<EventRef> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            while let Some(top) = state.heap.peek().copied() {
                if top.expires_at > now {
                    break;
                }
                state.heap.pop();
                due.push(top);
            }
            due
        };

        for eref in due {
            self.dispatch(eref);
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        loop {
            let top = state.heap.peek().copied()?;
            let live = matches!(
                state.events.get(top.id),
                Some(Some(event)) if event.armed && event.start == top.expires_at
            );
            if !live {
                state.heap.pop();
                continue;
            }
            return Some(top.expires_at.saturating_duration_since(now));
        }
    }

    fn dispatch(&self, eref: EventRef) {
        let mut handler = {
            let mut state = self.state.lock();
            let Some(Some(event)) = state.events.get_mut(eref.id) else {
                return;
            };
            if !event.armed || event.start != eref.expires_at {
                return; // stale ref
            }
            match event.handler.take() {
                Some(handler) => handler,
                None => return,
            }
        };

        handler(eref.id);

        let mut state = self.state.lock();
        let Some(Some(event)) = state.events.get_mut(eref.id) else {
            return;
        };
        // The handler may have removed this timer, or removed it and let
        // another `add` recycle the id; both show up as an unarm or a
        // deadline mismatch and the fired incarnation is dropped.
        if !event.armed || event.start != eref.expires_at {
            return;
        }
        if event.period > Duration::ZERO {
            event.start += event.period;
            event.handler = Some(handler);
            let expires_at = event.start;
            state.heap.push(EventRef { expires_at, id: eref.id });
        } else {
            event.armed = false;
            state.free_ids.push(eref.id);
        }
    }

    /// Exchanges the timer state of two wheels, taking both locks in
    /// address order. The interrupt descriptors travel with the state.
    pub fn swap(&self, other: &TimerWheel) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (first, second) = if (self as *const TimerWheel) < (other as *const TimerWheel) {
            (self, other)
        } else {
            (other, self)
        };
        let mut a = first.state.lock();
        let mut b = second.state.lock();
        mem::swap(&mut *a, &mut *b);
        first.interrupt.swap_with(&second.interrupt);
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_id_is_zero() {
        let wheel = TimerWheel::new();
        let id = wheel.add_after(Duration::from_millis(100), |_| {}, Duration::ZERO);
        assert_eq!(id, 0);
    }

    #[test]
    fn remove_invalid_is_noop() {
        let wheel = TimerWheel::new();
        wheel.remove(INVALID_TIMER);
        wheel.remove(17);
    }

    #[test]
    fn id_reuse_after_remove_and_resolve() {
        let wheel = TimerWheel::new();

        let first = wheel.add_after(Duration::from_millis(100), |_| {}, Duration::ZERO);
        assert_eq!(first, 0);
        wheel.remove(first);
        wheel.resolve();

        let second = wheel.add_after(Duration::from_millis(100), |_| {}, Duration::ZERO);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_wheel_resolves_to_none() {
        let wheel = TimerWheel::new();
        assert!(wheel.resolve().is_none());
    }

    #[test]
    fn next_deadline_bounds_the_wait() {
        let wheel = TimerWheel::new();
        wheel.add_after(Duration::from_millis(200), |_| {}, Duration::ZERO);
        wheel.add_after(Duration::from_millis(50), |_| {}, Duration::ZERO);

        let next = wheel.resolve().expect("armed wheel reports a deadline");
        assert!(next <= Duration::from_millis(50));
    }

    #[test]
    fn removed_timer_does_not_fire() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let id = {
            let fired = fired.clone();
            wheel.add_after(
                Duration::from_millis(1),
                move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
            )
        };
        wheel.remove(id);

        thread::sleep(Duration::from_millis(5));
        wheel.resolve();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_shot_fires_once_and_recycles() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let id = {
            let fired = fired.clone();
            wheel.add_after(
                Duration::from_millis(1),
                move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
            )
        };

        thread::sleep(Duration::from_millis(5));
        wheel.resolve();
        wheel.resolve();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // One-shot completion recycles the id for the next add.
        let next = wheel.add_after(Duration::from_millis(100), |_| {}, Duration::ZERO);
        assert_eq!(next, id);
    }

    #[test]
    fn periodic_cadence_within_one_fire() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let period = Duration::from_millis(20);
        {
            let fired = fired.clone();
            wheel.add_after(
                period,
                move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                period,
            );
        }

        let span = Duration::from_millis(100);
        let deadline = Instant::now() + span;
        while Instant::now() < deadline {
            wheel.resolve();
            thread::sleep(Duration::from_millis(2));
        }
        wheel.resolve();

        // floor(span / period) plus or minus one under a non-starved loop,
        // widened slightly for scheduler jitter.
        let count = fired.load(Ordering::SeqCst);
        assert!((3..=7).contains(&count), "unexpected periodic fire count {count}");
    }

    #[test]
    fn handler_may_rearm_from_inside_the_wheel() {
        let wheel = Arc::new(TimerWheel::new());
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            let rearm = wheel.clone();
            wheel.add_after(
                Duration::from_millis(1),
                move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    let fired = fired.clone();
                    rearm.add_after(
                        Duration::from_millis(1),
                        move |_| {
                            fired.fetch_add(1, Ordering::SeqCst);
                        },
                        Duration::ZERO,
                    );
                },
                Duration::ZERO,
            );
        }

        thread::sleep(Duration::from_millis(3));
        // First pass fires only the original timer even though the newly
        // added one is already due.
        wheel.resolve();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(3));
        wheel.resolve();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn swap_exchanges_pending_events() {
        let a = TimerWheel::new();
        let b = TimerWheel::new();
        a.add_after(Duration::from_millis(50), |_| {}, Duration::ZERO);

        a.swap(&b);
        assert!(a.resolve().is_none());
        assert!(b.resolve().is_some());

        a.swap(&a);
    }

    #[test]
    fn cross_thread_add_is_visible() {
        let wheel = Arc::new(TimerWheel::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = {
            let wheel = wheel.clone();
            let fired = fired.clone();
            thread::spawn(move || {
                wheel.add_after(
                    Duration::from_millis(1),
                    move |_| {
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                    Duration::ZERO,
                );
            })
        };
        handle.join().unwrap();

        thread::sleep(Duration::from_millis(5));
        wheel.resolve();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
