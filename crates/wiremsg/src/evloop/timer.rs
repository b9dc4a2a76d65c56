//! Monotonic timers driven by the owning loop.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::evloop::EventLoop;

pub(super) type TimerCallback = Rc<RefCell<dyn FnMut()>>;

struct TimerState {
    cb: TimerCallback,
    expiry: Option<Instant>,
    period: Option<Duration>,
}

/// All timers of one loop: states keyed by id, plus a min-heap of
/// expiries. Heap entries are invalidated lazily: an entry counts only
/// while it matches the state's current expiry.
pub(super) struct TimerTable {
    states: HashMap<u64, TimerState>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
}

impl TimerTable {
    pub(super) fn new() -> Self {
        Self {
            states: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }

    pub(super) fn create(&mut self, cb: TimerCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.states.insert(
            id,
            TimerState {
                cb,
                expiry: None,
                period: None,
            },
        );
        id
    }

    pub(super) fn destroy(&mut self, id: u64) {
        self.states.remove(&id);
    }

    pub(super) fn arm(&mut self, id: u64, delay: Duration, period: Option<Duration>) {
        let expiry = Instant::now() + delay;
        if let Some(state) = self.states.get_mut(&id) {
            state.expiry = Some(expiry);
            state.period = period;
            self.heap.push(Reverse((expiry, id)));
        }
    }

    pub(super) fn disarm(&mut self, id: u64) {
        if let Some(state) = self.states.get_mut(&id) {
            state.expiry = None;
            state.period = None;
        }
    }

    fn entry_is_live(&self, expiry: Instant, id: u64) -> bool {
        self.states
            .get(&id)
            .is_some_and(|state| state.expiry == Some(expiry))
    }

    /// Earliest live expiry, dropping stale heap entries on the way.
    pub(super) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((expiry, id))) = self.heap.peek() {
            if self.entry_is_live(expiry, id) {
                return Some(expiry);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every timer due at `now` and re-arm periodic ones.
    ///
    /// Periodic timers re-arm relative to the dispatch instant, so a slow
    /// callback delays later firings instead of bunching them.
    pub(super) fn collect_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(&Reverse((expiry, id))) = self.heap.peek() {
            if expiry > now {
                break;
            }
            self.heap.pop();
            let Some(state) = self.states.get_mut(&id) else {
                continue;
            };
            if state.expiry != Some(expiry) {
                continue;
            }
            due.push(Rc::clone(&state.cb));
            match state.period {
                Some(period) => {
                    let next = now + period;
                    state.expiry = Some(next);
                    self.heap.push(Reverse((next, id)));
                }
                None => state.expiry = None,
            }
        }
        due
    }
}

/// One-shot or periodic timer bound to an [`EventLoop`].
///
/// The callback fires on the loop's thread from `wait_and_process`.
/// Dropping the timer cancels it.
pub struct Timer {
    lp: EventLoop,
    id: u64,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

impl Timer {
    /// Register `cb` on `lp`. The timer starts disarmed.
    pub fn new<F: FnMut() + 'static>(lp: &EventLoop, cb: F) -> Self {
        let id = lp
            .timers()
            .borrow_mut()
            .create(Rc::new(RefCell::new(cb)));
        Self { lp: lp.clone(), id }
    }

    /// Arm for a single firing after `delay`.
    pub fn set(&self, delay: Duration) -> Result<()> {
        self.lp.timers().borrow_mut().arm(self.id, delay, None);
        Ok(())
    }

    /// Arm for a first firing after `delay`, then every `period`.
    pub fn set_periodic(&self, delay: Duration, period: Duration) -> Result<()> {
        self.lp
            .timers()
            .borrow_mut()
            .arm(self.id, delay, Some(period));
        Ok(())
    }

    /// Disarm without destroying; the timer can be armed again.
    pub fn clear(&self) -> Result<()> {
        self.lp.timers().borrow_mut().disarm(self.id);
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.lp.timers().borrow_mut().destroy(self.id);
    }
}
