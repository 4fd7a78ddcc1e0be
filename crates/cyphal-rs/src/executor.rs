//! Single-threaded, monotonic-time driven callback scheduler.
//!
//! All deferred work in the stack (timers, media readiness, service
//! deadlines) runs through one executor instance. The application drives
//! it from its main loop:
//!
//! ```ignore
//! loop {
//!     let result = executor.spin_once();
//!     sleep_until(result.next_deadline.unwrap_or(executor.now() + max_idle));
//! }
//! ```

use crate::time::{Clock, Duration, TimePoint};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

type CallbackId = u64;
type CallbackFn = Box<dyn FnMut(TimePoint)>;

struct CallbackNode {
    /// Taken out of the node for the duration of an invocation so the
    /// core is not borrowed while user code runs.
    function: Option<CallbackFn>,
    /// Auto-remove nodes are unregistered after their first execution.
    auto_remove: bool,
    /// Key into the scheduled set, if currently scheduled.
    scheduled_key: Option<(TimePoint, u64)>,
    /// Fixed-rate re-arm interval, if scheduled periodically.
    period: Option<Duration>,
}

#[derive(Default)]
struct ExecutorCore {
    /// All live callbacks, keyed by their monotonically allocated id.
    registered: BTreeMap<CallbackId, CallbackNode>,
    /// Scheduled subset ordered by execution time. The sequence counter
    /// breaks ties: of two callbacks due at the same instant, the one
    /// scheduled earlier fires first.
    scheduled: BTreeMap<(TimePoint, u64), CallbackId>,
    last_callback_id: CallbackId,
    last_sequence: u64,
}

impl ExecutorCore {
    fn unschedule(&mut self, id: CallbackId) {
        if let Some(node) = self.registered.get_mut(&id) {
            if let Some(key) = node.scheduled_key.take() {
                self.scheduled.remove(&key);
            }
            node.period = None;
        }
    }

    fn schedule(&mut self, id: CallbackId, at: TimePoint, period: Option<Duration>) {
        // A second schedule supersedes the first.
        let Some(node) = self.registered.get_mut(&id) else {
            return;
        };
        if let Some(key) = node.scheduled_key.take() {
            self.scheduled.remove(&key);
        }
        self.last_sequence += 1;
        let key = (at, self.last_sequence);
        node.scheduled_key = Some(key);
        node.period = period;
        self.scheduled.insert(key, id);
    }

    fn remove(&mut self, id: CallbackId) {
        if let Some(node) = self.registered.remove(&id) {
            if let Some(key) = node.scheduled_key {
                self.scheduled.remove(&key);
            }
        }
    }
}

/// The result of one [`Executor::spin_once`] pass.
#[derive(Debug, Clone, Copy)]
pub struct SpinResult {
    /// Execution time of the next scheduled callback, if any. Lets the
    /// application sleep until there is work to do. When present, it is
    /// strictly in the future relative to the spin's last clock reading.
    pub next_deadline: Option<TimePoint>,
    /// Approximation of the worst scheduling lateness observed during the
    /// pass (the real slack may be worse). Never negative.
    pub worst_lateness: Duration,
}

struct CallbackRegistration {
    core: Weak<RefCell<ExecutorCore>>,
    clock: Rc<dyn Clock>,
    id: CallbackId,
}

impl Drop for CallbackRegistration {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().remove(self.id);
        }
    }
}

/// Handle to a registered callback.
///
/// The handle does not keep the executor alive; once the executor is gone
/// every operation is a silent no-op. Clones share one registration: the
/// callback is unregistered when the last clone is dropped. If it is
/// executing at that moment it completes, but it will not fire again.
#[derive(Clone)]
pub struct Callback {
    registration: Rc<CallbackRegistration>,
}

impl Callback {
    /// (Re)schedules the callback to run once at `t`.
    pub fn schedule_at(&self, t: TimePoint) {
        if let Some(core) = self.registration.core.upgrade() {
            core.borrow_mut().schedule(self.registration.id, t, None);
        }
    }

    /// (Re)schedules the callback to run once after `d` from now.
    pub fn schedule_after(&self, d: Duration) {
        self.schedule_at(self.registration.clock.now() + d);
    }

    /// (Re)schedules the callback at `first` and thereafter at a fixed
    /// rate of one execution per `period`, without drift accumulation.
    pub fn schedule_periodic(&self, period: Duration, first: TimePoint) {
        if let Some(core) = self.registration.core.upgrade() {
            core.borrow_mut().schedule(self.registration.id, first, Some(period));
        }
    }

    /// Removes the callback from the scheduled set without unregistering
    /// it; a later `schedule_*` call arms it again.
    pub fn cancel(&self) {
        if let Some(core) = self.registration.core.upgrade() {
            core.borrow_mut().unschedule(self.registration.id);
        }
    }
}

/// The callback scheduler. Cheap to clone; clones share one core.
#[derive(Clone)]
pub struct Executor {
    core: Rc<RefCell<ExecutorCore>>,
    clock: Rc<dyn Clock>,
}

impl Executor {
    /// Creates an executor driven by the OS monotonic clock.
    #[cfg(feature = "std")]
    pub fn new() -> Self {
        Self::with_clock(Rc::new(crate::time::SystemClock::new()))
    }

    /// Creates an executor driven by a caller-supplied clock.
    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Executor { core: Rc::new(RefCell::new(ExecutorCore::default())), clock }
    }

    /// Current monotonic time.
    pub fn now(&self) -> TimePoint {
        self.clock.now()
    }

    /// Registers a persistent callback. It is not scheduled yet; arm it
    /// through the returned handle.
    pub fn register_callback<F>(&self, function: F) -> Callback
    where
        F: FnMut(TimePoint) + 'static,
    {
        self.register(Box::new(function), false)
    }

    /// Registers a one-shot callback that unregisters itself after its
    /// first execution. The handle stays valid but further scheduling
    /// becomes a no-op once the callback has fired.
    pub fn register_deferred_callback<F>(&self, function: F) -> Callback
    where
        F: FnMut(TimePoint) + 'static,
    {
        self.register(Box::new(function), true)
    }

    fn register(&self, function: CallbackFn, auto_remove: bool) -> Callback {
        let mut core = self.core.borrow_mut();
        core.last_callback_id += 1;
        let id = core.last_callback_id;
        core.registered.insert(
            id,
            CallbackNode { function: Some(function), auto_remove, scheduled_key: None, period: None },
        );
        Callback {
            registration: Rc::new(CallbackRegistration {
                core: Rc::downgrade(&self.core),
                clock: self.clock.clone(),
                id,
            }),
        }
    }

    /// Executes every scheduled callback whose execution time has passed,
    /// in deadline order with FIFO tie-break, then returns.
    ///
    /// A callback re-scheduling itself from its own body never fires
    /// twice for the same tick: the node leaves the scheduled set before
    /// its function is invoked.
    pub fn spin_once(&self) -> SpinResult {
        let mut result = SpinResult { next_deadline: None, worst_lateness: Duration::ZERO };
        let mut approx_now = TimePoint::MIN;

        loop {
            // Pick the earliest due callback and detach its function so
            // user code runs without the core borrowed.
            let (id, function, auto_remove) = {
                let mut core = self.core.borrow_mut();
                let Some((&key, &id)) = core.scheduled.iter().next() else {
                    break;
                };
                let (exec_time, _) = key;
                if approx_now < exec_time {
                    approx_now = self.clock.now();
                    if approx_now < exec_time {
                        result.next_deadline = Some(exec_time);
                        break;
                    }
                }
                result.worst_lateness = result.worst_lateness.max(approx_now - exec_time);

                core.scheduled.remove(&key);
                let (period, function, auto_remove) = match core.registered.get_mut(&id) {
                    Some(node) => {
                        node.scheduled_key = None;
                        (node.period, node.function.take(), node.auto_remove)
                    }
                    None => continue,
                };
                // Fixed-rate periodic callbacks are re-armed relative to
                // their nominal execution time, before the invocation.
                if let Some(period) = period {
                    core.schedule(id, exec_time + period, Some(period));
                }
                (id, function, auto_remove)
            };

            if let Some(mut function) = function {
                function(approx_now);

                let mut core = self.core.borrow_mut();
                if auto_remove {
                    core.remove(id);
                } else if let Some(node) = core.registered.get_mut(&id) {
                    // The node may have been unregistered from within its
                    // own body; only then is it left without a function.
                    if node.function.is_none() {
                        node.function = Some(function);
                    }
                }
            }
        }

        result
    }
}

#[cfg(feature = "std")]
impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

// --- Unit Tests ---
