//! A virtual CAN bus and the simulated media attached to it.

use cyphal_rs::hal::{CanFrameMeta, CanMedia, Filter, MediaError};
use cyphal_rs::time::{ManualClock, TimePoint};
use cyphal_rs::{Callback, Clock, Executor};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A frame observed on the virtual bus, for assertions.
#[derive(Debug, Clone)]
pub struct LoggedFrame {
    pub can_id: u32,
    pub data: Vec<u8>,
    pub transmitted_at: TimePoint,
}

struct MediaInner {
    executor: Executor,
    clock: ManualClock,
    mtu: usize,
    filters: Vec<Filter>,
    rx_queue: VecDeque<(TimePoint, u32, Vec<u8>)>,
    push_callback: Option<Callback>,
    pop_callback: Option<Callback>,
    /// `false` simulates a busy interface: pushes return `Ok(false)`.
    accept_pushes: bool,
    fail_pushes: Option<MediaError>,
    fail_filters: Option<MediaError>,
}

impl MediaInner {
    fn passes_filters(&self, can_id: u32) -> bool {
        // An empty filter set rejects all traffic.
        self.filters.iter().any(|f| (can_id & f.mask) == (f.id & f.mask))
    }
}

struct BusInner {
    endpoints: Vec<Rc<RefCell<MediaInner>>>,
    frame_log: Vec<LoggedFrame>,
}

/// The shared bus; every frame accepted by any media is delivered to all
/// other attached media whose filters pass it.
#[derive(Clone)]
pub struct VirtualCanBus {
    inner: Rc<RefCell<BusInner>>,
}

impl VirtualCanBus {
    pub fn new() -> Self {
        VirtualCanBus { inner: Rc::new(RefCell::new(BusInner { endpoints: Vec::new(), frame_log: Vec::new() })) }
    }

    /// Attaches a new media interface to the bus.
    pub fn attach(
        &self,
        executor: &Executor,
        clock: &ManualClock,
        mtu: usize,
    ) -> Rc<RefCell<SimulatedCanMedia>> {
        let inner = Rc::new(RefCell::new(MediaInner {
            executor: executor.clone(),
            clock: clock.clone(),
            mtu,
            filters: Vec::new(),
            rx_queue: VecDeque::new(),
            push_callback: None,
            pop_callback: None,
            accept_pushes: true,
            fail_pushes: None,
            fail_filters: None,
        }));
        self.inner.borrow_mut().endpoints.push(inner.clone());
        Rc::new(RefCell::new(SimulatedCanMedia { inner, bus: self.inner.clone() }))
    }

    pub fn frame_log(&self) -> Vec<LoggedFrame> {
        self.inner.borrow().frame_log.clone()
    }

    pub fn clear_log(&self) {
        self.inner.borrow_mut().frame_log.clear();
    }
}

impl Default for VirtualCanBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One simulated CAN interface.
pub struct SimulatedCanMedia {
    inner: Rc<RefCell<MediaInner>>,
    bus: Rc<RefCell<BusInner>>,
}

impl SimulatedCanMedia {
    /// Makes subsequent pushes report a busy interface (`Ok(false)`).
    pub fn set_busy(&self, busy: bool) {
        self.inner.borrow_mut().accept_pushes = !busy;
    }

    pub fn set_push_failure(&self, failure: Option<MediaError>) {
        self.inner.borrow_mut().fail_pushes = failure;
    }

    pub fn set_filter_failure(&self, failure: Option<MediaError>) {
        self.inner.borrow_mut().fail_filters = failure;
    }

    /// Signals readiness after a busy spell, like a real driver would.
    pub fn notify_ready_to_push(&self) {
        let inner = self.inner.borrow();
        if let Some(callback) = &inner.push_callback {
            callback.schedule_at(inner.clock.now());
        }
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.inner.borrow().filters.clone()
    }

    /// Injects a raw frame as if a foreign node had sent it.
    pub fn inject_frame(&self, can_id: u32, data: &[u8]) {
        let now = self.inner.borrow().clock.now();
        deliver(&self.bus, &self.inner, now, can_id, data, true);
    }
}

/// Delivers a frame to every endpoint other than `origin` (or every
/// endpoint including it when `include_origin` is set, for injection).
fn deliver(
    bus: &Rc<RefCell<BusInner>>,
    origin: &Rc<RefCell<MediaInner>>,
    now: TimePoint,
    can_id: u32,
    data: &[u8],
    include_origin: bool,
) {
    let mut bus = bus.borrow_mut();
    bus.frame_log.push(LoggedFrame { can_id, data: data.to_vec(), transmitted_at: now });
    for endpoint in &bus.endpoints {
        if !include_origin && Rc::ptr_eq(endpoint, origin) {
            continue;
        }
        let mut media = endpoint.borrow_mut();
        if !media.passes_filters(can_id) {
            continue;
        }
        media.rx_queue.push_back((now, can_id, data.to_vec()));
        if let Some(callback) = &media.pop_callback {
            callback.schedule_at(now);
        }
    }
}

impl CanMedia for SimulatedCanMedia {
    fn mtu(&self) -> usize {
        self.inner.borrow().mtu
    }

    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(failure) = inner.fail_filters {
            return Err(failure);
        }
        inner.filters = filters.to_vec();
        Ok(())
    }

    fn push(&mut self, deadline: TimePoint, can_id: u32, payload: &[u8]) -> Result<bool, MediaError> {
        let now = {
            let inner = self.inner.borrow();
            if let Some(failure) = inner.fail_pushes {
                return Err(failure);
            }
            if !inner.accept_pushes {
                return Ok(false);
            }
            inner.clock.now()
        };
        if deadline < now {
            // Expired frames are dropped but reported accepted.
            return Ok(true);
        }
        deliver(&self.bus, &self.inner, now, can_id, payload, false);
        Ok(true)
    }

    fn pop(&mut self, buffer: &mut [u8]) -> Result<Option<CanFrameMeta>, MediaError> {
        let mut inner = self.inner.borrow_mut();
        let Some((timestamp, can_id, data)) = inner.rx_queue.pop_front() else {
            return Ok(None);
        };
        let payload_size = data.len().min(buffer.len());
        buffer[..payload_size].copy_from_slice(&data[..payload_size]);
        Ok(Some(CanFrameMeta { timestamp, can_id, payload_size }))
    }

    fn register_push_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError> {
        let callback = self.inner.borrow().executor.register_callback(function);
        self.inner.borrow_mut().push_callback = Some(callback.clone());
        Ok(callback)
    }

    fn register_pop_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError> {
        let callback = self.inner.borrow().executor.register_callback(function);
        self.inner.borrow_mut().pop_callback = Some(callback.clone());
        Ok(callback)
    }
}
