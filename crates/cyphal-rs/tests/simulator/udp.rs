//! A virtual UDP multicast network and the simulated media attached to
//! it.

use cyphal_rs::hal::{MediaError, UdpDatagramMeta, UdpEndpoint, UdpMedia, UdpRxSocket, UdpTxSocket};
use cyphal_rs::time::{ManualClock, TimePoint};
use cyphal_rs::{Callback, Clock, Executor};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A datagram observed on the virtual network, for assertions.
#[derive(Debug, Clone)]
pub struct LoggedDatagram {
    pub destination: UdpEndpoint,
    pub data: Vec<u8>,
}

struct RxSocketInner {
    group: UdpEndpoint,
    queue: VecDeque<(TimePoint, UdpEndpoint, Vec<u8>)>,
    pop_callback: Option<Callback>,
}

struct NetworkInner {
    sockets: Vec<Rc<RefCell<RxSocketInner>>>,
    datagram_log: Vec<LoggedDatagram>,
}

/// Shared network: a datagram sent to a group lands in the queue of
/// every socket joined to that group, across all interfaces.
#[derive(Clone)]
pub struct VirtualUdpNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

impl VirtualUdpNetwork {
    pub fn new() -> Self {
        VirtualUdpNetwork {
            inner: Rc::new(RefCell::new(NetworkInner { sockets: Vec::new(), datagram_log: Vec::new() })),
        }
    }

    /// Creates one interface attached to this network.
    pub fn attach(
        &self,
        executor: &Executor,
        clock: &ManualClock,
        mtu: usize,
    ) -> Rc<RefCell<SimulatedUdpMedia>> {
        Rc::new(RefCell::new(SimulatedUdpMedia {
            network: self.inner.clone(),
            executor: executor.clone(),
            clock: clock.clone(),
            mtu,
        }))
    }

    pub fn datagram_log(&self) -> Vec<LoggedDatagram> {
        self.inner.borrow().datagram_log.clone()
    }

    /// Injects a raw datagram as if a foreign host had sent it.
    pub fn inject(&self, destination: UdpEndpoint, data: &[u8], now: TimePoint) {
        deliver(&self.inner, destination, data, now);
    }
}

impl Default for VirtualUdpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(network: &Rc<RefCell<NetworkInner>>, destination: UdpEndpoint, data: &[u8], now: TimePoint) {
    let mut network = network.borrow_mut();
    network
        .datagram_log
        .push(LoggedDatagram { destination, data: data.to_vec() });
    let source = UdpEndpoint { ip: [127, 0, 0, 1], port: destination.port };
    for socket in &network.sockets {
        let mut socket = socket.borrow_mut();
        if socket.group != destination {
            continue;
        }
        socket.queue.push_back((now, source, data.to_vec()));
        if let Some(callback) = &socket.pop_callback {
            callback.schedule_at(now);
        }
    }
}

/// One simulated UDP interface.
pub struct SimulatedUdpMedia {
    network: Rc<RefCell<NetworkInner>>,
    executor: Executor,
    clock: ManualClock,
    mtu: usize,
}

impl UdpMedia for SimulatedUdpMedia {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn make_tx_socket(&mut self) -> Result<Box<dyn UdpTxSocket>, MediaError> {
        Ok(Box::new(SimulatedTxSocket {
            network: self.network.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
        }))
    }

    fn make_rx_socket(&mut self, endpoint: UdpEndpoint) -> Result<Box<dyn UdpRxSocket>, MediaError> {
        let inner = Rc::new(RefCell::new(RxSocketInner {
            group: endpoint,
            queue: VecDeque::new(),
            pop_callback: None,
        }));
        self.network.borrow_mut().sockets.push(inner.clone());
        Ok(Box::new(SimulatedRxSocket {
            network: self.network.clone(),
            executor: self.executor.clone(),
            inner,
        }))
    }
}

struct SimulatedTxSocket {
    network: Rc<RefCell<NetworkInner>>,
    executor: Executor,
    clock: ManualClock,
}

impl UdpTxSocket for SimulatedTxSocket {
    fn send(
        &mut self,
        deadline: TimePoint,
        destination: UdpEndpoint,
        payload: &[u8],
    ) -> Result<bool, MediaError> {
        let now = self.clock.now();
        if deadline < now {
            return Ok(true);
        }
        deliver(&self.network, destination, payload, now);
        Ok(true)
    }

    fn register_push_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError> {
        Ok(self.executor.register_callback(function))
    }
}

struct SimulatedRxSocket {
    network: Rc<RefCell<NetworkInner>>,
    executor: Executor,
    inner: Rc<RefCell<RxSocketInner>>,
}

impl UdpRxSocket for SimulatedRxSocket {
    fn pop(&mut self, buffer: &mut [u8]) -> Result<Option<UdpDatagramMeta>, MediaError> {
        let mut inner = self.inner.borrow_mut();
        let Some((timestamp, source, data)) = inner.queue.pop_front() else {
            return Ok(None);
        };
        let payload_size = data.len().min(buffer.len());
        buffer[..payload_size].copy_from_slice(&data[..payload_size]);
        Ok(Some(UdpDatagramMeta { timestamp, source, payload_size }))
    }

    fn register_pop_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError> {
        let callback = self.executor.register_callback(function);
        self.inner.borrow_mut().pop_callback = Some(callback.clone());
        Ok(callback)
    }
}

impl Drop for SimulatedRxSocket {
    fn drop(&mut self) {
        // Leaving the multicast group.
        self.network
            .borrow_mut()
            .sockets
            .retain(|socket| !Rc::ptr_eq(socket, &self.inner));
    }
}
