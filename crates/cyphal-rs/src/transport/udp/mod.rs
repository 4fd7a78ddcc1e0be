//! Cyphal/UDP transport: multicast for subjects, per-destination-node
//! groups for services.
//!
//! Each transfer travels as one or more datagrams with the fixed 24-byte
//! header up front and the payload CRC-32C at the end of the stream.
//! Every RX session owns one socket per network interface, joined to the
//! multicast group derived from its port or the local node.

pub mod endpoint;
mod rx;

use crate::executor::{Callback, Executor};
use crate::frame::codec::Codec;
use crate::frame::crc::Crc32C;
use crate::frame::udp_header::{DataSpecifier, UdpHeader, HEADER_SIZE};
use crate::hal::{CyphalError, UdpEndpoint, UdpMedia, UdpRxSocket, UdpTxSocket};
use crate::time::TimePoint;
use crate::transport::session_tree::SessionTree;
use crate::transport::{
    Config, Counters, MessageRxCallback, MessageRxParams, MessageRxSession, MessageRxTransfer,
    MessageTxParams, MessageTxSession, ProtocolParams, RequestRxParams, RequestRxSession,
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams,
    ResponseTxSession, RxMetadata, ServiceRxCallback, ServiceRxTransfer, Transport, TxMetadata,
};
use crate::types::{
    NodeId, PortId, Priority, TransferId, TransferKind, SERVICE_ID_MAX, SUBJECT_ID_MAX,
    UDP_NODE_ID_MAX, UDP_NODE_ID_UNSET,
};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::{Rc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use log::{debug, trace, warn};

/// Sizes the datagram pop buffer; larger datagrams are truncated and
/// will fail reassembly.
const MAX_DATAGRAM: usize = 9000;

struct TxDatagram {
    destination: UdpEndpoint,
    payload: Vec<u8>,
    deadline: TimePoint,
}

struct UdpMediaSlot {
    media: Rc<RefCell<dyn UdpMedia>>,
    tx_socket: Box<dyn UdpTxSocket>,
    tx_queue: BTreeMap<(Priority, TimePoint, u64), TxDatagram>,
    push_callback: Option<Callback>,
}

struct SocketSlot {
    socket: Box<dyn UdpRxSocket>,
    #[allow(dead_code)] // held for its Drop side effect (unregistration)
    pop_callback: Option<Callback>,
}

struct MsgRxState {
    extent: usize,
    callback: Option<MessageRxCallback>,
    sockets: Vec<SocketSlot>,
    reassembly: BTreeMap<u16, rx::UdpReassembler>,
}

struct SvcRxState {
    extent: usize,
    callback: Option<ServiceRxCallback>,
    sockets: Vec<SocketSlot>,
    reassembly: BTreeMap<u16, rx::UdpReassembler>,
}

/// Which session a socket pop callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKey {
    Message(PortId),
    Request(PortId),
    Response(PortId, NodeId),
}

enum Delivery {
    Message { subject_id: PortId, transfer: MessageRxTransfer },
    Request { service_id: PortId, transfer: ServiceRxTransfer },
    Response { key: (PortId, NodeId), transfer: ServiceRxTransfer },
}

struct UdpCore {
    executor: Executor,
    local_node_id: Option<NodeId>,
    config: Config,
    media: Vec<UdpMediaSlot>,
    tx_ports: BTreeSet<(TransferKind, PortId)>,
    msg_sessions: SessionTree<PortId, MsgRxState>,
    req_sessions: SessionTree<PortId, SvcRxState>,
    resp_sessions: SessionTree<(PortId, NodeId), SvcRxState>,
    counters: Counters,
    tx_sequence: u64,
}

/// The Cyphal/UDP transport handle.
pub struct UdpTransport {
    core: Rc<RefCell<UdpCore>>,
}

impl UdpTransport {
    pub fn new(
        executor: &Executor,
        media: Vec<Rc<RefCell<dyn UdpMedia>>>,
        local_node_id: Option<NodeId>,
        config: Config,
    ) -> Result<UdpTransport, CyphalError> {
        if media.is_empty() {
            return Err(CyphalError::Argument("at least one media interface required"));
        }
        if let Some(node_id) = local_node_id {
            if node_id.0 > UDP_NODE_ID_MAX {
                return Err(CyphalError::Argument("node id exceeds the UDP limit"));
            }
        }

        let core = Rc::new(RefCell::new(UdpCore {
            executor: executor.clone(),
            local_node_id,
            config,
            media: Vec::new(),
            tx_ports: BTreeSet::new(),
            msg_sessions: SessionTree::new(),
            req_sessions: SessionTree::new(),
            resp_sessions: SessionTree::new(),
            counters: Counters::default(),
            tx_sequence: 0,
        }));

        for (index, media) in media.into_iter().enumerate() {
            let mut tx_socket = media.borrow_mut().make_tx_socket()?;
            let push_callback = tx_socket.register_push_callback(Box::new({
                let weak = Rc::downgrade(&core);
                move |now| {
                    if let Some(core) = weak.upgrade() {
                        drain_tx(&core, index, now);
                    }
                }
            }))?;
            core.borrow_mut().media.push(UdpMediaSlot {
                media,
                tx_socket,
                tx_queue: BTreeMap::new(),
                push_callback: Some(push_callback),
            });
        }

        Ok(UdpTransport { core })
    }

    fn validate_service_params(&self, service_id: PortId) -> Result<(), CyphalError> {
        if service_id > SERVICE_ID_MAX {
            return Err(CyphalError::Argument("service id out of range"));
        }
        if self.core.borrow().local_node_id.is_none() {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        }
        Ok(())
    }

    /// Opens one RX socket per interface for `group`, wiring its pop
    /// callback to the given session. Undone by the caller on error.
    fn open_sockets(&self, group: UdpEndpoint, key: SessionKey) -> Result<Vec<SocketSlot>, CyphalError> {
        let media_list: Vec<_> =
            self.core.borrow().media.iter().map(|slot| slot.media.clone()).collect();
        let mut sockets = Vec::with_capacity(media_list.len());
        for media in media_list {
            let mut socket = media.borrow_mut().make_rx_socket(group)?;
            let socket_index = sockets.len();
            let pop_callback = socket.register_pop_callback(Box::new({
                let weak = Rc::downgrade(&self.core);
                move |now| {
                    if let Some(core) = weak.upgrade() {
                        process_socket_pop(&core, key, socket_index, now);
                    }
                }
            }))?;
            sockets.push(SocketSlot { socket, pop_callback: Some(pop_callback) });
        }
        Ok(sockets)
    }
}

impl Transport for UdpTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.core.borrow().local_node_id
    }

    fn protocol_params(&self) -> ProtocolParams {
        let core = self.core.borrow();
        let mtu = core
            .media
            .iter()
            .map(|slot| slot.media.borrow().mtu())
            .min()
            .unwrap_or(0);
        ProtocolParams {
            // The UDP transfer-id space is the full 64-bit range; the
            // modulo is represented saturated.
            transfer_id_modulo: TransferId::MAX,
            max_nodes: UDP_NODE_ID_MAX,
            mtu,
        }
    }

    fn make_message_tx_session(
        &self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, CyphalError> {
        if params.subject_id > SUBJECT_ID_MAX {
            return Err(CyphalError::Argument("subject id out of range"));
        }
        self.core.borrow_mut().claim_tx_port(TransferKind::Message, params.subject_id)?;
        Ok(Box::new(UdpMessageTxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_message_rx_session(
        &self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, CyphalError> {
        if params.subject_id > SUBJECT_ID_MAX {
            return Err(CyphalError::Argument("subject id out of range"));
        }
        if params.extent_bytes == 0 {
            return Err(CyphalError::Argument("extent must be positive"));
        }
        self.core.borrow_mut().msg_sessions.ensure_new(params.subject_id, || MsgRxState {
            extent: params.extent_bytes,
            callback: None,
            sockets: Vec::new(),
            reassembly: BTreeMap::new(),
        })?;
        match self.open_sockets(
            endpoint::subject_endpoint(params.subject_id),
            SessionKey::Message(params.subject_id),
        ) {
            Ok(sockets) => {
                let mut core = self.core.borrow_mut();
                if let Some(state) = core.msg_sessions.get_mut(&params.subject_id) {
                    state.sockets = sockets;
                }
                Ok(Box::new(UdpMessageRxSession { core: Rc::downgrade(&self.core), params }))
            }
            Err(e) => {
                self.core.borrow_mut().msg_sessions.remove(&params.subject_id);
                Err(e)
            }
        }
    }

    fn make_request_tx_session(
        &self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if params.server_node_id.0 > UDP_NODE_ID_MAX {
            return Err(CyphalError::Argument("server node id exceeds the UDP limit"));
        }
        self.core.borrow_mut().claim_tx_port(TransferKind::Request, params.service_id)?;
        Ok(Box::new(UdpRequestTxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_request_rx_session(
        &self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if params.extent_bytes == 0 {
            return Err(CyphalError::Argument("extent must be positive"));
        }
        let local = self.core.borrow().local_node_id;
        let Some(local) = local else {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        };
        self.core.borrow_mut().req_sessions.ensure_new(params.service_id, || SvcRxState {
            extent: params.extent_bytes,
            callback: None,
            sockets: Vec::new(),
            reassembly: BTreeMap::new(),
        })?;
        match self
            .open_sockets(endpoint::node_endpoint(local.0), SessionKey::Request(params.service_id))
        {
            Ok(sockets) => {
                let mut core = self.core.borrow_mut();
                if let Some(state) = core.req_sessions.get_mut(&params.service_id) {
                    state.sockets = sockets;
                }
                Ok(Box::new(UdpRequestRxSession { core: Rc::downgrade(&self.core), params }))
            }
            Err(e) => {
                self.core.borrow_mut().req_sessions.remove(&params.service_id);
                Err(e)
            }
        }
    }

    fn make_response_tx_session(
        &self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        self.core.borrow_mut().claim_tx_port(TransferKind::Response, params.service_id)?;
        Ok(Box::new(UdpResponseTxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_response_rx_session(
        &self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if params.extent_bytes == 0 {
            return Err(CyphalError::Argument("extent must be positive"));
        }
        if params.server_node_id.0 > UDP_NODE_ID_MAX {
            return Err(CyphalError::Argument("server node id exceeds the UDP limit"));
        }
        let local = self.core.borrow().local_node_id;
        let Some(local) = local else {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        };
        let key = (params.service_id, params.server_node_id);
        self.core.borrow_mut().resp_sessions.ensure_new(key, || SvcRxState {
            extent: params.extent_bytes,
            callback: None,
            sockets: Vec::new(),
            reassembly: BTreeMap::new(),
        })?;
        match self.open_sockets(
            endpoint::node_endpoint(local.0),
            SessionKey::Response(params.service_id, params.server_node_id),
        ) {
            Ok(sockets) => {
                let mut core = self.core.borrow_mut();
                if let Some(state) = core.resp_sessions.get_mut(&key) {
                    state.sockets = sockets;
                }
                Ok(Box::new(UdpResponseRxSession { core: Rc::downgrade(&self.core), params }))
            }
            Err(e) => {
                self.core.borrow_mut().resp_sessions.remove(&key);
                Err(e)
            }
        }
    }

    fn counters(&self) -> Counters {
        self.core.borrow().counters
    }
}

impl UdpCore {
    fn claim_tx_port(&mut self, kind: TransferKind, port_id: PortId) -> Result<(), CyphalError> {
        if !self.tx_ports.insert((kind, port_id)) {
            return Err(CyphalError::AlreadyExists);
        }
        Ok(())
    }

    /// Splits one transfer into datagrams for every interface and
    /// enqueues them. All-or-nothing across interfaces, like CAN.
    fn enqueue_transfer(
        &mut self,
        header: UdpHeader,
        destination: UdpEndpoint,
        metadata: &TxMetadata,
        payload: &[u8],
    ) -> Result<(), CyphalError> {
        let mut fragmented: Vec<Vec<TxDatagram>> = Vec::with_capacity(self.media.len());
        for slot in &self.media {
            let mtu = slot.media.borrow().mtu();
            let datagrams = build_datagrams(header, destination, payload, mtu, metadata.deadline)?;
            if slot.tx_queue.len() + datagrams.len() > self.config.tx_queue_capacity_per_media {
                return Err(CyphalError::Capacity);
            }
            fragmented.push(datagrams);
        }

        let now = self.executor.now();
        for (slot, datagrams) in self.media.iter_mut().zip(fragmented) {
            for datagram in datagrams {
                self.tx_sequence += 1;
                slot.tx_queue
                    .insert((metadata.priority, metadata.deadline, self.tx_sequence), datagram);
            }
            if let Some(callback) = &slot.push_callback {
                callback.schedule_at(now);
            }
        }
        Ok(())
    }

    /// Parses one datagram and feeds it into the session identified by
    /// `key`, if it actually belongs there.
    fn process_datagram(
        &mut self,
        key: SessionKey,
        timestamp: TimePoint,
        data: &[u8],
        deliveries: &mut Vec<Delivery>,
    ) {
        let UdpCore { local_node_id, config, msg_sessions, req_sessions, resp_sessions, counters, .. } =
            self;

        let header = match UdpHeader::deserialize(data) {
            Ok(header) => header,
            Err(e) => {
                trace!("Dropping malformed datagram: {}", e);
                Counters::bump(&mut counters.rx_frames_rejected);
                return;
            }
        };
        let payload = &data[HEADER_SIZE..];

        match key {
            SessionKey::Message(subject_id) => {
                if header.data_specifier != DataSpecifier::Subject(subject_id) {
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                }
                let Some(state) = msg_sessions.get_mut(&subject_id) else { return };
                let reassembler = state
                    .reassembly
                    .entry(header.source)
                    .or_insert_with(rx::UdpReassembler::new);
                if let Some(completed) = reassembler.accept(
                    &header,
                    payload,
                    timestamp,
                    state.extent,
                    config.transfer_id_timeout,
                    counters,
                ) {
                    let source = if header.source == UDP_NODE_ID_UNSET {
                        None
                    } else {
                        Some(NodeId(header.source))
                    };
                    deliveries.push(Delivery::Message {
                        subject_id,
                        transfer: MessageRxTransfer {
                            metadata: RxMetadata {
                                priority: header.priority,
                                transfer_id: completed.transfer_id,
                                timestamp: completed.timestamp,
                            },
                            source,
                            payload: completed.payload,
                        },
                    });
                }
            }
            SessionKey::Request(service_id) | SessionKey::Response(service_id, _) => {
                let expected_destination = local_node_id.map(|node| node.0);
                if Some(header.destination) != expected_destination {
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                }
                if header.source > UDP_NODE_ID_MAX {
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                }

                let state = match key {
                    SessionKey::Request(_) => {
                        if header.data_specifier != DataSpecifier::ServiceRequest(service_id) {
                            return;
                        }
                        req_sessions.get_mut(&service_id)
                    }
                    SessionKey::Response(_, server) => {
                        if header.data_specifier != DataSpecifier::ServiceResponse(service_id)
                            || header.source != server.0
                        {
                            return;
                        }
                        resp_sessions.get_mut(&(service_id, server))
                    }
                    SessionKey::Message(_) => unreachable!(),
                };
                let Some(state) = state else { return };
                let reassembler = state
                    .reassembly
                    .entry(header.source)
                    .or_insert_with(rx::UdpReassembler::new);
                if let Some(completed) = reassembler.accept(
                    &header,
                    payload,
                    timestamp,
                    state.extent,
                    config.transfer_id_timeout,
                    counters,
                ) {
                    let transfer = ServiceRxTransfer {
                        metadata: RxMetadata {
                            priority: header.priority,
                            transfer_id: completed.transfer_id,
                            timestamp: completed.timestamp,
                        },
                        remote_node_id: NodeId(header.source),
                        payload: completed.payload,
                    };
                    deliveries.push(match key {
                        SessionKey::Request(_) => Delivery::Request { service_id, transfer },
                        SessionKey::Response(_, server) => {
                            Delivery::Response { key: (service_id, server), transfer }
                        }
                        SessionKey::Message(_) => unreachable!(),
                    });
                }
            }
        }
    }
}

/// Builds the datagram sequence of one transfer for one interface MTU.
fn build_datagrams(
    mut header: UdpHeader,
    destination: UdpEndpoint,
    payload: &[u8],
    mtu: usize,
    deadline: TimePoint,
) -> Result<Vec<TxDatagram>, CyphalError> {
    if mtu <= HEADER_SIZE + Crc32C::LENGTH {
        return Err(CyphalError::Argument("media MTU too small for the datagram header"));
    }
    let capacity = mtu - HEADER_SIZE;

    let mut crc = Crc32C::new();
    crc.add_bytes(payload);
    let mut stream = Vec::with_capacity(payload.len() + Crc32C::LENGTH);
    stream.extend_from_slice(payload);
    stream.extend_from_slice(&crc.get().to_le_bytes());

    let chunk_count = stream.len().div_ceil(capacity);
    let mut datagrams = Vec::with_capacity(chunk_count);
    for (index, chunk) in stream.chunks(capacity).enumerate() {
        header.frame_index = index as u32;
        header.end_of_transfer = index + 1 == chunk_count;
        let mut data = vec![0u8; HEADER_SIZE + chunk.len()];
        header.serialize(&mut data[..HEADER_SIZE])?;
        data[HEADER_SIZE..].copy_from_slice(chunk);
        datagrams.push(TxDatagram { destination, payload: data, deadline });
    }
    Ok(datagrams)
}

/// Drains the TX queue of one interface until empty or the socket stops
/// accepting.
fn drain_tx(core: &Rc<RefCell<UdpCore>>, index: usize, now: TimePoint) {
    loop {
        let mut guard = core.borrow_mut();
        let this = &mut *guard;
        let Some(slot) = this.media.get_mut(index) else { return };
        let Some((&key, datagram)) = slot.tx_queue.iter().next() else { return };

        if datagram.deadline < now {
            slot.tx_queue.remove(&key);
            Counters::bump(&mut this.counters.tx_frames_expired);
            debug!("UDP media {}: dropping expired TX datagram", index);
            continue;
        }

        let result = slot.tx_socket.send(datagram.deadline, datagram.destination, &datagram.payload);
        match result {
            Ok(true) => {
                this.media[index].tx_queue.remove(&key);
            }
            Ok(false) => return,
            Err(e) => {
                warn!("UDP media {}: send failed: {}", index, e);
                Counters::bump(&mut this.counters.tx_media_failures);
                this.media[index].tx_queue.remove(&key);
            }
        }
    }
}

/// Pops every pending datagram from one session socket and dispatches
/// completed transfers.
fn process_socket_pop(core: &Rc<RefCell<UdpCore>>, key: SessionKey, socket_index: usize, _now: TimePoint) {
    let mut deliveries = Vec::new();
    {
        let mut guard = core.borrow_mut();
        let this = &mut *guard;
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let sockets = match key {
                SessionKey::Message(port) => {
                    this.msg_sessions.get_mut(&port).map(|s| &mut s.sockets)
                }
                SessionKey::Request(port) => {
                    this.req_sessions.get_mut(&port).map(|s| &mut s.sockets)
                }
                SessionKey::Response(port, server) => {
                    this.resp_sessions.get_mut(&(port, server)).map(|s| &mut s.sockets)
                }
            };
            let Some(slot) = sockets.and_then(|sockets| sockets.get_mut(socket_index)) else {
                return;
            };
            let meta = match slot.socket.pop(&mut buffer) {
                Ok(Some(meta)) => meta,
                Ok(None) => break,
                Err(e) => {
                    warn!("UDP socket pop failed: {}", e);
                    break;
                }
            };
            let size = meta.payload_size.min(buffer.len());
            let (data, _) = buffer.split_at(size);
            this.process_datagram(key, meta.timestamp, data, &mut deliveries);
        }
    }
    dispatch(core, deliveries);
}

fn dispatch(core: &Rc<RefCell<UdpCore>>, deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        match delivery {
            Delivery::Message { subject_id, transfer } => {
                let callback = core
                    .borrow_mut()
                    .msg_sessions
                    .get_mut(&subject_id)
                    .and_then(|state| state.callback.take());
                let Some(mut callback) = callback else { continue };
                callback(transfer);
                if let Some(state) = core.borrow_mut().msg_sessions.get_mut(&subject_id) {
                    if state.callback.is_none() {
                        state.callback = Some(callback);
                    }
                }
            }
            Delivery::Request { service_id, transfer } => {
                let callback = core
                    .borrow_mut()
                    .req_sessions
                    .get_mut(&service_id)
                    .and_then(|state| state.callback.take());
                let Some(mut callback) = callback else { continue };
                callback(transfer);
                if let Some(state) = core.borrow_mut().req_sessions.get_mut(&service_id) {
                    if state.callback.is_none() {
                        state.callback = Some(callback);
                    }
                }
            }
            Delivery::Response { key, transfer } => {
                let callback = core
                    .borrow_mut()
                    .resp_sessions
                    .get_mut(&key)
                    .and_then(|state| state.callback.take());
                let Some(mut callback) = callback else { continue };
                callback(transfer);
                if let Some(state) = core.borrow_mut().resp_sessions.get_mut(&key) {
                    if state.callback.is_none() {
                        state.callback = Some(callback);
                    }
                }
            }
        }
    }
}

// --- Session objects ---

struct UdpMessageTxSession {
    core: Weak<RefCell<UdpCore>>,
    params: MessageTxParams,
}

impl MessageTxSession for UdpMessageTxSession {
    fn params(&self) -> MessageTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TxMetadata, payload: &[u8]) -> Result<(), CyphalError> {
        let Some(core) = self.core.upgrade() else {
            return Err(CyphalError::Argument("transport no longer exists"));
        };
        let mut this = core.borrow_mut();
        let source = this.local_node_id.map_or(UDP_NODE_ID_UNSET, |node| node.0);
        let header = UdpHeader {
            priority: metadata.priority,
            source,
            destination: UDP_NODE_ID_UNSET,
            data_specifier: DataSpecifier::Subject(self.params.subject_id),
            transfer_id: metadata.transfer_id,
            frame_index: 0,
            end_of_transfer: false,
        };
        this.enqueue_transfer(
            header,
            endpoint::subject_endpoint(self.params.subject_id),
            metadata,
            payload,
        )
    }
}

impl Drop for UdpMessageTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Message, self.params.subject_id));
        }
    }
}

struct UdpMessageRxSession {
    core: Weak<RefCell<UdpCore>>,
    params: MessageRxParams,
}

impl MessageRxSession for UdpMessageRxSession {
    fn params(&self) -> MessageRxParams {
        self.params
    }

    fn set_on_receive(&mut self, callback: Option<MessageRxCallback>) {
        if let Some(core) = self.core.upgrade() {
            if let Some(state) = core.borrow_mut().msg_sessions.get_mut(&self.params.subject_id) {
                state.callback = callback;
            }
        }
    }
}

impl Drop for UdpMessageRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().msg_sessions.remove(&self.params.subject_id);
        }
    }
}

struct UdpRequestTxSession {
    core: Weak<RefCell<UdpCore>>,
    params: RequestTxParams,
}

impl RequestTxSession for UdpRequestTxSession {
    fn params(&self) -> RequestTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TxMetadata, payload: &[u8]) -> Result<(), CyphalError> {
        let Some(core) = self.core.upgrade() else {
            return Err(CyphalError::Argument("transport no longer exists"));
        };
        let mut this = core.borrow_mut();
        let Some(source) = this.local_node_id else {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        };
        let header = UdpHeader {
            priority: metadata.priority,
            source: source.0,
            destination: self.params.server_node_id.0,
            data_specifier: DataSpecifier::ServiceRequest(self.params.service_id),
            transfer_id: metadata.transfer_id,
            frame_index: 0,
            end_of_transfer: false,
        };
        this.enqueue_transfer(
            header,
            endpoint::node_endpoint(self.params.server_node_id.0),
            metadata,
            payload,
        )
    }
}

impl Drop for UdpRequestTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Request, self.params.service_id));
        }
    }
}

struct UdpRequestRxSession {
    core: Weak<RefCell<UdpCore>>,
    params: RequestRxParams,
}

impl RequestRxSession for UdpRequestRxSession {
    fn params(&self) -> RequestRxParams {
        self.params
    }

    fn set_on_receive(&mut self, callback: Option<ServiceRxCallback>) {
        if let Some(core) = self.core.upgrade() {
            if let Some(state) = core.borrow_mut().req_sessions.get_mut(&self.params.service_id) {
                state.callback = callback;
            }
        }
    }
}

impl Drop for UdpRequestRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().req_sessions.remove(&self.params.service_id);
        }
    }
}

struct UdpResponseTxSession {
    core: Weak<RefCell<UdpCore>>,
    params: ResponseTxParams,
}

impl ResponseTxSession for UdpResponseTxSession {
    fn params(&self) -> ResponseTxParams {
        self.params
    }

    fn send(
        &mut self,
        metadata: &TxMetadata,
        client_node_id: NodeId,
        payload: &[u8],
    ) -> Result<(), CyphalError> {
        let Some(core) = self.core.upgrade() else {
            return Err(CyphalError::Argument("transport no longer exists"));
        };
        if client_node_id.0 > UDP_NODE_ID_MAX {
            return Err(CyphalError::Argument("client node id exceeds the UDP limit"));
        }
        let mut this = core.borrow_mut();
        let Some(source) = this.local_node_id else {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        };
        let header = UdpHeader {
            priority: metadata.priority,
            source: source.0,
            destination: client_node_id.0,
            data_specifier: DataSpecifier::ServiceResponse(self.params.service_id),
            transfer_id: metadata.transfer_id,
            frame_index: 0,
            end_of_transfer: false,
        };
        this.enqueue_transfer(
            header,
            endpoint::node_endpoint(client_node_id.0),
            metadata,
            payload,
        )
    }
}

impl Drop for UdpResponseTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Response, self.params.service_id));
        }
    }
}

struct UdpResponseRxSession {
    core: Weak<RefCell<UdpCore>>,
    params: ResponseRxParams,
}

impl ResponseRxSession for UdpResponseRxSession {
    fn params(&self) -> ResponseRxParams {
        self.params
    }

    fn set_on_receive(&mut self, callback: Option<ServiceRxCallback>) {
        if let Some(core) = self.core.upgrade() {
            let key = (self.params.service_id, self.params.server_node_id);
            if let Some(state) = core.borrow_mut().resp_sessions.get_mut(&key) {
                state.callback = callback;
            }
        }
    }
}

impl Drop for UdpResponseRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let key = (self.params.service_id, self.params.server_node_id);
            core.borrow_mut().resp_sessions.remove(&key);
        }
    }
}
