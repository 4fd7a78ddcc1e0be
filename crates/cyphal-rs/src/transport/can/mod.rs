//! Cyphal/CAN transport: classic CAN and CAN FD over any number of
//! redundant media interfaces.
//!
//! Outgoing transfers are fragmented per interface (each may have its own
//! MTU) into per-media queues ordered by `(priority, deadline,
//! insertion)` and drained from the media "ready to push" callback.
//! Incoming frames are routed by CAN-id bitfields to per-source
//! reassemblers owned by the RX session of the port.

mod rx;
mod tx;

use crate::executor::{Callback, Executor};
use crate::frame::can_id::CanId;
use crate::frame::crc::Crc16Ccitt;
use crate::frame::tail_byte::TailByte;
use crate::hal::{CanMedia, CyphalError, Filter};
use crate::time::{Duration, TimePoint};
use crate::transport::session_tree::SessionTree;
use crate::transport::{
    Config, Counters, MessageRxCallback, MessageRxParams, MessageRxSession, MessageRxTransfer,
    MessageTxParams, MessageTxSession, ProtocolParams, RequestRxParams, RequestRxSession,
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, ResponseTxParams,
    ResponseTxSession, RxMetadata, ServiceRxCallback, ServiceRxTransfer, Transport, TxMetadata,
};
use crate::types::{
    NodeId, PortId, Priority, TransferId, TransferKind, CAN_NODE_ID_MAX, CAN_TRANSFER_ID_MODULO,
    SERVICE_ID_MAX, SUBJECT_ID_MAX,
};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use log::{debug, trace, warn};

/// How often a failed filter reconfiguration is retried.
const FILTER_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Largest possible CAN FD data field; sizes the RX pop buffer.
const CAN_FD_MTU: usize = 64;

struct MediaSlot {
    media: Rc<RefCell<dyn CanMedia>>,
    /// Pending frames ordered by `(priority, deadline, insertion)`. The
    /// per-transfer insertion sequence keeps frames of one transfer
    /// contiguous on the wire.
    tx_queue: BTreeMap<(Priority, TimePoint, u64), tx::TxFrame>,
    push_callback: Option<Callback>,
    #[allow(dead_code)] // held for its Drop side effect (unregistration)
    pop_callback: Option<Callback>,
}

struct MsgRxState {
    extent: usize,
    callback: Option<MessageRxCallback>,
    reassembly: BTreeMap<NodeId, rx::Reassembler>,
}

struct SvcRxState {
    extent: usize,
    callback: Option<ServiceRxCallback>,
    reassembly: BTreeMap<NodeId, rx::Reassembler>,
}

/// A transfer completed during a pop pass, dispatched to its session
/// callback only after the core borrow is released.
enum Delivery {
    Message { subject_id: PortId, transfer: MessageRxTransfer },
    Request { service_id: PortId, transfer: ServiceRxTransfer },
    Response { key: (PortId, NodeId), transfer: ServiceRxTransfer },
}

struct CanCore {
    executor: Executor,
    local_node_id: Option<NodeId>,
    config: Config,
    media: Vec<MediaSlot>,
    /// Open TX sessions; at most one per `(kind, port)`.
    tx_ports: BTreeSet<(TransferKind, PortId)>,
    msg_sessions: SessionTree<PortId, MsgRxState>,
    req_sessions: SessionTree<PortId, SvcRxState>,
    resp_sessions: SessionTree<(PortId, NodeId), SvcRxState>,
    counters: Counters,
    tx_sequence: u64,
    filter_retry: Option<Callback>,
}

/// The Cyphal/CAN transport handle. Sessions and the presentation layer
/// reference the shared core internally; dropping the handle tears the
/// transport down once the last session is gone.
pub struct CanTransport {
    core: Rc<RefCell<CanCore>>,
}

impl CanTransport {
    /// Builds a transport over the given media interfaces.
    ///
    /// `local_node_id` of `None` selects anonymous mode: only single-frame
    /// message publishing is possible and no service session can be made.
    pub fn new(
        executor: &Executor,
        media: Vec<Rc<RefCell<dyn CanMedia>>>,
        local_node_id: Option<NodeId>,
        config: Config,
    ) -> Result<CanTransport, CyphalError> {
        if media.is_empty() {
            return Err(CyphalError::Argument("at least one media interface required"));
        }
        if let Some(node_id) = local_node_id {
            if !node_id.is_valid_for_can() {
                return Err(CyphalError::Argument("node id exceeds the CAN limit"));
            }
        }

        let core = Rc::new(RefCell::new(CanCore {
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
            filter_retry: None,
        }));

        for (index, media) in media.into_iter().enumerate() {
            let push_callback = media.borrow_mut().register_push_callback(Box::new({
                let weak = Rc::downgrade(&core);
                move |now| {
                    if let Some(core) = weak.upgrade() {
                        drain_tx(&core, index, now);
                    }
                }
            }))?;
            let pop_callback = media.borrow_mut().register_pop_callback(Box::new({
                let weak = Rc::downgrade(&core);
                move |now| {
                    if let Some(core) = weak.upgrade() {
                        process_pop(&core, index, now);
                    }
                }
            }))?;
            core.borrow_mut().media.push(MediaSlot {
                media,
                tx_queue: BTreeMap::new(),
                push_callback: Some(push_callback),
                pop_callback: Some(pop_callback),
            });
        }

        let filter_retry = executor.register_callback({
            let weak = Rc::downgrade(&core);
            move |_now| {
                if let Some(core) = weak.upgrade() {
                    apply_filters(&core);
                }
            }
        });
        core.borrow_mut().filter_retry = Some(filter_retry);

        // No sessions are open yet: an empty filter set rejects all
        // traffic until the first subscription.
        apply_filters(&core);

        Ok(CanTransport { core })
    }
}

impl Transport for CanTransport {
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
            transfer_id_modulo: CAN_TRANSFER_ID_MODULO,
            max_nodes: CAN_NODE_ID_MAX + 1,
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
        Ok(Box::new(CanMessageTxSession { core: Rc::downgrade(&self.core), params }))
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
            reassembly: BTreeMap::new(),
        })?;
        apply_filters(&self.core);
        Ok(Box::new(CanMessageRxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_request_tx_session(
        &self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if !params.server_node_id.is_valid_for_can() {
            return Err(CyphalError::Argument("server node id exceeds the CAN limit"));
        }
        self.core.borrow_mut().claim_tx_port(TransferKind::Request, params.service_id)?;
        Ok(Box::new(CanRequestTxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_request_rx_session(
        &self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if params.extent_bytes == 0 {
            return Err(CyphalError::Argument("extent must be positive"));
        }
        self.core.borrow_mut().req_sessions.ensure_new(params.service_id, || SvcRxState {
            extent: params.extent_bytes,
            callback: None,
            reassembly: BTreeMap::new(),
        })?;
        apply_filters(&self.core);
        Ok(Box::new(CanRequestRxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_response_tx_session(
        &self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        self.core.borrow_mut().claim_tx_port(TransferKind::Response, params.service_id)?;
        Ok(Box::new(CanResponseTxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn make_response_rx_session(
        &self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, CyphalError> {
        self.validate_service_params(params.service_id)?;
        if params.extent_bytes == 0 {
            return Err(CyphalError::Argument("extent must be positive"));
        }
        if !params.server_node_id.is_valid_for_can() {
            return Err(CyphalError::Argument("server node id exceeds the CAN limit"));
        }
        let key = (params.service_id, params.server_node_id);
        self.core.borrow_mut().resp_sessions.ensure_new(key, || SvcRxState {
            extent: params.extent_bytes,
            callback: None,
            reassembly: BTreeMap::new(),
        })?;
        apply_filters(&self.core);
        Ok(Box::new(CanResponseRxSession { core: Rc::downgrade(&self.core), params }))
    }

    fn counters(&self) -> Counters {
        self.core.borrow().counters
    }
}

impl CanTransport {
    fn validate_service_params(&self, service_id: PortId) -> Result<(), CyphalError> {
        if service_id > SERVICE_ID_MAX {
            return Err(CyphalError::Argument("service id out of range"));
        }
        if self.core.borrow().local_node_id.is_none() {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        }
        Ok(())
    }
}

impl CanCore {
    fn claim_tx_port(&mut self, kind: TransferKind, port_id: PortId) -> Result<(), CyphalError> {
        if !self.tx_ports.insert((kind, port_id)) {
            return Err(CyphalError::AlreadyExists);
        }
        Ok(())
    }

    /// Fragments and enqueues one transfer on every media interface.
    /// All-or-nothing: if any queue lacks room the whole send fails with
    /// `Capacity` and nothing is enqueued.
    fn enqueue_transfer(
        &mut self,
        can_id_for: impl Fn(&MediaSlot) -> u32,
        metadata: &TxMetadata,
        payload: &[u8],
    ) -> Result<(), CyphalError> {
        let mut fragmented: Vec<Vec<tx::TxFrame>> = Vec::with_capacity(self.media.len());
        for slot in &self.media {
            let mtu = slot.media.borrow().mtu();
            let frames = tx::fragment_transfer(
                can_id_for(slot),
                metadata.transfer_id,
                payload,
                mtu,
                metadata.deadline,
            )?;
            if slot.tx_queue.len() + frames.len() > self.config.tx_queue_capacity_per_media {
                return Err(CyphalError::Capacity);
            }
            fragmented.push(frames);
        }

        let now = self.executor.now();
        for (slot, frames) in self.media.iter_mut().zip(fragmented) {
            for frame in frames {
                self.tx_sequence += 1;
                slot.tx_queue.insert((metadata.priority, metadata.deadline, self.tx_sequence), frame);
            }
            if let Some(callback) = &slot.push_callback {
                callback.schedule_at(now);
            }
        }
        Ok(())
    }

    /// Routes one received frame into the owning session's reassembler.
    fn process_frame(
        &mut self,
        timestamp: TimePoint,
        raw_can_id: u32,
        data: &[u8],
        deliveries: &mut Vec<Delivery>,
    ) {
        let CanCore {
            local_node_id,
            config,
            msg_sessions,
            req_sessions,
            resp_sessions,
            counters,
            ..
        } = self;

        let can_id = match CanId::parse(raw_can_id) {
            Ok(id) => id,
            Err(e) => {
                trace!("Dropping frame with unparseable CAN id {:#010X}: {}", raw_can_id, e);
                Counters::bump(&mut counters.rx_frames_rejected);
                return;
            }
        };
        let Some((&tail_raw, payload)) = data.split_last() else {
            Counters::bump(&mut counters.rx_frames_rejected);
            return;
        };
        let tail = TailByte::from(tail_raw);

        match can_id {
            CanId::Message { priority, subject_id, source } => {
                let Some(state) = msg_sessions.get_mut(&subject_id) else {
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                };
                match source {
                    None => {
                        // Anonymous transfers are always single-frame.
                        if !(tail.sot() && tail.eot() && tail.toggle()) {
                            Counters::bump(&mut counters.rx_frames_rejected);
                            return;
                        }
                        let mut payload = payload.to_vec();
                        payload.truncate(state.extent);
                        deliveries.push(Delivery::Message {
                            subject_id,
                            transfer: MessageRxTransfer {
                                metadata: RxMetadata {
                                    priority,
                                    transfer_id: TransferId::from(tail.transfer_id()),
                                    timestamp,
                                },
                                source: None,
                                payload,
                            },
                        });
                    }
                    Some(source) => {
                        let reassembler =
                            state.reassembly.entry(source).or_insert_with(rx::Reassembler::new);
                        if let Some(completed) = reassembler.accept(
                            payload,
                            tail,
                            timestamp,
                            state.extent,
                            config.transfer_id_timeout,
                            counters,
                        ) {
                            deliveries.push(Delivery::Message {
                                subject_id,
                                transfer: MessageRxTransfer {
                                    metadata: RxMetadata {
                                        priority,
                                        transfer_id: TransferId::from(completed.transfer_id),
                                        timestamp: completed.timestamp,
                                    },
                                    source: Some(source),
                                    payload: completed.payload,
                                },
                            });
                        }
                    }
                }
            }
            CanId::Service { priority, service_id, source, destination, is_request } => {
                if *local_node_id != Some(destination) {
                    // Not addressed to us; normally weeded out by the
                    // hardware filters already.
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                }
                let state = if is_request {
                    req_sessions.get_mut(&service_id)
                } else {
                    resp_sessions.get_mut(&(service_id, source))
                };
                let Some(state) = state else {
                    Counters::bump(&mut counters.rx_frames_rejected);
                    return;
                };
                let reassembler =
                    state.reassembly.entry(source).or_insert_with(rx::Reassembler::new);
                if let Some(completed) = reassembler.accept(
                    payload,
                    tail,
                    timestamp,
                    state.extent,
                    config.transfer_id_timeout,
                    counters,
                ) {
                    let transfer = ServiceRxTransfer {
                        metadata: RxMetadata {
                            priority,
                            transfer_id: TransferId::from(completed.transfer_id),
                            timestamp: completed.timestamp,
                        },
                        remote_node_id: source,
                        payload: completed.payload,
                    };
                    deliveries.push(if is_request {
                        Delivery::Request { service_id, transfer }
                    } else {
                        Delivery::Response { key: (service_id, source), transfer }
                    });
                }
            }
        }
    }

    fn derive_filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        self.msg_sessions.for_each(|&subject_id, _| {
            filters.push(CanId::filter_for_subject(subject_id));
        });
        if let Some(local) = self.local_node_id {
            if !self.req_sessions.is_empty() || !self.resp_sessions.is_empty() {
                filters.push(CanId::filter_for_services(local));
            }
        }
        filters
    }
}

/// Drains the TX queue of one media interface until it is empty or the
/// media stops accepting.
fn drain_tx(core: &Rc<RefCell<CanCore>>, index: usize, now: TimePoint) {
    loop {
        let mut guard = core.borrow_mut();
        let this = &mut *guard;
        let Some(slot) = this.media.get_mut(index) else { return };
        let Some((&key, frame)) = slot.tx_queue.iter().next() else { return };

        if frame.deadline < now {
            slot.tx_queue.remove(&key);
            Counters::bump(&mut this.counters.tx_frames_expired);
            debug!("CAN media {}: dropping expired TX frame", index);
            continue;
        }

        let media = slot.media.clone();
        let result = media.borrow_mut().push(frame.deadline, frame.can_id, &frame.payload);
        match result {
            Ok(true) => {
                this.media[index].tx_queue.remove(&key);
            }
            Ok(false) => {
                // Queue head stays; the media fires the push callback
                // again when it can take more.
                return;
            }
            Err(e) => {
                warn!("CAN media {}: push failed: {}", index, e);
                Counters::bump(&mut this.counters.tx_media_failures);
                this.media[index].tx_queue.remove(&key);
            }
        }
    }
}

/// Pops every pending frame from one media interface and dispatches the
/// transfers completed by them.
fn process_pop(core: &Rc<RefCell<CanCore>>, index: usize, _now: TimePoint) {
    let mut deliveries = Vec::new();
    {
        let mut guard = core.borrow_mut();
        let this = &mut *guard;
        let Some(slot) = this.media.get(index) else { return };
        let media = slot.media.clone();
        let mut buffer = [0u8; CAN_FD_MTU];
        loop {
            let meta = match media.borrow_mut().pop(&mut buffer) {
                Ok(Some(meta)) => meta,
                Ok(None) => break,
                Err(e) => {
                    warn!("CAN media {}: pop failed: {}", index, e);
                    break;
                }
            };
            let size = meta.payload_size.min(buffer.len());
            this.process_frame(meta.timestamp, meta.can_id, &buffer[..size], &mut deliveries);
        }
    }
    dispatch(core, deliveries);
}

/// Invokes session callbacks with the core borrow released, so handlers
/// may freely publish or open sessions.
fn dispatch(core: &Rc<RefCell<CanCore>>, deliveries: Vec<Delivery>) {
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

/// Recomputes the minimal filter set and pushes it to every media. On
/// failure a periodic retry stays armed until every media accepts.
fn apply_filters(core: &Rc<RefCell<CanCore>>) {
    let (filters, media_list, now) = {
        let this = core.borrow();
        let media_list: Vec<_> = this.media.iter().map(|slot| slot.media.clone()).collect();
        (this.derive_filters(), media_list, this.executor.now())
    };

    let mut all_accepted = true;
    for media in media_list {
        if let Err(e) = media.borrow_mut().set_filters(&filters) {
            warn!("CAN filter reconfiguration failed: {}", e);
            all_accepted = false;
        }
    }

    let this = core.borrow();
    if let Some(retry) = &this.filter_retry {
        if all_accepted {
            retry.cancel();
        } else {
            retry.schedule_periodic(FILTER_RETRY_PERIOD, now + FILTER_RETRY_PERIOD);
        }
    }
}

// --- Session objects ---

struct CanMessageTxSession {
    core: Weak<RefCell<CanCore>>,
    params: MessageTxParams,
}

impl MessageTxSession for CanMessageTxSession {
    fn params(&self) -> MessageTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TxMetadata, payload: &[u8]) -> Result<(), CyphalError> {
        let Some(core) = self.core.upgrade() else {
            return Err(CyphalError::Argument("transport no longer exists"));
        };
        let mut this = core.borrow_mut();
        let source = this.local_node_id;
        if source.is_none() {
            // Anonymous transfers must fit one frame on every interface.
            let min_mtu =
                this.media.iter().map(|slot| slot.media.borrow().mtu()).min().unwrap_or(0);
            if payload.len() + 1 > min_mtu {
                return Err(CyphalError::Argument("anonymous transfers must be single-frame"));
            }
        }
        // The discriminator of anonymous frames is derived from the
        // payload so identical retransmissions stay identical.
        let mut crc = Crc16Ccitt::new();
        crc.add_bytes(payload);
        let discriminator = (crc.get() & 0x7F) as u8;

        let subject_id = self.params.subject_id;
        let priority = metadata.priority;
        this.enqueue_transfer(
            |_slot| {
                CanId::Message { priority, subject_id, source }.pack(discriminator)
            },
            metadata,
            payload,
        )
    }
}

impl Drop for CanMessageTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Message, self.params.subject_id));
        }
    }
}

struct CanMessageRxSession {
    core: Weak<RefCell<CanCore>>,
    params: MessageRxParams,
}

impl MessageRxSession for CanMessageRxSession {
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

impl Drop for CanMessageRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().msg_sessions.remove(&self.params.subject_id);
            apply_filters(&core);
        }
    }
}

struct CanRequestTxSession {
    core: Weak<RefCell<CanCore>>,
    params: RequestTxParams,
}

impl RequestTxSession for CanRequestTxSession {
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
        let can_id = CanId::Service {
            priority: metadata.priority,
            service_id: self.params.service_id,
            source,
            destination: self.params.server_node_id,
            is_request: true,
        }
        .pack(0);
        this.enqueue_transfer(|_slot| can_id, metadata, payload)
    }
}

impl Drop for CanRequestTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Request, self.params.service_id));
        }
    }
}

struct CanRequestRxSession {
    core: Weak<RefCell<CanCore>>,
    params: RequestRxParams,
}

impl RequestRxSession for CanRequestRxSession {
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

impl Drop for CanRequestRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().req_sessions.remove(&self.params.service_id);
            apply_filters(&core);
        }
    }
}

struct CanResponseTxSession {
    core: Weak<RefCell<CanCore>>,
    params: ResponseTxParams,
}

impl ResponseTxSession for CanResponseTxSession {
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
        if !client_node_id.is_valid_for_can() {
            return Err(CyphalError::Argument("client node id exceeds the CAN limit"));
        }
        let mut this = core.borrow_mut();
        let Some(source) = this.local_node_id else {
            return Err(CyphalError::Argument("service sessions require a local node id"));
        };
        let can_id = CanId::Service {
            priority: metadata.priority,
            service_id: self.params.service_id,
            source,
            destination: client_node_id,
            is_request: false,
        }
        .pack(0);
        this.enqueue_transfer(|_slot| can_id, metadata, payload)
    }
}

impl Drop for CanResponseTxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().tx_ports.remove(&(TransferKind::Response, self.params.service_id));
        }
    }
}

struct CanResponseRxSession {
    core: Weak<RefCell<CanCore>>,
    params: ResponseRxParams,
}

impl ResponseRxSession for CanResponseRxSession {
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

impl Drop for CanResponseRxSession {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let key = (self.params.service_id, self.params.server_node_id);
            core.borrow_mut().resp_sessions.remove(&key);
            apply_filters(&core);
        }
    }
}
