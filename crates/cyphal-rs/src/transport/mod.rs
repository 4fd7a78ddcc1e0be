//! Transport layer: turns transfers into media frames and back.
//!
//! Two implementations exist, [`can::CanTransport`] and
//! [`udp::UdpTransport`]. The presentation layer talks to them through
//! the [`Transport`] trait and the six session traits below, one per
//! `(direction, transfer kind)` pair.

pub mod can;
pub mod session_tree;
pub mod udp;

use crate::hal::CyphalError;
use crate::time::{Duration, TimePoint};
use crate::types::{NodeId, PortId, Priority, TransferId};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Static parameters of a concrete transport, used by the presentation
/// layer to pick transfer-id arithmetic and size buffers.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolParams {
    /// Size of the cyclic transfer-id space: 32 on CAN, 2^64 on UDP
    /// (represented saturated to `u64::MAX`).
    pub transfer_id_modulo: TransferId,
    /// Number of addressable nodes.
    pub max_nodes: u16,
    /// Current smallest MTU across the attached media.
    pub mtu: usize,
}

/// Runtime configuration of a transport instance.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long a partially reassembled transfer may wait for its next
    /// frame before the state is discarded.
    pub transfer_id_timeout: Duration,
    /// Hard cap on the number of frames queued per media interface.
    pub tx_queue_capacity_per_media: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transfer_id_timeout: Duration::from_secs(2),
            tx_queue_capacity_per_media: 64,
        }
    }
}

/// Saturating event counters. Failures on the datapath never surface as
/// errors (see the propagation policy); they are tallied here instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    /// TX frames dropped because their deadline passed before dequeue.
    pub tx_frames_expired: u64,
    /// TX frames dropped on a media `push` failure.
    pub tx_media_failures: u64,
    /// RX frames discarded before reassembly (bad id bits, no session,
    /// malformed framing).
    pub rx_frames_rejected: u64,
    /// Completed transfers discarded due to a transfer CRC mismatch.
    pub rx_crc_errors: u64,
    /// Partial transfers discarded due to toggle/index/transfer-id
    /// sequence violations.
    pub rx_out_of_sequence: u64,
    /// Partial transfers evicted by the transfer-id timeout.
    pub rx_timeouts: u64,
    /// Completed transfers dropped by duplicate suppression.
    pub rx_duplicates: u64,
}

impl Counters {
    pub(crate) fn bump(counter: &mut u64) {
        *counter = counter.saturating_add(1);
    }
}

/// Metadata attached to an outgoing transfer.
#[derive(Debug, Clone, Copy)]
pub struct TxMetadata {
    pub priority: Priority,
    pub transfer_id: TransferId,
    /// Frames not on the wire by this instant may be dropped.
    pub deadline: TimePoint,
}

/// Metadata of a completed incoming transfer.
#[derive(Debug, Clone, Copy)]
pub struct RxMetadata {
    pub priority: Priority,
    pub transfer_id: TransferId,
    /// Reception timestamp of the first frame of the transfer.
    pub timestamp: TimePoint,
}

/// A reassembled subject message.
#[derive(Debug)]
pub struct MessageRxTransfer {
    pub metadata: RxMetadata,
    /// `None` when the publisher was anonymous.
    pub source: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// A reassembled service request or response.
#[derive(Debug)]
pub struct ServiceRxTransfer {
    pub metadata: RxMetadata,
    /// The requesting client (for servers) or the responding server (for
    /// clients).
    pub remote_node_id: NodeId,
    pub payload: Vec<u8>,
}

pub type MessageRxCallback = Box<dyn FnMut(MessageRxTransfer)>;
pub type ServiceRxCallback = Box<dyn FnMut(ServiceRxTransfer)>;

// --- Session parameters ---

#[derive(Debug, Clone, Copy)]
pub struct MessageTxParams {
    pub subject_id: PortId,
}

#[derive(Debug, Clone, Copy)]
pub struct MessageRxParams {
    pub extent_bytes: usize,
    pub subject_id: PortId,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestTxParams {
    pub service_id: PortId,
    pub server_node_id: NodeId,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestRxParams {
    pub extent_bytes: usize,
    pub service_id: PortId,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseTxParams {
    pub service_id: PortId,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseRxParams {
    pub extent_bytes: usize,
    pub service_id: PortId,
    pub server_node_id: NodeId,
}

// --- Session traits ---
//
// Dropping a session object closes it: the transport forgets the port
// binding, releases reassembly state and recomputes RX filters.

pub trait MessageTxSession {
    fn params(&self) -> MessageTxParams;

    /// Fragments the payload and enqueues the frames on every attached
    /// media interface. Returns `Capacity` when a TX queue cannot take
    /// the whole transfer.
    fn send(&mut self, metadata: &TxMetadata, payload: &[u8]) -> Result<(), CyphalError>;
}

pub trait MessageRxSession {
    fn params(&self) -> MessageRxParams;

    /// Installs (or clears) the function invoked for every reassembled
    /// message on this subject.
    fn set_on_receive(&mut self, callback: Option<MessageRxCallback>);
}

pub trait RequestTxSession {
    fn params(&self) -> RequestTxParams;

    fn send(&mut self, metadata: &TxMetadata, payload: &[u8]) -> Result<(), CyphalError>;
}

pub trait RequestRxSession {
    fn params(&self) -> RequestRxParams;

    fn set_on_receive(&mut self, callback: Option<ServiceRxCallback>);
}

pub trait ResponseTxSession {
    fn params(&self) -> ResponseTxParams;

    /// Sends one response transfer to the given client node.
    fn send(
        &mut self,
        metadata: &TxMetadata,
        client_node_id: NodeId,
        payload: &[u8],
    ) -> Result<(), CyphalError>;
}

pub trait ResponseRxSession {
    fn params(&self) -> ResponseRxParams;

    fn set_on_receive(&mut self, callback: Option<ServiceRxCallback>);
}

/// A Cyphal transport instance bound to a set of media interfaces.
pub trait Transport {
    /// The node id of this side, or `None` when operating anonymously
    /// (pub/sub only; services require an address).
    fn local_node_id(&self) -> Option<NodeId>;

    fn protocol_params(&self) -> ProtocolParams;

    fn make_message_tx_session(
        &self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, CyphalError>;

    fn make_message_rx_session(
        &self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, CyphalError>;

    fn make_request_tx_session(
        &self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, CyphalError>;

    fn make_request_rx_session(
        &self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, CyphalError>;

    fn make_response_tx_session(
        &self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, CyphalError>;

    fn make_response_rx_session(
        &self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, CyphalError>;

    /// Snapshot of the datapath event counters.
    fn counters(&self) -> Counters;
}
