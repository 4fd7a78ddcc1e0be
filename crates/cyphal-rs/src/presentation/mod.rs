//! Presentation layer: typed publishers, subscribers, service clients
//! and servers over a transport.
//!
//! Facades targeting the same wire port share one implementation object:
//! two publishers on a subject share a single TX session, all
//! subscribers to a subject share one RX session and its reassembly
//! buffer, and clients of the same `(service, server)` pair share the
//! request pipeline. The last facade dropped releases the shared object,
//! which detaches itself from the registry and closes its transport
//! sessions.

pub mod client;
pub mod publisher;
pub mod server;
pub mod subscriber;
pub mod transfer_id;

pub use client::Client;
pub use publisher::Publisher;
pub use server::Server;
pub use subscriber::Subscriber;
pub use transfer_id::{InMemoryTransferIdMap, TransferIdKey, TransferIdMap};

use crate::executor::Executor;
use crate::hal::CyphalError;
use crate::time::Duration;
use crate::transport::{RxMetadata, Transport};
use crate::types::{NodeId, PortId, TransferId};
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

/// The serialization contract of a typed port.
///
/// The data model and its codec live outside this crate (generated from
/// the type definitions); the stack only needs a byte-level view plus
/// the extent. `deserialize` must accept buffers truncated to the
/// receiver's extent, which is ordinary protocol behavior rather than an
/// error.
pub trait DataType: Sized {
    /// Upper bound on the serialized size, including future revisions of
    /// the type. Sizes reassembly buffers.
    const EXTENT_BYTES: usize;

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError>;

    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError>;
}

/// A decoded message or response handed to user callbacks.
#[derive(Debug)]
pub struct Received<M> {
    pub message: M,
    pub metadata: RxMetadata,
    /// Publishing node; `None` for anonymous messages. For service
    /// responses this is the server.
    pub source: Option<NodeId>,
}

/// Presentation-layer configuration.
pub struct Options {
    /// Deadline applied to service calls that do not carry an explicit
    /// one, and to server responses.
    pub default_response_timeout: Duration,
    /// Optional persistent transfer-id storage.
    pub transfer_id_map: Option<Rc<RefCell<dyn TransferIdMap>>>,
}

impl Default for Options {
    fn default() -> Self {
        Options { default_response_timeout: Duration::from_secs(1), transfer_id_map: None }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) publishers: BTreeMap<PortId, Weak<RefCell<publisher::PublisherImpl>>>,
    pub(crate) subscribers: BTreeMap<PortId, Weak<RefCell<subscriber::SubscriberImpl>>>,
    pub(crate) clients: BTreeMap<(PortId, NodeId), Weak<RefCell<client::SharedClient>>>,
}

/// Shared by the facades' implementation objects; holds what they need
/// to release themselves and persist their counters.
pub(crate) struct PresentationInner {
    pub(crate) executor: Executor,
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) options: Options,
    pub(crate) registry: RefCell<Registry>,
}

impl PresentationInner {
    /// Next-value arithmetic in the transport's cyclic transfer-id space.
    pub(crate) fn advance_transfer_id(&self, current: TransferId) -> TransferId {
        let modulo = self.transport.protocol_params().transfer_id_modulo;
        if modulo == TransferId::MAX {
            current.wrapping_add(1)
        } else {
            (current + 1) % modulo
        }
    }

    /// Initial counter value for a new publisher or client impl.
    pub(crate) fn initial_transfer_id(&self, key: &TransferIdKey) -> TransferId {
        let modulo = self.transport.protocol_params().transfer_id_modulo;
        let stored = self
            .options
            .transfer_id_map
            .as_ref()
            .and_then(|map| map.borrow().get(key))
            .unwrap_or(0);
        if modulo == TransferId::MAX {
            stored
        } else {
            stored % modulo
        }
    }

    pub(crate) fn persist_transfer_id(&self, key: &TransferIdKey, next: TransferId) {
        if let Some(map) = &self.options.transfer_id_map {
            map.borrow_mut().set(key, next);
        }
    }
}

/// Factory for the typed facades. One instance per transport.
pub struct Presentation {
    inner: Rc<PresentationInner>,
}

impl Presentation {
    pub fn new(executor: &Executor, transport: Rc<dyn Transport>, options: Options) -> Self {
        Presentation {
            inner: Rc::new(PresentationInner {
                executor: executor.clone(),
                transport,
                options,
                registry: RefCell::new(Registry::default()),
            }),
        }
    }

    /// Makes a publisher for `subject_id`. Publishers on the same
    /// subject share one TX session and one transfer-id counter.
    pub fn make_publisher<M: DataType>(
        &self,
        subject_id: PortId,
    ) -> Result<Publisher<M>, CyphalError> {
        publisher::make_publisher(&self.inner, subject_id)
    }

    /// Makes a subscriber for `subject_id` and installs its receive
    /// callback.
    ///
    /// Subscribers to one subject share a single RX session, so the
    /// extent declared by the first subscriber bounds the reassembly
    /// buffer for all of them.
    pub fn make_subscriber<M, F>(
        &self,
        subject_id: PortId,
        on_receive: F,
    ) -> Result<Subscriber<M>, CyphalError>
    where
        M: DataType,
        F: FnMut(Received<M>) + 'static,
    {
        subscriber::make_subscriber(&self.inner, subject_id, on_receive)
    }

    /// Makes a client of service `service_id` on `server_node_id`.
    /// Clients of the same pair share the underlying wire sessions.
    pub fn make_client<Req: DataType, Resp: DataType>(
        &self,
        server_node_id: NodeId,
        service_id: PortId,
    ) -> Result<Client<Req, Resp>, CyphalError> {
        client::make_client(&self.inner, server_node_id, service_id)
    }

    /// Makes the server of service `service_id` with its request
    /// handler. At most one server per service can exist.
    pub fn make_server<Req, Resp, F>(
        &self,
        service_id: PortId,
        handler: F,
    ) -> Result<Server<Req, Resp>, CyphalError>
    where
        Req: DataType,
        Resp: DataType,
        F: FnMut(Received<Req>) -> Resp + 'static,
    {
        server::make_server(&self.inner, service_id, handler)
    }
}
