//! Typed service clients with response correlation and deadlines.

use super::{DataType, PresentationInner, Received, TransferIdKey};
use crate::executor::Callback;
use crate::hal::CyphalError;
use crate::time::TimePoint;
use crate::transport::{
    RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession, ServiceRxTransfer,
    TxMetadata,
};
use crate::types::{NodeId, PortId, Priority, TransferId, TransferKind};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::marker::PhantomData;
use log::debug;

type Continuation = Box<dyn FnOnce(Result<ServiceRxTransfer, CyphalError>)>;

struct PendingRequest {
    deadline: TimePoint,
    continuation: Continuation,
}

/// Shared state of every client bound to one `(service, server)` pair:
/// the wire sessions, the transfer-id counter and the in-flight table.
pub(crate) struct SharedClient {
    presentation: Weak<PresentationInner>,
    tx_session: Box<dyn RequestTxSession>,
    /// `None` only during construction.
    #[allow(dead_code)]
    rx_session: Option<Box<dyn ResponseRxSession>>,
    service_id: PortId,
    server_node_id: NodeId,
    next_transfer_id: TransferId,
    pending: BTreeMap<TransferId, PendingRequest>,
    /// One executor callback armed at the earliest pending deadline.
    timeout_callback: Option<Callback>,
    /// Responses with no matching in-flight request, dropped.
    unmatched_responses: u64,
}

impl SharedClient {
    /// Re-arms (or disarms) the deadline callback for the current
    /// earliest pending request.
    fn rearm_timer(&self) {
        let Some(callback) = &self.timeout_callback else { return };
        match self.pending.values().map(|p| p.deadline).min() {
            Some(deadline) => callback.schedule_at(deadline),
            None => callback.cancel(),
        }
    }
}

impl Drop for SharedClient {
    fn drop(&mut self) {
        let Some(presentation) = self.presentation.upgrade() else { return };
        presentation
            .registry
            .borrow_mut()
            .clients
            .remove(&(self.service_id, self.server_node_id));
        if let Some(node_id) = presentation.transport.local_node_id() {
            presentation.persist_transfer_id(
                &TransferIdKey {
                    port_id: self.service_id,
                    node_id,
                    kind: TransferKind::Request,
                },
                self.next_transfer_id,
            );
        }
    }
}

/// Handles one incoming response transfer: match, deliver, re-arm.
fn on_response(shared: &Rc<RefCell<SharedClient>>, transfer: ServiceRxTransfer) {
    let continuation = {
        let mut this = shared.borrow_mut();
        match this.pending.remove(&transfer.metadata.transfer_id) {
            Some(pending) => Some(pending.continuation),
            None => {
                this.unmatched_responses = this.unmatched_responses.saturating_add(1);
                debug!(
                    "Dropping unmatched response from node {} (transfer id {})",
                    transfer.remote_node_id, transfer.metadata.transfer_id
                );
                None
            }
        }
    };
    if let Some(continuation) = continuation {
        continuation(Ok(transfer));
    }
    shared.borrow().rearm_timer();
}

/// Fires when the earliest pending deadline passes: every expired entry
/// is removed and its continuation sees `Timeout`.
fn on_deadline(shared: &Rc<RefCell<SharedClient>>, now: TimePoint) {
    let expired: Vec<Continuation> = {
        let mut this = shared.borrow_mut();
        let expired_ids: Vec<TransferId> = this
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| this.pending.remove(&id).map(|p| p.continuation))
            .collect()
    };
    for continuation in expired {
        continuation(Err(CyphalError::Timeout));
    }
    shared.borrow().rearm_timer();
}

pub(crate) fn make_client<Req: DataType, Resp: DataType>(
    inner: &Rc<PresentationInner>,
    server_node_id: NodeId,
    service_id: PortId,
) -> Result<Client<Req, Resp>, CyphalError> {
    let key = (service_id, server_node_id);
    let existing = inner.registry.borrow().clients.get(&key).and_then(Weak::upgrade);
    let shared = match existing {
        Some(shared) => shared,
        None => {
            let tx_session = inner
                .transport
                .make_request_tx_session(RequestTxParams { service_id, server_node_id })?;
            let mut rx_session = inner.transport.make_response_rx_session(ResponseRxParams {
                extent_bytes: Resp::EXTENT_BYTES,
                service_id,
                server_node_id,
            })?;
            let Some(local_node_id) = inner.transport.local_node_id() else {
                return Err(CyphalError::Argument("clients require a local node id"));
            };
            let next_transfer_id = inner.initial_transfer_id(&TransferIdKey {
                port_id: service_id,
                node_id: local_node_id,
                kind: TransferKind::Request,
            });

            let shared = Rc::new(RefCell::new(SharedClient {
                presentation: Rc::downgrade(inner),
                tx_session,
                rx_session: None,
                service_id,
                server_node_id,
                next_transfer_id,
                pending: BTreeMap::new(),
                timeout_callback: None,
                unmatched_responses: 0,
            }));

            let timeout_callback = inner.executor.register_callback({
                let weak = Rc::downgrade(&shared);
                move |now| {
                    if let Some(shared) = weak.upgrade() {
                        on_deadline(&shared, now);
                    }
                }
            });
            rx_session.set_on_receive(Some(Box::new({
                let weak = Rc::downgrade(&shared);
                move |transfer| {
                    if let Some(shared) = weak.upgrade() {
                        on_response(&shared, transfer);
                    }
                }
            })));
            {
                let mut this = shared.borrow_mut();
                this.timeout_callback = Some(timeout_callback);
                this.rx_session = Some(rx_session);
            }
            inner.registry.borrow_mut().clients.insert(key, Rc::downgrade(&shared));
            shared
        }
    };

    Ok(Client { shared, priority: Priority::Nominal, _request: PhantomData, _response: PhantomData })
}

/// A typed service client bound to one server node. Cloning yields
/// another facade over the same wire sessions and in-flight table.
pub struct Client<Req: DataType, Resp: DataType> {
    shared: Rc<RefCell<SharedClient>>,
    priority: Priority,
    _request: PhantomData<Req>,
    _response: PhantomData<Resp>,
}

impl<Req: DataType, Resp: DataType> Client<Req, Resp> {
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn server_node_id(&self) -> NodeId {
        self.shared.borrow().server_node_id
    }

    /// Number of requests awaiting a response or deadline.
    pub fn pending_requests(&self) -> usize {
        self.shared.borrow().pending.len()
    }

    /// Sends a request and registers `continuation` for its outcome.
    ///
    /// The continuation is invoked exactly once: with the decoded
    /// response if one arrives from the server in time, or with
    /// `Timeout` when `deadline` (default: now plus the configured
    /// response timeout) passes first. Returns the transfer id of the
    /// request, usable with [`cancel`](Self::cancel).
    pub fn call<F>(
        &self,
        request: &Req,
        deadline: Option<TimePoint>,
        continuation: F,
    ) -> Result<TransferId, CyphalError>
    where
        F: FnOnce(Result<Received<Resp>, CyphalError>) + 'static,
    {
        let mut buffer = vec![0u8; Req::EXTENT_BYTES];
        let size = request.serialize(&mut buffer)?;
        if size > buffer.len() {
            return Err(CyphalError::Serialization);
        }

        let mut this = self.shared.borrow_mut();
        let Some(presentation) = this.presentation.upgrade() else {
            return Err(CyphalError::Argument("presentation no longer exists"));
        };
        let deadline = deadline.unwrap_or_else(|| {
            presentation.executor.now() + presentation.options.default_response_timeout
        });

        let transfer_id = this.next_transfer_id;
        if this.pending.contains_key(&transfer_id) {
            // The cyclic id space has wrapped onto a still-pending
            // request; accepting would break response correlation.
            return Err(CyphalError::Capacity);
        }

        let metadata = TxMetadata { priority: self.priority, transfer_id, deadline };
        this.tx_session.send(&metadata, &buffer[..size])?;
        this.next_transfer_id = presentation.advance_transfer_id(transfer_id);

        let wrapped: Continuation = Box::new(move |result| match result {
            Ok(transfer) => match Resp::deserialize(&transfer.payload) {
                Ok(response) => continuation(Ok(Received {
                    message: response,
                    metadata: transfer.metadata,
                    source: Some(transfer.remote_node_id),
                })),
                Err(_) => continuation(Err(CyphalError::Serialization)),
            },
            Err(e) => continuation(Err(e)),
        });
        this.pending.insert(transfer_id, PendingRequest { deadline, continuation: wrapped });
        this.rearm_timer();
        Ok(transfer_id)
    }

    /// Withdraws an in-flight request. Its continuation is never
    /// invoked. Returns whether the request was still pending.
    pub fn cancel(&self, transfer_id: TransferId) -> bool {
        let mut this = self.shared.borrow_mut();
        let removed = this.pending.remove(&transfer_id).is_some();
        if removed {
            this.rearm_timer();
        }
        removed
    }
}

impl<Req: DataType, Resp: DataType> Clone for Client<Req, Resp> {
    fn clone(&self) -> Self {
        Client {
            shared: self.shared.clone(),
            priority: self.priority,
            _request: PhantomData,
            _response: PhantomData,
        }
    }
}
