//! Typed service servers.

use super::{DataType, PresentationInner, Received};
use crate::executor::Executor;
use crate::hal::CyphalError;
use crate::time::Duration;
use crate::transport::{
    RequestRxParams, RequestRxSession, ResponseTxParams, ResponseTxSession, ServiceRxTransfer,
    TxMetadata,
};
use crate::types::PortId;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::marker::PhantomData;
use log::debug;

/// Turns one decoded request into the serialized response bytes, or
/// `None` when the request must be ignored.
type RequestHandler = Box<dyn FnMut(&ServiceRxTransfer) -> Option<Vec<u8>>>;

pub(crate) struct ServerImpl {
    /// `None` only during construction.
    #[allow(dead_code)]
    rx_session: Option<Box<dyn RequestRxSession>>,
    tx_session: Box<dyn ResponseTxSession>,
    executor: Executor,
    response_timeout: Duration,
    handler: Option<RequestHandler>,
}

/// Runs the user handler for one request and sends the response back to
/// the requester under the same transfer id and priority.
fn on_request(shared: &Rc<RefCell<ServerImpl>>, transfer: ServiceRxTransfer) {
    let handler = shared.borrow_mut().handler.take();
    let Some(mut handler) = handler else { return };

    let metadata_in = transfer.metadata;
    let client_node_id = transfer.remote_node_id;
    let response_payload = handler(&transfer);

    let mut this = shared.borrow_mut();
    if this.handler.is_none() {
        this.handler = Some(handler);
    }
    let Some(payload) = response_payload else { return };

    let deadline = this.executor.now() + this.response_timeout;
    let metadata = TxMetadata {
        priority: metadata_in.priority,
        transfer_id: metadata_in.transfer_id,
        deadline,
    };
    if let Err(e) = this.tx_session.send(&metadata, client_node_id, &payload) {
        debug!("Failed to send response to node {}: {}", client_node_id, e);
    }
}

pub(crate) fn make_server<Req, Resp, F>(
    inner: &Rc<PresentationInner>,
    service_id: PortId,
    handler: F,
) -> Result<Server<Req, Resp>, CyphalError>
where
    Req: DataType,
    Resp: DataType,
    F: FnMut(Received<Req>) -> Resp + 'static,
{
    let mut rx_session = inner.transport.make_request_rx_session(RequestRxParams {
        extent_bytes: Req::EXTENT_BYTES,
        service_id,
    })?;
    let tx_session = inner.transport.make_response_tx_session(ResponseTxParams { service_id })?;

    let mut handler = handler;
    let typed_handler: RequestHandler = Box::new(move |transfer: &ServiceRxTransfer| {
        let request = match Req::deserialize(&transfer.payload) {
            Ok(request) => request,
            Err(_) => {
                debug!("Dropping request that failed deserialization");
                return None;
            }
        };
        let response = handler(Received {
            message: request,
            metadata: transfer.metadata,
            source: Some(transfer.remote_node_id),
        });
        let mut buffer = vec![0u8; Resp::EXTENT_BYTES];
        match response.serialize(&mut buffer) {
            Ok(size) if size <= buffer.len() => {
                buffer.truncate(size);
                Some(buffer)
            }
            _ => {
                debug!("Dropping response that failed serialization");
                None
            }
        }
    });

    let shared = Rc::new(RefCell::new(ServerImpl {
        rx_session: None,
        tx_session,
        executor: inner.executor.clone(),
        response_timeout: inner.options.default_response_timeout,
        handler: Some(typed_handler),
    }));
    rx_session.set_on_receive(Some(Box::new({
        let weak = Rc::downgrade(&shared);
        move |transfer| {
            if let Some(shared) = weak.upgrade() {
                on_request(&shared, transfer);
            }
        }
    })));
    shared.borrow_mut().rx_session = Some(rx_session);

    Ok(Server { shared, _request: PhantomData, _response: PhantomData })
}

/// A typed service server. Dropping it closes both wire sessions; the
/// service id becomes available again.
pub struct Server<Req: DataType, Resp: DataType> {
    #[allow(dead_code)] // owned for its lifetime; no post-construction API yet
    shared: Rc<RefCell<ServerImpl>>,
    _request: PhantomData<Req>,
    _response: PhantomData<Resp>,
}
