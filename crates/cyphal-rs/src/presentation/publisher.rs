//! Typed message publishers.

use super::{DataType, PresentationInner, TransferIdKey};
use crate::hal::CyphalError;
use crate::time::TimePoint;
use crate::transport::{MessageTxParams, MessageTxSession, TxMetadata};
use crate::types::{PortId, Priority, TransferId, TransferKind};
use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec;
use core::cell::RefCell;
use core::marker::PhantomData;

/// Shared state of every publisher on one subject.
pub(crate) struct PublisherImpl {
    presentation: Weak<PresentationInner>,
    session: Box<dyn MessageTxSession>,
    subject_id: PortId,
    next_transfer_id: TransferId,
}

impl PublisherImpl {
    fn send(
        &mut self,
        presentation: &PresentationInner,
        priority: Priority,
        deadline: TimePoint,
        payload: &[u8],
    ) -> Result<(), CyphalError> {
        let metadata =
            TxMetadata { priority, transfer_id: self.next_transfer_id, deadline };
        self.session.send(&metadata, payload)?;
        self.next_transfer_id = presentation.advance_transfer_id(self.next_transfer_id);
        Ok(())
    }

    fn transfer_id_key(&self, presentation: &PresentationInner) -> Option<TransferIdKey> {
        presentation.transport.local_node_id().map(|node_id| TransferIdKey {
            port_id: self.subject_id,
            node_id,
            kind: TransferKind::Message,
        })
    }
}

impl Drop for PublisherImpl {
    fn drop(&mut self) {
        let Some(presentation) = self.presentation.upgrade() else { return };
        presentation.registry.borrow_mut().publishers.remove(&self.subject_id);
        if let Some(key) = self.transfer_id_key(&presentation) {
            presentation.persist_transfer_id(&key, self.next_transfer_id);
        }
    }
}

pub(crate) fn make_publisher<M: DataType>(
    inner: &Rc<PresentationInner>,
    subject_id: PortId,
) -> Result<Publisher<M>, CyphalError> {
    let existing =
        inner.registry.borrow().publishers.get(&subject_id).and_then(Weak::upgrade);
    let shared = match existing {
        Some(shared) => shared,
        None => {
            let session =
                inner.transport.make_message_tx_session(MessageTxParams { subject_id })?;
            let next_transfer_id = match inner.transport.local_node_id() {
                Some(node_id) => inner.initial_transfer_id(&TransferIdKey {
                    port_id: subject_id,
                    node_id,
                    kind: TransferKind::Message,
                }),
                // Anonymous counters start at zero and are not persisted.
                None => 0,
            };
            let shared = Rc::new(RefCell::new(PublisherImpl {
                presentation: Rc::downgrade(inner),
                session,
                subject_id,
                next_transfer_id,
            }));
            inner
                .registry
                .borrow_mut()
                .publishers
                .insert(subject_id, Rc::downgrade(&shared));
            shared
        }
    };
    Ok(Publisher { shared, priority: Priority::Nominal, _message: PhantomData })
}

/// A typed message publisher. Cloning is cheap and yields another facade
/// over the same wire session.
pub struct Publisher<M: DataType> {
    shared: Rc<RefCell<PublisherImpl>>,
    priority: Priority,
    _message: PhantomData<M>,
}

impl<M: DataType> Publisher<M> {
    /// Priority applied to subsequent [`publish`](Self::publish) calls.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Serializes `message` and hands it to the transport with the given
    /// transmission deadline. A deadline already in the past is not an
    /// error; such frames are simply droppable immediately.
    pub fn publish(&self, message: &M, deadline: TimePoint) -> Result<(), CyphalError> {
        let mut buffer = vec![0u8; M::EXTENT_BYTES];
        let size = message.serialize(&mut buffer)?;
        if size > buffer.len() {
            return Err(CyphalError::Serialization);
        }

        let mut shared = self.shared.borrow_mut();
        let Some(presentation) = shared.presentation.upgrade() else {
            return Err(CyphalError::Argument("presentation no longer exists"));
        };
        shared.send(&presentation, self.priority, deadline, &buffer[..size])
    }
}

impl<M: DataType> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Publisher { shared: self.shared.clone(), priority: self.priority, _message: PhantomData }
    }
}
