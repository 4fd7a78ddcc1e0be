//! Typed message subscribers.

use super::{DataType, PresentationInner, Received};
use crate::hal::CyphalError;
use crate::transport::{MessageRxParams, MessageRxSession, MessageRxTransfer};
use crate::types::PortId;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::marker::PhantomData;
use log::debug;

type FacadeCallback = Box<dyn FnMut(&MessageRxTransfer)>;

/// Shared state of every subscriber on one subject: the single RX
/// session and the per-facade delivery callbacks.
pub(crate) struct SubscriberImpl {
    presentation: Weak<PresentationInner>,
    /// `None` only during construction; owned afterwards so the wire
    /// session closes when the last facade releases this impl.
    session: Option<Box<dyn MessageRxSession>>,
    subject_id: PortId,
    callbacks: BTreeMap<u64, FacadeCallback>,
    /// Facades dropped while their callback was detached for invocation.
    dead: BTreeSet<u64>,
    next_facade_id: u64,
}

impl Drop for SubscriberImpl {
    fn drop(&mut self) {
        if let Some(presentation) = self.presentation.upgrade() {
            presentation.registry.borrow_mut().subscribers.remove(&self.subject_id);
        }
    }
}

/// Fans one reassembled transfer out to every facade callback. Each
/// callback runs with the impl borrow released, so it may freely create
/// or drop facades, including its own.
fn deliver(shared: &Rc<RefCell<SubscriberImpl>>, transfer: MessageRxTransfer) {
    let ids: Vec<u64> = shared.borrow().callbacks.keys().copied().collect();
    for id in ids {
        let callback = shared.borrow_mut().callbacks.remove(&id);
        let Some(mut callback) = callback else { continue };
        callback(&transfer);
        let mut this = shared.borrow_mut();
        if !this.dead.remove(&id) {
            this.callbacks.insert(id, callback);
        }
    }
}

pub(crate) fn make_subscriber<M, F>(
    inner: &Rc<PresentationInner>,
    subject_id: PortId,
    on_receive: F,
) -> Result<Subscriber<M>, CyphalError>
where
    M: DataType,
    F: FnMut(Received<M>) + 'static,
{
    let existing =
        inner.registry.borrow().subscribers.get(&subject_id).and_then(Weak::upgrade);
    let shared = match existing {
        Some(shared) => shared,
        None => {
            let mut session = inner.transport.make_message_rx_session(MessageRxParams {
                extent_bytes: M::EXTENT_BYTES,
                subject_id,
            })?;
            let shared = Rc::new(RefCell::new(SubscriberImpl {
                presentation: Rc::downgrade(inner),
                session: None,
                subject_id,
                callbacks: BTreeMap::new(),
                dead: BTreeSet::new(),
                next_facade_id: 0,
            }));
            session.set_on_receive(Some(Box::new({
                let weak = Rc::downgrade(&shared);
                move |transfer| {
                    if let Some(shared) = weak.upgrade() {
                        deliver(&shared, transfer);
                    }
                }
            })));
            shared.borrow_mut().session = Some(session);
            inner
                .registry
                .borrow_mut()
                .subscribers
                .insert(subject_id, Rc::downgrade(&shared));
            shared
        }
    };

    let facade_id = {
        let mut this = shared.borrow_mut();
        let facade_id = this.next_facade_id;
        this.next_facade_id += 1;
        let mut on_receive = on_receive;
        this.callbacks.insert(
            facade_id,
            Box::new(move |transfer: &MessageRxTransfer| match M::deserialize(&transfer.payload) {
                Ok(message) => on_receive(Received {
                    message,
                    metadata: transfer.metadata,
                    source: transfer.source,
                }),
                Err(_) => {
                    debug!("Dropping message that failed deserialization");
                }
            }),
        );
        facade_id
    };

    Ok(Subscriber { shared, facade_id, _message: PhantomData })
}

/// A typed message subscriber. Dropping it detaches its callback;
/// dropping the last subscriber of a subject closes the RX session.
pub struct Subscriber<M: DataType> {
    shared: Rc<RefCell<SubscriberImpl>>,
    facade_id: u64,
    _message: PhantomData<M>,
}

impl<M: DataType> Subscriber<M> {
    pub fn subject_id(&self) -> PortId {
        self.shared.borrow().subject_id
    }
}

impl<M: DataType> Drop for Subscriber<M> {
    fn drop(&mut self) {
        let mut this = self.shared.borrow_mut();
        if this.callbacks.remove(&self.facade_id).is_none() {
            this.dead.insert(self.facade_id);
        }
    }
}
