//! Optional persistence of outgoing transfer-id counters.
//!
//! Publishers and clients read their initial counter here on
//! construction and write the next value back on destruction, so a node
//! that restarts quickly keeps its transfer-ids monotonic and peers do
//! not mistake fresh transfers for duplicates. The storage backend is
//! the embedder's business; an in-memory map is provided for tests and
//! for wrapping in a persistent store.

use crate::types::{NodeId, PortId, TransferId, TransferKind};
use alloc::collections::BTreeMap;

/// Identifies one outgoing transfer-id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferIdKey {
    pub port_id: PortId,
    pub node_id: NodeId,
    pub kind: TransferKind,
}

/// Storage for the next transfer-id per `(port, node, kind)`.
///
/// Reads happen at construction and writes at destruction of each
/// publisher or client implementation; the core never flushes per send.
pub trait TransferIdMap {
    fn get(&self, key: &TransferIdKey) -> Option<TransferId>;
    fn set(&mut self, key: &TransferIdKey, next: TransferId);
}

/// Volatile [`TransferIdMap`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct InMemoryTransferIdMap {
    entries: BTreeMap<TransferIdKey, TransferId>,
}

impl InMemoryTransferIdMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferIdMap for InMemoryTransferIdMap {
    fn get(&self, key: &TransferIdKey) -> Option<TransferId> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: &TransferIdKey, next: TransferId) {
        self.entries.insert(*key, next);
    }
}

// --- Unit Tests ---
