//! Ordered table of live sessions, one per transport and transfer kind.
//!
//! Message sessions are keyed by port id alone; response sessions by
//! `(port id, server node)`, hence the generic key.

use crate::hal::CyphalError;
use alloc::collections::BTreeMap;

pub struct SessionTree<K: Ord + Copy, N> {
    nodes: BTreeMap<K, N>,
}

impl<K: Ord + Copy, N> SessionTree<K, N> {
    pub fn new() -> Self {
        SessionTree { nodes: BTreeMap::new() }
    }

    /// Inserts a node built by `factory` under `key`, or fails with
    /// `AlreadyExists` if the key is taken. The factory runs only on
    /// actual insertion.
    pub fn ensure_new(
        &mut self,
        key: K,
        factory: impl FnOnce() -> N,
    ) -> Result<&mut N, CyphalError> {
        if self.nodes.contains_key(&key) {
            return Err(CyphalError::AlreadyExists);
        }
        Ok(self.nodes.entry(key).or_insert_with(factory))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut N> {
        self.nodes.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<N> {
        self.nodes.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visits every node in key order.
    pub fn for_each(&self, mut action: impl FnMut(&K, &N)) {
        for (key, node) in &self.nodes {
            action(key, node);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut N)> {
        self.nodes.iter_mut()
    }
}

impl<K: Ord + Copy, N> Default for SessionTree<K, N> {
    fn default() -> Self {
        Self::new()
    }
}

// --- Unit Tests ---
