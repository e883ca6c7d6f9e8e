//!
//! Issued transactions waiting for a block, in issue order.
//!

use {
    crate::{
        data_model::{Tx, TxId},
        error::{Error, Result},
    },
    indexmap::IndexMap,
    lru::LruCache,
    std::num::NonZeroUsize,
};

const DROPPED_CACHE_SIZE: usize = 256;

/// Bounded, deduplicated transaction queue.
pub struct Mempool {
    txs: IndexMap<TxId, Tx>,
    capacity: usize,
    // why recently dropped transactions were dropped
    dropped: LruCache<TxId, String>,
}

impl Mempool {
    #[allow(missing_docs)]
    pub fn new(capacity: usize) -> Self {
        Mempool {
            txs: IndexMap::new(),
            capacity,
            dropped: LruCache::new(
                NonZeroUsize::new(DROPPED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    #[allow(missing_docs)]
    pub fn add(&mut self, tx: Tx) -> Result<()> {
        let id = tx.id();
        if self.txs.contains_key(&id) {
            return Err(Error::Conflict(format!("tx {id} already in mempool")));
        }
        if self.txs.len() >= self.capacity {
            return Err(Error::Conflict("mempool is full".to_owned()));
        }
        self.dropped.pop(&id);
        self.txs.insert(id, tx);
        Ok(())
    }

    /// Remove without reordering what stays.
    pub fn remove(&mut self, id: &TxId) -> Option<Tx> {
        self.txs.shift_remove(id)
    }

    /// Remove a transaction that can never be included, remembering why.
    pub fn drop_tx(&mut self, id: &TxId, reason: String) {
        self.txs.shift_remove(id);
        self.dropped.put(*id, reason);
    }

    #[allow(missing_docs)]
    pub fn dropped_reason(&self, id: &TxId) -> Option<String> {
        self.dropped.peek(id).cloned()
    }

    #[allow(missing_docs)]
    pub fn contains(&self, id: &TxId) -> bool {
        self.txs.contains_key(id)
    }

    /// Pending transactions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Tx> {
        self.txs.values()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
