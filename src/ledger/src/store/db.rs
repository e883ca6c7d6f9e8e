//!
//! Byte-oriented key/value collaborator.
//!

use {
    crate::error::Result,
    parking_lot::RwLock,
    std::collections::BTreeMap,
};

/// key-value pairs
pub type StoreKey = Vec<u8>;
#[allow(missing_docs)]
pub type KValue = (StoreKey, Vec<u8>);
/// `None` deletes the key.
pub type KVEntry = (StoreKey, Option<Vec<u8>>);
#[allow(missing_docs)]
pub type KVBatch = Vec<KVEntry>;

/// Ordered key/value store with atomic batched writes.
pub trait KvStore: Send + Sync {
    #[allow(missing_docs)]
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<KValue>>;

    /// Apply every entry of `batch` or none of them.
    fn commit(&self, batch: KVBatch) -> Result<()>;
}

/// In-memory store, used by tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemDB {
    kvs: RwLock<BTreeMap<StoreKey, Vec<u8>>>,
}

impl MemDB {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.kvs.read().len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.kvs.read().is_empty()
    }
}

impl KvStore for MemDB {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.kvs.read().get(key).cloned())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<KValue>> {
        Ok(self
            .kvs
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: KVBatch) -> Result<()> {
        let mut kvs = self.kvs.write();
        for (k, v) in batch {
            match v {
                Some(v) => {
                    kvs.insert(k, v);
                }
                None => {
                    kvs.remove(&k);
                }
            }
        }
        Ok(())
    }
}
