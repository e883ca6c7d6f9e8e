//!
//! # Height-indexed diff index
//!
//! Every accepted block appends the validator-set changes it caused under
//! its height. The set at an earlier height is rebuilt by undoing those
//! changes from the current set backwards.
//!

use {
    crate::{
        data_model::{BlockHeight, DiffRecord, NodeId, SubnetId, ValidatorEntry},
        error::{Error, NotFound, Result},
    },
    lru::LruCache,
    parking_lot::Mutex,
    std::{collections::BTreeMap, num::NonZeroUsize},
};

/// Validator set of one subnet.
pub type ValidatorSet = BTreeMap<NodeId, ValidatorEntry>;

/// Append-only per-height log of validator-set changes.
pub struct DiffIndex {
    diffs: BTreeMap<BlockHeight, Vec<DiffRecord>>,
    // keyed by the exact height; only heights below the tip are cached
    cache: Mutex<LruCache<(BlockHeight, SubnetId), ValidatorSet>>,
}

impl DiffIndex {
    #[allow(missing_docs)]
    pub fn new(cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        DiffIndex {
            diffs: BTreeMap::new(),
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Record the changes of the block accepted at `height`. A height is
    /// written at most once.
    pub fn record_height(&mut self, height: BlockHeight, diffs: Vec<DiffRecord>) -> Result<()> {
        if let Some((last, _)) = self.diffs.iter().next_back() {
            if *last >= height {
                return Err(Error::Fatal(format!(
                    "diffs of height {height} recorded after height {last}"
                )));
            }
        }
        if !diffs.is_empty() {
            self.diffs.insert(height, diffs);
        }
        Ok(())
    }

    /// Changes caused by the block at `height`.
    pub fn diffs_at(&self, height: BlockHeight) -> &[DiffRecord] {
        self.diffs.get(&height).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Validator set of `subnet` right after the block at `height` was
    /// accepted, given the tip height and a way to read the tip's set.
    pub fn validator_set_at(
        &self,
        height: BlockHeight,
        subnet: &SubnetId,
        tip: BlockHeight,
        tip_set: impl FnOnce() -> ValidatorSet,
    ) -> Result<ValidatorSet> {
        if height > tip {
            return Err(Error::NotFound(NotFound::Height(height)));
        }
        if height == tip {
            return Ok(tip_set());
        }
        if let Some(set) = self.cache.lock().get(&(height, *subnet)) {
            return Ok(set.clone());
        }

        let mut set = tip_set();
        for (h, records) in self.diffs.range(height + 1..=tip).rev() {
            for r in records.iter().filter(|r| r.subnet_id == *subnet) {
                let e = set.entry(r.node_id).or_default();
                if r.weight.decrease {
                    e.weight = e.weight.checked_add(r.weight.amount).ok_or_else(|| {
                        Error::Fatal(format!("weight overflow undoing height {h}"))
                    })?;
                } else {
                    e.weight = e.weight.checked_sub(r.weight.amount).ok_or_else(|| {
                        Error::Fatal(format!(
                            "negative weight for {} undoing height {}",
                            r.node_id, h
                        ))
                    })?;
                }
                e.bls_key = r.bls_before.clone();
            }
            set.retain(|_, e| e.weight > 0);
        }

        self.cache.lock().put((height, *subnet), set.clone());
        Ok(set)
    }

    /// Number of heights that carry at least one change.
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}
