//!
//! Ordered staker collection backing the pending and current sets.
//!

use {
    crate::{
        data_model::{NodeId, Staker, SubnetId, Timestamp, TxId},
        error::{Error, Result},
    },
    std::collections::{BTreeMap, BTreeSet},
};

type QueueKey = (Timestamp, u8, TxId);

/// Stakers indexed by tx id and by (subnet, node), with a queue ordered by
/// the next transition time: start time when pending, end time when current.
#[derive(Clone, Debug)]
pub(crate) struct StakerSet {
    by_end: bool,
    stakers: BTreeMap<TxId, Staker>,
    queue: BTreeSet<QueueKey>,
    validators: BTreeMap<(SubnetId, NodeId), TxId>,
    delegators: BTreeMap<(SubnetId, NodeId), BTreeSet<TxId>>,
}

impl StakerSet {
    pub(crate) fn pending() -> Self {
        Self::new(false)
    }

    pub(crate) fn current() -> Self {
        Self::new(true)
    }

    fn new(by_end: bool) -> Self {
        StakerSet {
            by_end,
            stakers: BTreeMap::new(),
            queue: BTreeSet::new(),
            validators: BTreeMap::new(),
            delegators: BTreeMap::new(),
        }
    }

    #[inline(always)]
    fn queue_key(&self, s: &Staker) -> QueueKey {
        if self.by_end {
            (s.end_time, s.kind.removal_rank(), s.tx_id)
        } else {
            (s.start_time, s.kind.pending_rank(), s.tx_id)
        }
    }

    pub(crate) fn insert(&mut self, s: Staker) -> Result<()> {
        if self.stakers.contains_key(&s.tx_id) {
            return Err(Error::Conflict(format!("staker {} already present", s.tx_id)));
        }
        let key = (s.subnet_id, s.node_id);
        if s.is_validator() {
            if self.validators.contains_key(&key) {
                return Err(Error::Conflict(format!(
                    "{} already validates subnet {}",
                    s.node_id, s.subnet_id
                )));
            }
            self.validators.insert(key, s.tx_id);
        } else {
            self.delegators.entry(key).or_default().insert(s.tx_id);
        }
        self.queue.insert(self.queue_key(&s));
        self.stakers.insert(s.tx_id, s);
        Ok(())
    }

    pub(crate) fn remove(&mut self, tx_id: &TxId) -> Option<Staker> {
        let s = self.stakers.remove(tx_id)?;
        let qk = self.queue_key(&s);
        self.queue.remove(&qk);
        let key = (s.subnet_id, s.node_id);
        if s.is_validator() {
            self.validators.remove(&key);
        } else if let Some(ds) = self.delegators.get_mut(&key) {
            ds.remove(tx_id);
            if ds.is_empty() {
                self.delegators.remove(&key);
            }
        }
        Some(s)
    }

    #[inline(always)]
    pub(crate) fn get(&self, tx_id: &TxId) -> Option<&Staker> {
        self.stakers.get(tx_id)
    }

    pub(crate) fn validator(&self, subnet: &SubnetId, node: &NodeId) -> Option<&Staker> {
        self.validators
            .get(&(*subnet, *node))
            .and_then(|tx| self.stakers.get(tx))
    }

    pub(crate) fn delegators<'a>(
        &'a self,
        subnet: &SubnetId,
        node: &NodeId,
    ) -> impl Iterator<Item = &'a Staker> + 'a {
        self.delegators
            .get(&(*subnet, *node))
            .into_iter()
            .flatten()
            .filter_map(move |tx| self.stakers.get(tx))
    }

    /// Validators of `subnet`, in node order.
    pub(crate) fn validators_of<'a>(
        &'a self,
        subnet: &SubnetId,
    ) -> impl Iterator<Item = &'a Staker> + 'a {
        let subnet = *subnet;
        self.validators
            .range((subnet, NodeId([0; 20]))..=(subnet, NodeId([u8::MAX; 20])))
            .filter_map(move |(_, tx)| self.stakers.get(tx))
    }

    /// Earliest transition.
    #[inline(always)]
    pub(crate) fn peek(&self) -> Option<&Staker> {
        self.queue.iter().next().and_then(|(_, _, tx)| self.stakers.get(tx))
    }

    /// All stakers in transition order.
    pub(crate) fn iter_ordered(&self) -> impl Iterator<Item = &Staker> {
        self.queue.iter().filter_map(move |(_, _, tx)| self.stakers.get(tx))
    }

    pub(crate) fn len(&self) -> usize {
        self.stakers.len()
    }
}
