//!
//! # Staking
//!
//! - current and pending stakers of the primary network and every subnet
//! - admission checks, including the over-delegation timeline check
//! - time advancement: promotion, removal and reward settlement
//! - a journal of touched state, drained by the store at accept time
//!

pub mod reward;
mod set;


use {
    crate::{
        data_model::{
            Address, Amount, DiffRecord, Id, NodeId, Staker, StakerKind, SubnetId,
            Timestamp, TxId, ValidatorEntry, Weight, WeightDiff, PRIMARY_NETWORK_ID,
        },
        error::{Error, NotFound, Result},
    },
    config::staking::{StakingConfig, PERCENT_DENOMINATOR},
    serde::{Deserialize, Serialize},
    set::StakerSet,
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    },
    tracing::debug,
};

/// Owner key set of a subnet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Subnet {
    pub owners: Vec<Address>,
    pub threshold: u32,
}

/// How `advance_time` treats stakers that are due a reward decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewardMode {
    /// Remove them, paying the reward.
    Settle,
    /// Stop at the first one; a proposal block decides it.
    Defer,
}

/// Outcome of a proposal block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RewardDecision {
    Commit,
    Abort,
}

/// One transition performed by `advance_time`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum StakerEvent {
    Promoted(TxId),
    Removed { tx_id: TxId, reward: Amount },
}

/// Keys touched since the last fork, and the validator-set entries as they
/// were before the first touch.
#[derive(Clone, Debug, Default)]
#[allow(missing_docs)]
pub struct Journal {
    pub validators: BTreeMap<(SubnetId, NodeId), Option<ValidatorEntry>>,
    pub stakers: BTreeSet<TxId>,
    pub subnets: BTreeSet<SubnetId>,
    pub delegatee_rewards: BTreeSet<TxId>,
    pub balances: BTreeSet<Address>,
    pub imports: BTreeSet<Id>,
    pub txs: BTreeSet<TxId>,
}

/// Everything persisted for a [`Staking`]; the indices are rebuilt on load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StakingParts {
    pub timestamp: Timestamp,
    pub current_supply: Amount,
    pub current: Vec<Staker>,
    pub pending: Vec<Staker>,
    pub subnets: BTreeMap<SubnetId, Subnet>,
    pub delegatee_rewards: BTreeMap<TxId, Amount>,
    pub balances: BTreeMap<Address, Amount>,
    pub consumed_imports: BTreeSet<Id>,
    pub applied_txs: BTreeSet<TxId>,
}

/// The staking ledger.
///
/// A block works on a [`Staking::fork`] of its parent's state; the fork is
/// swapped in when the block is accepted and dropped when it is rejected.
#[derive(Clone, Debug)]
pub struct Staking {
    cfg: Arc<StakingConfig>,
    timestamp: Timestamp,
    current_supply: Amount,
    current: StakerSet,
    pending: StakerSet,
    subnets: BTreeMap<SubnetId, Subnet>,
    // accumulated delegation fees, keyed by validator tx
    delegatee_rewards: BTreeMap<TxId, Amount>,
    balances: BTreeMap<Address, Amount>,
    consumed_imports: BTreeSet<Id>,
    // every issued transaction applied so far; none of them may apply again
    applied_txs: BTreeSet<TxId>,
    journal: Journal,
}

impl Staking {
    /// An empty ledger at `timestamp` with `initial_supply` in circulation.
    pub fn new(cfg: Arc<StakingConfig>, timestamp: Timestamp, initial_supply: Amount) -> Self {
        Staking {
            cfg,
            timestamp,
            current_supply: initial_supply,
            current: StakerSet::current(),
            pending: StakerSet::pending(),
            subnets: BTreeMap::new(),
            delegatee_rewards: BTreeMap::new(),
            balances: BTreeMap::new(),
            consumed_imports: BTreeSet::new(),
            applied_txs: BTreeSet::new(),
            journal: Journal::default(),
        }
    }

    /// Rebuild from persisted parts.
    pub fn from_parts(cfg: Arc<StakingConfig>, parts: StakingParts) -> Result<Self> {
        let mut s = Staking::new(cfg, parts.timestamp, parts.current_supply);
        for staker in parts.current {
            s.current.insert(staker).map_err(Error::fatal)?;
        }
        for staker in parts.pending {
            s.pending.insert(staker).map_err(Error::fatal)?;
        }
        s.subnets = parts.subnets;
        s.delegatee_rewards = parts.delegatee_rewards;
        s.balances = parts.balances;
        s.consumed_imports = parts.consumed_imports;
        s.applied_txs = parts.applied_txs;
        Ok(s)
    }

    /// Snapshot everything that has to survive a restart.
    pub fn to_parts(&self) -> StakingParts {
        StakingParts {
            timestamp: self.timestamp,
            current_supply: self.current_supply,
            current: self.current.iter_ordered().cloned().collect(),
            pending: self.pending.iter_ordered().cloned().collect(),
            subnets: self.subnets.clone(),
            delegatee_rewards: self.delegatee_rewards.clone(),
            balances: self.balances.clone(),
            consumed_imports: self.consumed_imports.clone(),
            applied_txs: self.applied_txs.clone(),
        }
    }

    /// A copy of this state with an empty journal, for a child block.
    pub fn fork(&self) -> Self {
        let mut s = self.clone();
        s.journal = Journal::default();
        s
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn cfg(&self) -> &StakingConfig {
        &self.cfg
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Chain time.
    #[inline(always)]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn current_supply(&self) -> Amount {
        self.current_supply
    }

    #[allow(missing_docs)]
    pub fn balance(&self, addr: &Address) -> Amount {
        self.balances.get(addr).copied().unwrap_or(0)
    }

    /// Fees collected for a validator from its delegators, not yet paid out.
    pub fn delegatee_reward(&self, validator_tx: &TxId) -> Amount {
        self.delegatee_rewards.get(validator_tx).copied().unwrap_or(0)
    }

    #[allow(missing_docs)]
    pub fn subnet(&self, id: &SubnetId) -> Result<&Subnet> {
        self.subnets
            .get(id)
            .ok_or(Error::NotFound(NotFound::Subnet(*id)))
    }

    #[allow(missing_docs)]
    pub fn is_import_consumed(&self, utxo_id: &Id) -> bool {
        self.consumed_imports.contains(utxo_id)
    }

    #[allow(missing_docs)]
    pub fn is_tx_applied(&self, tx_id: &TxId) -> bool {
        self.applied_txs.contains(tx_id)
    }

    #[allow(missing_docs)]
    pub fn current_staker(&self, tx_id: &TxId) -> Option<&Staker> {
        self.current.get(tx_id)
    }

    #[allow(missing_docs)]
    pub fn pending_staker(&self, tx_id: &TxId) -> Option<&Staker> {
        self.pending.get(tx_id)
    }

    /// The active validator of `node` on `subnet`.
    pub fn current_validator(&self, subnet: &SubnetId, node: &NodeId) -> Result<Staker> {
        self.current
            .validator(subnet, node)
            .cloned()
            .ok_or_else(|| not_found_validator(subnet, node))
    }

    /// The validator of `node` on `subnet` that has not started yet.
    pub fn pending_validator(&self, subnet: &SubnetId, node: &NodeId) -> Result<Staker> {
        self.pending
            .validator(subnet, node)
            .cloned()
            .ok_or_else(|| not_found_validator(subnet, node))
    }

    /// Active delegators of `node` on `subnet`.
    pub fn current_delegators(&self, subnet: &SubnetId, node: &NodeId) -> Vec<Staker> {
        self.current.delegators(subnet, node).cloned().collect()
    }

    #[allow(missing_docs)]
    pub fn pending_delegators(&self, subnet: &SubnetId, node: &NodeId) -> Vec<Staker> {
        self.pending.delegators(subnet, node).cloned().collect()
    }

    /// Current set entry of `node`: its own weight plus all active delegations.
    pub fn validator_entry(&self, subnet: &SubnetId, node: &NodeId) -> Option<ValidatorEntry> {
        let v = self.current.validator(subnet, node)?;
        let delegated: Weight = self.current.delegators(subnet, node).map(|d| d.weight).sum();
        Some(ValidatorEntry {
            weight: v.weight + delegated,
            bls_key: v.bls_key.clone(),
        })
    }

    /// The whole current validator set of `subnet`.
    pub fn validator_set(&self, subnet: &SubnetId) -> BTreeMap<NodeId, ValidatorEntry> {
        self.current
            .validators_of(subnet)
            .filter_map(|v| {
                self.validator_entry(subnet, &v.node_id)
                    .map(|e| (v.node_id, e))
            })
            .collect()
    }

    /// Earliest pending start or current end.
    pub fn next_staker_change_time(&self) -> Option<Timestamp> {
        let start = self.pending.peek().map(|s| s.start_time);
        let end = self.current.peek().map(|s| s.end_time);
        match (start, end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The first current staker whose window has closed and who still waits
    /// for a reward decision.
    pub fn reward_due(&self) -> Option<&Staker> {
        self.current
            .iter_ordered()
            .take_while(|s| s.end_time <= self.timestamp)
            .find(|s| s.kind.is_rewarded())
    }

    /// Maximum total weight a primary-network validator of own weight `weight`
    /// may carry.
    #[inline(always)]
    pub fn max_validator_weight(&self, weight: Weight) -> Weight {
        weight
            .saturating_mul(self.cfg.max_validator_weight_factor)
            .min(self.cfg.max_validator_stake)
    }

    /// Check `staker` against the bounds and the existing timeline, and put
    /// it into the pending set.
    ///
    /// Subnet validators take over the BLS key of their primary-network
    /// validator; the potential reward is fixed later, at promotion.
    pub fn stage_add_staker(&mut self, mut staker: Staker) -> Result<()> {
        self.check_window(&staker)?;
        if staker.weight == 0 {
            return Err(Error::InvalidStake("zero weight".to_owned()));
        }
        if self.current.get(&staker.tx_id).is_some()
            || self.pending.get(&staker.tx_id).is_some()
        {
            return Err(Error::Conflict(format!(
                "staking tx {} already applied",
                staker.tx_id
            )));
        }
        staker.potential_reward = 0;

        match staker.kind {
            StakerKind::PrimaryValidator => {
                staker.subnet_id = PRIMARY_NETWORK_ID;
                self.check_primary_validator(&staker)?;
            }
            StakerKind::SubnetValidator => {
                let primary = self.check_subnet_validator(&staker)?;
                staker.bls_key = primary.bls_key;
            }
            StakerKind::Delegator => {
                staker.subnet_id = PRIMARY_NETWORK_ID;
                staker.delegation_fee = None;
                staker.bls_key = None;
                self.check_delegator(&staker)?;
            }
        }

        debug!(
            "staged {:?} {} on {} for [{}, {}]",
            staker.kind, staker.node_id, staker.subnet_id, staker.start_time, staker.end_time
        );
        self.journal.stakers.insert(staker.tx_id);
        self.pending.insert(staker)
    }

    fn check_window(&self, s: &Staker) -> Result<()> {
        if s.end_time <= s.start_time {
            return Err(Error::InvalidTiming(format!(
                "end time {} not after start time {}",
                s.end_time, s.start_time
            )));
        }
        if s.start_time <= self.timestamp {
            return Err(Error::InvalidTiming(format!(
                "start time {} not after chain time {}",
                s.start_time, self.timestamp
            )));
        }
        if s.start_time > self.timestamp.saturating_add(self.cfg.max_future_start_time) {
            return Err(Error::InvalidTiming(format!(
                "start time {} too far in the future",
                s.start_time
            )));
        }
        let d = s.duration();
        if d < self.cfg.min_stake_duration || d > self.cfg.max_stake_duration {
            return Err(Error::InvalidTiming(format!(
                "duration {} outside [{}, {}]",
                d, self.cfg.min_stake_duration, self.cfg.max_stake_duration
            )));
        }
        Ok(())
    }

    fn check_primary_validator(&self, s: &Staker) -> Result<()> {
        if s.weight < self.cfg.min_validator_stake || s.weight > self.cfg.max_validator_stake {
            return Err(Error::InvalidStake(format!(
                "validator weight {} outside [{}, {}]",
                s.weight, self.cfg.min_validator_stake, self.cfg.max_validator_stake
            )));
        }
        let fee = s.delegation_fee.unwrap_or(0) as u64;
        if fee < self.cfg.min_delegation_fee as u64 || fee > PERCENT_DENOMINATOR {
            return Err(Error::InvalidStake(format!("delegation fee {fee} out of range")));
        }
        self.check_no_validator(&PRIMARY_NETWORK_ID, &s.node_id)
    }

    fn check_no_validator(&self, subnet: &SubnetId, node: &NodeId) -> Result<()> {
        if self.current.validator(subnet, node).is_some()
            || self.pending.validator(subnet, node).is_some()
        {
            return Err(Error::Conflict(format!(
                "{node} already validates subnet {subnet}"
            )));
        }
        Ok(())
    }

    /// The primary-network validator whose window contains `s`.
    fn containing_validator(&self, s: &Staker) -> Result<Staker> {
        let v = self
            .current
            .validator(&PRIMARY_NETWORK_ID, &s.node_id)
            .or_else(|| self.pending.validator(&PRIMARY_NETWORK_ID, &s.node_id))
            .ok_or_else(|| not_found_validator(&PRIMARY_NETWORK_ID, &s.node_id))?;
        if s.start_time < v.start_time || s.end_time > v.end_time {
            return Err(Error::InvalidTiming(format!(
                "window [{}, {}] not within validator window [{}, {}]",
                s.start_time, s.end_time, v.start_time, v.end_time
            )));
        }
        Ok(v.clone())
    }

    fn check_subnet_validator(&self, s: &Staker) -> Result<Staker> {
        if s.subnet_id == PRIMARY_NETWORK_ID {
            return Err(Error::Malformed(
                "subnet validator on the primary network".to_owned(),
            ));
        }
        self.subnet(&s.subnet_id)?;
        self.check_no_validator(&s.subnet_id, &s.node_id)?;
        self.containing_validator(s)
    }

    fn check_delegator(&self, s: &Staker) -> Result<()> {
        if s.weight < self.cfg.min_delegator_stake {
            return Err(Error::InvalidStake(format!(
                "delegation {} below minimum {}",
                s.weight, self.cfg.min_delegator_stake
            )));
        }
        let v = self.containing_validator(s)?;
        let peak = self.peak_delegated_weight(&v.node_id, s.start_time, s.end_time);
        let max = self.max_validator_weight(v.weight);
        if v.weight as u128 + peak as u128 + s.weight as u128 > max as u128 {
            return Err(Error::OverDelegated {
                subnet: PRIMARY_NETWORK_ID,
                node: v.node_id,
            });
        }
        Ok(())
    }

    /// Largest total weight delegated to `node` at any instant of
    /// `[start, end]`, over current and pending delegators.
    ///
    /// Windows are closed: a delegation ending at `t` still overlaps one
    /// starting at `t`.
    pub fn peak_delegated_weight(&self, node: &NodeId, start: Timestamp, end: Timestamp) -> Weight {
        // (time, 0 = starts / 1 = ends, weight)
        let mut events: Vec<(Timestamp, u8, Weight)> = self
            .current
            .delegators(&PRIMARY_NETWORK_ID, node)
            .chain(self.pending.delegators(&PRIMARY_NETWORK_ID, node))
            .filter(|d| d.start_time <= end && d.end_time >= start)
            .flat_map(|d| [(d.start_time, 0, d.weight), (d.end_time, 1, d.weight)])
            .collect();
        events.sort_unstable();

        let mut running: Weight = 0;
        let mut peak: Weight = 0;
        for (_, ends, w) in events {
            if ends == 0 {
                running = running.saturating_add(w);
                peak = peak.max(running);
            } else {
                running = running.saturating_sub(w);
            }
        }
        peak
    }

    /// Move chain time to `to`, promoting and removing stakers in event
    /// order. Promotions go first among events at the same instant.
    pub fn advance_time(&mut self, to: Timestamp, mode: RewardMode) -> Result<Vec<StakerEvent>> {
        if to < self.timestamp {
            return Err(Error::InvalidTiming(format!(
                "cannot move chain time back from {} to {}",
                self.timestamp, to
            )));
        }

        let mut events = vec![];
        loop {
            let promote = self
                .pending
                .peek()
                .filter(|s| s.start_time <= to)
                .map(|s| (s.start_time, s.tx_id));
            let remove = self
                .current
                .peek()
                .filter(|s| s.end_time <= to)
                .map(|s| (s.end_time, s.tx_id, s.kind));

            match (promote, remove) {
                (Some((at, tx_id)), r) if r.map_or(true, |(end, ..)| at <= end) => {
                    self.timestamp = self.timestamp.max(at);
                    self.promote(&tx_id)?;
                    events.push(StakerEvent::Promoted(tx_id));
                }
                (_, Some((at, tx_id, StakerKind::SubnetValidator))) => {
                    self.timestamp = self.timestamp.max(at);
                    self.remove_subnet_staker(&tx_id)?;
                    events.push(StakerEvent::Removed { tx_id, reward: 0 });
                }
                (_, Some((at, tx_id, _))) => {
                    if mode == RewardMode::Defer {
                        break;
                    }
                    self.timestamp = self.timestamp.max(at);
                    let reward = self.remove_current_staker(&tx_id, RewardDecision::Commit)?;
                    events.push(StakerEvent::Removed { tx_id, reward });
                }
                _ => break,
            }
        }
        self.timestamp = to;
        Ok(events)
    }

    fn promote(&mut self, tx_id: &TxId) -> Result<()> {
        let mut staker = self
            .pending
            .remove(tx_id)
            .ok_or(Error::NotFound(NotFound::Staker(*tx_id)))?;
        if staker.kind.is_rewarded() {
            staker.potential_reward = self.settle_reward(&staker);
        }
        debug!(
            "promoted {:?} {} on {}, potential reward {}",
            staker.kind, staker.node_id, staker.subnet_id, staker.potential_reward
        );
        self.touch(&staker.subnet_id, &staker.node_id);
        self.journal.stakers.insert(*tx_id);
        self.current.insert(staker)
    }

    /// Reward `staker` earns over its whole window, reserved out of the
    /// remaining supply. Zero for windows opened before rewards were enabled
    /// or once the supply cap is reached.
    pub fn settle_reward(&mut self, staker: &Staker) -> Amount {
        if staker.start_time < self.cfg.reward.rewards_enabled_from {
            return 0;
        }
        let r = reward::calculate(
            &self.cfg.reward,
            staker.duration(),
            staker.weight,
            self.current_supply,
        );
        self.current_supply = self.current_supply.saturating_add(r);
        r
    }

    fn remove_subnet_staker(&mut self, tx_id: &TxId) -> Result<Staker> {
        let (subnet, node) = match self.current.get(tx_id) {
            Some(s) => (s.subnet_id, s.node_id),
            None => return Err(Error::NotFound(NotFound::Staker(*tx_id))),
        };
        self.touch(&subnet, &node);
        self.journal.stakers.insert(*tx_id);
        let s = self
            .current
            .remove(tx_id)
            .ok_or(Error::NotFound(NotFound::Staker(*tx_id)))?;
        debug!("removed subnet validator {} from {}", s.node_id, s.subnet_id);
        Ok(s)
    }

    /// Remove a current primary-network staker whose window has closed,
    /// applying the reward decision. The stake goes back to the reward owner;
    /// the returned amount is what was paid on top of it.
    pub fn remove_current_staker(
        &mut self,
        tx_id: &TxId,
        decision: RewardDecision,
    ) -> Result<Amount> {
        let staker = self
            .current
            .get(tx_id)
            .cloned()
            .ok_or(Error::NotFound(NotFound::Staker(*tx_id)))?;
        if !staker.kind.is_rewarded() {
            return Err(Error::Malformed(format!(
                "staker {tx_id} is not settled through a reward decision"
            )));
        }
        if staker.end_time > self.timestamp {
            return Err(Error::InvalidTiming(format!(
                "staker {} ends at {}, chain time is {}",
                tx_id, staker.end_time, self.timestamp
            )));
        }

        self.touch(&staker.subnet_id, &staker.node_id);
        self.current.remove(tx_id);
        self.journal.stakers.insert(*tx_id);

        let reward = staker.potential_reward;
        let mut paid = 0;
        match (staker.kind, decision) {
            (StakerKind::Delegator, RewardDecision::Commit) => {
                let v = self
                    .current
                    .validator(&PRIMARY_NETWORK_ID, &staker.node_id)
                    .map(|v| (v.tx_id, v.delegation_fee.unwrap_or(0)));
                let fee = match v {
                    Some((v_tx, rate)) => {
                        let fee = (reward as u128 * rate as u128
                            / PERCENT_DENOMINATOR as u128) as Amount;
                        if fee > 0 {
                            let acc = self.delegatee_rewards.entry(v_tx).or_insert(0);
                            *acc = acc.saturating_add(fee);
                            self.journal.delegatee_rewards.insert(v_tx);
                        }
                        fee
                    }
                    None => 0,
                };
                paid = reward.saturating_sub(fee);
                self.credit(staker.reward_owner, paid);
            }
            (StakerKind::PrimaryValidator, RewardDecision::Commit) => {
                paid = reward;
                self.credit(staker.reward_owner, paid);
            }
            (_, RewardDecision::Abort) => {
                self.current_supply = self.current_supply.saturating_sub(reward);
            }
            (StakerKind::SubnetValidator, _) => {}
        }

        // the stake and delegation fees come back whatever the decision
        self.credit(staker.reward_owner, staker.weight);
        if staker.kind == StakerKind::PrimaryValidator {
            if let Some(fees) = self.delegatee_rewards.remove(tx_id) {
                self.journal.delegatee_rewards.insert(*tx_id);
                self.credit(staker.reward_owner, fees);
                paid += fees;
            }
        }

        debug!(
            "removed {:?} {} with {:?}, paid {}",
            staker.kind, staker.node_id, decision, paid
        );
        Ok(paid)
    }

    /// Remove a subnet validator before its window ends, whether it has
    /// started or not. Only current removals change the validator set.
    pub fn remove_subnet_validator(&mut self, subnet: &SubnetId, node: &NodeId) -> Result<Staker> {
        if *subnet == PRIMARY_NETWORK_ID {
            return Err(Error::Malformed(
                "primary network validators can not be removed early".to_owned(),
            ));
        }
        if let Some(tx_id) = self.current.validator(subnet, node).map(|s| s.tx_id) {
            return self.remove_subnet_staker(&tx_id);
        }
        if let Some(tx_id) = self.pending.validator(subnet, node).map(|s| s.tx_id) {
            self.journal.stakers.insert(tx_id);
            return self
                .pending
                .remove(&tx_id)
                .ok_or(Error::NotFound(NotFound::Staker(tx_id)));
        }
        Err(not_found_validator(subnet, node))
    }

    /// Register a subnet under the id of the transaction creating it.
    pub fn create_subnet(&mut self, id: SubnetId, subnet: Subnet) -> Result<()> {
        if subnet.threshold == 0 || subnet.threshold as usize > subnet.owners.len() {
            return Err(Error::Malformed(format!(
                "threshold {} with {} owners",
                subnet.threshold,
                subnet.owners.len()
            )));
        }
        if id == PRIMARY_NETWORK_ID || self.subnets.contains_key(&id) {
            return Err(Error::Conflict(format!("subnet {id} exists")));
        }
        self.subnets.insert(id, subnet);
        self.journal.subnets.insert(id);
        Ok(())
    }

    /// Mark `tx_id` as applied. Applying the same transaction twice is a
    /// double spend.
    pub fn record_tx(&mut self, tx_id: TxId) -> Result<()> {
        if !self.applied_txs.insert(tx_id) {
            return Err(Error::Conflict(format!("tx {tx_id} already applied")));
        }
        self.journal.txs.insert(tx_id);
        Ok(())
    }

    /// Mark an imported UTXO as spent on this chain.
    pub fn consume_import(&mut self, utxo_id: Id) -> Result<()> {
        if !self.consumed_imports.insert(utxo_id) {
            return Err(Error::Conflict(format!("utxo {utxo_id} already imported")));
        }
        self.journal.imports.insert(utxo_id);
        Ok(())
    }

    /// Take `amount` out of the balance of `addr`.
    pub fn debit(&mut self, addr: Address, amount: Amount) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let balance = self.balance(&addr);
        if balance < amount {
            return Err(Error::InsufficientFee {
                required: amount,
                provided: balance,
            });
        }
        self.balances.insert(addr, balance - amount);
        self.journal.balances.insert(addr);
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn credit(&mut self, addr: Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        let b = self.balances.entry(addr).or_insert(0);
        *b = b.saturating_add(amount);
        self.journal.balances.insert(addr);
    }

    /// Insert a genesis validator straight into the current set, under the
    /// same stake and fee bounds as any other validator.
    pub fn add_genesis_validator(&mut self, mut staker: Staker) -> Result<()> {
        staker.kind = StakerKind::PrimaryValidator;
        staker.subnet_id = PRIMARY_NETWORK_ID;
        if staker.end_time <= self.timestamp {
            return Err(Error::InvalidTiming(format!(
                "genesis validator {} ends before genesis",
                staker.node_id
            )));
        }
        self.check_primary_validator(&staker)?;
        staker.potential_reward = self.settle_reward(&staker);
        self.touch(&staker.subnet_id, &staker.node_id);
        self.journal.stakers.insert(staker.tx_id);
        self.current.insert(staker)
    }

    fn touch(&mut self, subnet: &SubnetId, node: &NodeId) {
        let key = (*subnet, *node);
        if !self.journal.validators.contains_key(&key) {
            let before = self.validator_entry(subnet, node);
            self.journal.validators.insert(key, before);
        }
    }

    /// Validator-set changes since the last fork, one record per entry.
    pub fn validator_diffs(&self) -> Vec<DiffRecord> {
        self.journal
            .validators
            .iter()
            .filter_map(|((subnet, node), before)| {
                let after = self.validator_entry(subnet, node);
                let wb = before.as_ref().map_or(0, |e| e.weight);
                let wa = after.as_ref().map_or(0, |e| e.weight);
                let bls_before = before.as_ref().and_then(|e| e.bls_key.clone());
                let bls_after = after.as_ref().and_then(|e| e.bls_key.clone());
                if wb == wa && bls_before == bls_after {
                    return None;
                }
                Some(DiffRecord {
                    subnet_id: *subnet,
                    node_id: *node,
                    weight: WeightDiff {
                        decrease: wa < wb,
                        amount: wa.abs_diff(wb),
                    },
                    bls_before,
                    bls_after,
                })
            })
            .collect()
    }

    /// Number of (current, pending) stakers.
    pub fn staker_counts(&self) -> (usize, usize) {
        (self.current.len(), self.pending.len())
    }
}

#[inline(always)]
fn not_found_validator(subnet: &SubnetId, node: &NodeId) -> Error {
    Error::NotFound(NotFound::Validator {
        subnet: *subnet,
        node: *node,
    })
}
