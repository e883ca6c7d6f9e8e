//!
//! # Block executor
//!
//! Builds, verifies, accepts and rejects platform-chain blocks.
//!
//! A verified block keeps the ledger it produced in memory until consensus
//! decides it: accepting persists that staged state, rejecting drops it.
//! Proposal blocks stage two ledgers, one per option. The committed state
//! and every processing block sit behind a single chain lock, so readers
//! never observe a half-accepted block.
//!

mod mempool;
pub mod network;
mod tx;

#[cfg(test)]
mod test;

pub use mempool::Mempool;

use {
    crate::{
        crypto::SignatureVerifier,
        data_model::{
            Address, Amount, Block, BlockHeight, BlockId, BlockKind, ChainId, Genesis, NodeId,
            Staker, Status, SubnetId, Timestamp, Tx, TxId, UnsignedTx,
        },
        error::{Error, NotFound, Result},
        shared_memory::{import_key, Requests, SharedMemory},
        staking::{RewardDecision, RewardMode, Staking},
        store::{db::KvStore, diffs::ValidatorSet, LedgerState},
    },
    config::staking::{global_cfg, StakingConfig},
    lru::LruCache,
    parking_lot::RwLock,
    std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        num::NonZeroUsize,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::{SystemTime, UNIX_EPOCH},
    },
    tracing::{debug, error, info, warn},
    tx::StandardTxExecutor,
};

const REJECTED_CACHE_SIZE: usize = 256;

/// Source of wall-clock time, in unix seconds.
pub trait Clock: Send + Sync {
    #[allow(missing_docs)]
    fn now(&self) -> Timestamp;
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct MockClock(AtomicU64);

impl MockClock {
    #[allow(missing_docs)]
    pub fn new(now: Timestamp) -> Self {
        MockClock(AtomicU64::new(now))
    }

    #[allow(missing_docs)]
    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

enum Staged {
    Standard(Staking),
    Proposal {
        on_commit: Staking,
        on_abort: Staking,
    },
}

struct BlockEntry {
    block: Block,
    status: Status,
    // None until the block passes verification
    staged: Option<Staged>,
}

/// Everything guarded by the chain lock.
struct ChainState {
    ledger: LedgerState,
    // processing blocks above the accepted height, plus an accepted proposal
    // until one of its options is accepted
    blocks: HashMap<BlockId, BlockEntry>,
    // recently rejected blocks
    rejected: LruCache<BlockId, Block>,
    preferred: BlockId,
    mempool: Mempool,
    halted: bool,
}

/// The platform-chain virtual machine.
pub struct Vm {
    chain: RwLock<ChainState>,
    cfg: Arc<StakingConfig>,
    verifier: Arc<dyn SignatureVerifier>,
    shared_memory: SharedMemory,
    clock: Arc<dyn Clock>,
}

impl Vm {
    /// Open the chain persisted in `db`, initializing it from `genesis` when
    /// the store is empty.
    pub fn new(
        db: Arc<dyn KvStore>,
        cfg: Arc<StakingConfig>,
        genesis: &Genesis,
        shared_memory: SharedMemory,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ledger = LedgerState::load_or_init(db, cfg.clone(), genesis)?;
        info!(
            "chain {} at height {}, last accepted {}",
            shared_memory.chain_id(),
            ledger.height(),
            ledger.last_accepted()
        );
        let preferred = ledger.last_accepted();
        Ok(Vm {
            chain: RwLock::new(ChainState {
                ledger,
                blocks: HashMap::new(),
                rejected: LruCache::new(
                    NonZeroUsize::new(REJECTED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
                ),
                preferred,
                mempool: Mempool::new(cfg.mempool_size),
                halted: false,
            }),
            cfg,
            verifier,
            shared_memory,
            clock,
        })
    }

    /// [`Vm::new`] under the process-wide staking configuration.
    pub fn with_global_cfg(
        db: Arc<dyn KvStore>,
        genesis: &Genesis,
        shared_memory: SharedMemory,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cfg = Arc::new(global_cfg::CFG.clone());
        Self::new(db, cfg, genesis, shared_memory, verifier, clock)
    }

    #[inline(always)]
    fn tx_executor(&self) -> StandardTxExecutor<'_> {
        StandardTxExecutor {
            verifier: &*self.verifier,
            shared_memory: &self.shared_memory,
        }
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn chain_id(&self) -> ChainId {
        self.shared_memory.chain_id()
    }

    /// Check `tx` against the preferred state and queue it for a block.
    pub fn issue_tx(&self, tx: Tx) -> Result<TxId> {
        let mut chain = self.chain.write();
        chain.check_running()?;

        let id = tx.id();
        if let UnsignedTx::RewardValidator { .. } = tx.unsigned() {
            return Err(Error::Malformed(
                "reward transactions are built, not issued".to_owned(),
            ));
        }
        if chain.mempool.contains(&id) {
            return Err(Error::Conflict(format!("tx {id} already issued")));
        }

        let mut staged = chain.admission_state().fork();
        if let Err(e) = self.tx_executor().execute(&mut staged, &tx) {
            debug!("refused tx {}: {}", id, e);
            return Err(e);
        }
        chain.mempool.add(tx)?;
        debug!("issued tx {}", id);
        Ok(id)
    }

    /// Build a block on the preferred block.
    ///
    /// When a staker awaits its reward decision the block is a proposal;
    /// otherwise it is a standard block advancing chain time towards now,
    /// without skipping the next staker change.
    pub fn build_block(&self) -> Result<Block> {
        let mut chain = self.chain.write();
        chain.check_running()?;

        let parent_id = chain.preferred;
        let (height, mut staged) = match chain.blocks.get(&parent_id) {
            Some(BlockEntry {
                block,
                staged: Some(Staged::Standard(s)),
                ..
            }) => (block.height(), s.fork()),
            Some(BlockEntry {
                staged: Some(Staged::Proposal { .. }),
                ..
            }) => {
                debug!("preferred block {} is an undecided proposal", parent_id);
                return Err(Error::NothingToBuild);
            }
            _ => (chain.ledger.height(), chain.ledger.staking().fork()),
        };
        let parent_ts = staged.timestamp();

        if let Some(due) = staged.reward_due() {
            let staker_tx_id = due.tx_id;
            let tx = Tx::new(UnsignedTx::RewardValidator { staker_tx_id }, vec![])?;
            let block = Block::new(parent_id, height + 1, parent_ts, BlockKind::Proposal { tx })?;
            info!(
                "built proposal {} at height {} for staker {}",
                block.id(),
                block.height(),
                staker_tx_id
            );
            return Ok(block);
        }

        let mut ts = self.clock.now();
        if let Some(next) = staged.next_staker_change_time() {
            ts = ts.min(next);
        }
        let ts = ts.max(parent_ts);
        let events = staged.advance_time(ts, RewardMode::Defer)?;

        let exec = self.tx_executor();
        let mut txs = vec![];
        let mut dropped = vec![];
        for tx in chain.mempool.iter() {
            if txs.len() >= self.cfg.max_block_txs {
                break;
            }
            let mut attempt = staged.clone();
            match exec.execute(&mut attempt, tx) {
                Ok(()) => {
                    staged = attempt;
                    txs.push(tx.clone());
                }
                Err(e) if e.is_recoverable() => debug!("tx {} not ready: {}", tx.id(), e),
                Err(e) => dropped.push((tx.id(), e)),
            }
        }
        for (id, e) in dropped {
            warn!("dropping tx {}: {}", id, e);
            chain.mempool.drop_tx(&id, e.to_string());
        }

        if txs.is_empty() && events.is_empty() && staged.reward_due().is_none() {
            return Err(Error::NothingToBuild);
        }
        let block = Block::new(parent_id, height + 1, ts, BlockKind::Standard { txs })?;
        if chain.rejected.contains(&block.id()) {
            // same parent, time and txs as a block consensus already refused
            debug!("block {} was rejected, waiting for the clock", block.id());
            return Err(Error::NothingToBuild);
        }
        for tx in block.txs() {
            chain.mempool.remove(&tx.id());
        }
        info!(
            "built block {} at height {} with {} txs",
            block.id(),
            block.height(),
            block.txs().len()
        );
        Ok(block)
    }

    /// Decode a block received from a peer.
    pub fn parse_block(&self, bytes: &[u8]) -> Result<Block> {
        Block::from_bytes(bytes)
    }

    /// Execute `block` on its parent's state and stage the result.
    ///
    /// A block that fails stays processing and may be verified again, e.g.
    /// once a missing shared-memory entry shows up or its parent verifies.
    pub fn verify(&self, block: &Block) -> Result<()> {
        let mut chain = self.chain.write();
        chain.check_running()?;

        let id = block.id();
        if chain.rejected.contains(&id) {
            return Err(Error::Conflict(format!("block {id} was rejected")));
        }
        match chain.blocks.get(&id) {
            Some(e) if e.staged.is_some() => return Ok(()),
            Some(_) => {}
            None if block.height() <= chain.ledger.height() => {
                return match chain.ledger.get_block(&id)? {
                    Some(_) => Ok(()),
                    None => Err(Error::Conflict(format!(
                        "block {} at height {} conflicts with accepted history",
                        id,
                        block.height()
                    ))),
                };
            }
            None => {}
        }

        let result = chain.execute(block, self.clock.now(), &self.tx_executor());
        let entry = chain.blocks.entry(id).or_insert_with(|| BlockEntry {
            block: block.clone(),
            status: Status::Processing,
            staged: None,
        });
        match result {
            Ok(staged) => {
                entry.staged = Some(staged);
                debug!("verified block {} at height {}", id, block.height());
                Ok(())
            }
            Err(e) => {
                debug!("block {} failed verification: {}", id, e);
                Err(e)
            }
        }
    }

    /// Persist a verified block whose parent is the last accepted block.
    ///
    /// A failure while writing halts the chain: every later call that
    /// changes state reports `Fatal`.
    pub fn accept(&self, id: &BlockId) -> Result<()> {
        let mut chain = self.chain.write();
        chain.check_running()?;

        if *id == chain.ledger.last_accepted() {
            return Ok(());
        }
        if chain.rejected.contains(id) {
            return Err(Error::Conflict(format!("block {id} was rejected")));
        }
        let parent_id = match chain.blocks.get(id) {
            Some(e) if e.status == Status::Accepted => return Ok(()),
            Some(e) if e.staged.is_none() => {
                return Err(Error::Malformed(format!("block {id} is not verified")));
            }
            Some(e) => e.block.parent_id(),
            None => {
                return match chain.ledger.get_block(id)? {
                    Some(_) => Ok(()),
                    None => Err(Error::NotFound(NotFound::Block(*id))),
                };
            }
        };
        if parent_id != chain.ledger.last_accepted() {
            return Err(Error::Conflict(format!(
                "parent of block {id} is not the last accepted block"
            )));
        }

        let mut entry = chain
            .blocks
            .remove(id)
            .ok_or(Error::NotFound(NotFound::Block(*id)))?;
        let block = entry.block.clone();
        let result = match entry.staged.take() {
            Some(Staged::Standard(s)) => {
                commit_block(&mut chain.ledger, &self.shared_memory, &block, Some(s))
            }
            Some(proposal) => {
                // the options still execute on the staged branches
                let r = commit_block(&mut chain.ledger, &self.shared_memory, &block, None);
                entry.staged = Some(proposal);
                entry.status = Status::Accepted;
                chain.blocks.insert(*id, entry);
                r
            }
            None => Err(Error::Malformed(format!("block {id} is not verified"))),
        };
        if let Err(e) = result {
            chain.halted = true;
            error!("accepting block {} failed, halting: {}", id, e);
            return Err(Error::Fatal(format!("accepting block {id}: {e}")));
        }

        if matches!(chain.blocks.get(&parent_id), Some(e) if e.status == Status::Accepted) {
            chain.blocks.remove(&parent_id);
        }
        for tx in block.txs() {
            chain.mempool.remove(&tx.id());
        }
        if chain.preferred == parent_id {
            chain.preferred = *id;
        }
        chain.prune(block.height());
        info!("accepted block {} at height {}", id, block.height());
        Ok(())
    }

    /// Drop the staged state of a processing block. Its transactions go
    /// back to the mempool.
    pub fn reject(&self, id: &BlockId) -> Result<()> {
        let mut chain = self.chain.write();
        chain.check_running()?;

        if chain.rejected.contains(id) {
            return Ok(());
        }
        match chain.blocks.get(id).map(|e| e.status) {
            Some(Status::Accepted) => {
                return Err(Error::Conflict(format!("block {id} is accepted")));
            }
            Some(_) => {}
            None if *id == chain.ledger.last_accepted() || chain.ledger.get_block(id)?.is_some() => {
                return Err(Error::Conflict(format!("block {id} is accepted")));
            }
            None => return Err(Error::NotFound(NotFound::Block(*id))),
        }
        let entry = chain
            .blocks
            .remove(id)
            .ok_or(Error::NotFound(NotFound::Block(*id)))?;
        chain.discard(entry);
        info!("rejected block {}", id);
        Ok(())
    }

    /// The two options of a proposal, preferred one first.
    pub fn options(&self, proposal: &BlockId) -> Result<[Block; 2]> {
        let chain = self.chain.read();
        let e = chain
            .blocks
            .get(proposal)
            .ok_or(Error::NotFound(NotFound::Block(*proposal)))?;
        if !matches!(e.block.kind(), BlockKind::Proposal { .. }) {
            return Err(Error::Malformed(format!("block {proposal} is not a proposal")));
        }
        let (height, ts) = (e.block.height() + 1, e.block.timestamp());
        Ok([
            Block::new(*proposal, height, ts, BlockKind::Commit)?,
            Block::new(*proposal, height, ts, BlockKind::Abort)?,
        ])
    }

    /// Build on `id` from now on.
    pub fn set_preference(&self, id: &BlockId) -> Result<()> {
        let mut chain = self.chain.write();
        let known = *id == chain.ledger.last_accepted()
            || matches!(chain.blocks.get(id), Some(e) if e.staged.is_some());
        if !known {
            return Err(Error::NotFound(NotFound::Block(*id)));
        }
        chain.preferred = *id;
        Ok(())
    }

    /// A block and its decision status.
    pub fn get_block(&self, id: &BlockId) -> Result<(Block, Status)> {
        let chain = self.chain.read();
        if let Some(e) = chain.blocks.get(id) {
            return Ok((e.block.clone(), e.status));
        }
        if let Some(b) = chain.rejected.peek(id) {
            return Ok((b.clone(), Status::Rejected));
        }
        chain
            .ledger
            .get_block(id)?
            .map(|b| (b, Status::Accepted))
            .ok_or(Error::NotFound(NotFound::Block(*id)))
    }

    #[allow(missing_docs)]
    pub fn last_accepted(&self) -> BlockId {
        self.chain.read().ledger.last_accepted()
    }

    #[allow(missing_docs)]
    pub fn preferred(&self) -> BlockId {
        self.chain.read().preferred
    }

    /// Height of the last accepted block.
    pub fn height(&self) -> BlockHeight {
        self.chain.read().ledger.height()
    }

    /// Chain time of the last accepted block.
    pub fn timestamp(&self) -> Timestamp {
        self.chain.read().ledger.staking().timestamp()
    }

    #[allow(missing_docs)]
    pub fn current_supply(&self) -> Amount {
        self.chain.read().ledger.staking().current_supply()
    }

    #[allow(missing_docs)]
    pub fn balance(&self, addr: &Address) -> Amount {
        self.chain.read().ledger.staking().balance(addr)
    }

    #[allow(missing_docs)]
    pub fn current_validator(&self, subnet: &SubnetId, node: &NodeId) -> Result<Staker> {
        self.chain.read().ledger.staking().current_validator(subnet, node)
    }

    #[allow(missing_docs)]
    pub fn pending_validator(&self, subnet: &SubnetId, node: &NodeId) -> Result<Staker> {
        self.chain.read().ledger.staking().pending_validator(subnet, node)
    }

    /// Validator set of `subnet` at the last accepted block.
    pub fn validator_set(&self, subnet: &SubnetId) -> ValidatorSet {
        self.chain.read().ledger.staking().validator_set(subnet)
    }

    /// Validator set of `subnet` right after the block at `height`.
    pub fn validator_set_at(&self, height: BlockHeight, subnet: &SubnetId) -> Result<ValidatorSet> {
        self.chain.read().ledger.validator_set_at(height, subnet)
    }

    #[allow(missing_docs)]
    pub fn mempool_len(&self) -> usize {
        self.chain.read().mempool.len()
    }

    /// Why `tx` was dropped from the mempool, if it was recently.
    pub fn dropped_reason(&self, tx: &TxId) -> Option<String> {
        self.chain.read().mempool.dropped_reason(tx)
    }
}

impl ChainState {
    #[inline(always)]
    fn check_running(&self) -> Result<()> {
        if self.halted {
            return Err(Error::Fatal("chain halted after a failed accept".to_owned()));
        }
        Ok(())
    }

    /// State new transactions are checked against.
    fn admission_state(&self) -> &Staking {
        match self.blocks.get(&self.preferred).and_then(|e| e.staged.as_ref()) {
            Some(Staged::Standard(s)) => s,
            Some(Staged::Proposal { on_commit, .. }) => on_commit,
            None => self.ledger.staking(),
        }
    }

    /// Reject every processing block that can no longer be accepted once
    /// the block at `accepted` is: those at or below that height and their
    /// descendants.
    fn prune(&mut self, accepted: BlockHeight) {
        let mut dead: BTreeSet<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, e)| e.status == Status::Processing && e.block.height() <= accepted)
            .map(|(id, _)| *id)
            .collect();
        loop {
            let orphans: Vec<BlockId> = self
                .blocks
                .iter()
                .filter(|(id, e)| !dead.contains(*id) && dead.contains(&e.block.parent_id()))
                .map(|(id, _)| *id)
                .collect();
            if orphans.is_empty() {
                break;
            }
            dead.extend(orphans);
        }

        for id in dead {
            if let Some(entry) = self.blocks.remove(&id) {
                debug!("pruned block {} at height {}", id, entry.block.height());
                self.discard(entry);
            }
        }
        if self.preferred != self.ledger.last_accepted() && !self.blocks.contains_key(&self.preferred)
        {
            self.preferred = self.ledger.last_accepted();
        }
    }

    /// Remember `entry` as rejected and queue its transactions again,
    /// except those some accepted block already applied.
    fn discard(&mut self, entry: BlockEntry) {
        if let BlockKind::Standard { txs } = entry.block.kind() {
            for tx in txs {
                let applied = tx
                    .body_id()
                    .map_or(false, |id| self.ledger.staking().is_tx_applied(&id));
                if applied {
                    continue;
                }
                if let Err(e) = self.mempool.add(tx.clone()) {
                    debug!("not re-queueing tx {}: {}", tx.id(), e);
                }
            }
        }
        if self.preferred == entry.block.id() {
            self.preferred = entry.block.parent_id();
        }
        self.rejected.put(entry.block.id(), entry.block);
    }

    fn height_of(&self, id: &BlockId) -> Option<BlockHeight> {
        if *id == self.ledger.last_accepted() {
            return Some(self.ledger.height());
        }
        self.blocks.get(id).map(|e| e.block.height())
    }

    /// State a child of kind `kind` executes on.
    fn parent_state(&self, parent: &BlockId, kind: &BlockKind) -> Result<&Staking> {
        if self.rejected.contains(parent) {
            return Err(Error::Conflict(format!("parent {parent} was rejected")));
        }
        let entry = self.blocks.get(parent);
        let option = matches!(kind, BlockKind::Commit | BlockKind::Abort);

        match (entry.and_then(|e| e.staged.as_ref()), kind) {
            (Some(Staged::Proposal { on_commit, .. }), BlockKind::Commit) => Ok(on_commit),
            (Some(Staged::Proposal { on_abort, .. }), BlockKind::Abort) => Ok(on_abort),
            (Some(Staged::Proposal { .. }), _) => Err(Error::Malformed(format!(
                "proposal {parent} is only followed by commit or abort"
            ))),
            (Some(Staged::Standard(_)), _) if option => Err(Error::Malformed(format!(
                "parent {parent} is not a proposal"
            ))),
            (Some(Staged::Standard(s)), _) => Ok(s),
            (None, _) if *parent == self.ledger.last_accepted() => {
                if option {
                    return Err(Error::Malformed(format!("parent {parent} is not a proposal")));
                }
                Ok(self.ledger.staking())
            }
            (None, _) => Err(Error::NotFound(NotFound::Block(*parent))),
        }
    }

    fn execute(
        &self,
        block: &Block,
        now: Timestamp,
        exec: &StandardTxExecutor<'_>,
    ) -> Result<Staged> {
        let parent_id = block.parent_id();
        let parent = self.parent_state(&parent_id, block.kind())?;
        let parent_height = self
            .height_of(&parent_id)
            .ok_or(Error::NotFound(NotFound::Block(parent_id)))?;
        if block.height() != parent_height + 1 {
            return Err(Error::Malformed(format!(
                "height {} does not follow parent height {}",
                block.height(),
                parent_height
            )));
        }
        let ts = block.timestamp();

        match block.kind() {
            BlockKind::Standard { txs } => {
                if let Some(s) = parent.reward_due() {
                    return Err(Error::InvalidTiming(format!(
                        "staker {} awaits its reward decision",
                        s.tx_id
                    )));
                }
                check_standard_timestamp(parent, ts, now)?;
                if txs.len() > parent.cfg().max_block_txs {
                    return Err(Error::Malformed(format!("{} txs in one block", txs.len())));
                }
                let mut ids = BTreeSet::new();
                if let Some(dup) = txs.iter().find(|tx| !ids.insert(tx.id())) {
                    return Err(Error::Conflict(format!("tx {} included twice", dup.id())));
                }

                let mut staged = parent.fork();
                let events = staged.advance_time(ts, RewardMode::Defer)?;
                if txs.is_empty() && events.is_empty() && staged.reward_due().is_none() {
                    return Err(Error::Malformed("block changes nothing".to_owned()));
                }
                for tx in txs {
                    exec.execute(&mut staged, tx)?;
                }
                Ok(Staged::Standard(staged))
            }
            BlockKind::Proposal { tx } => {
                if ts != parent.timestamp() {
                    return Err(Error::InvalidTiming(format!(
                        "proposal time {} differs from chain time {}",
                        ts,
                        parent.timestamp()
                    )));
                }
                let due = parent
                    .reward_due()
                    .map(|s| s.tx_id)
                    .ok_or_else(|| Error::Malformed("no staker awaits a reward".to_owned()))?;
                match tx.unsigned() {
                    UnsignedTx::RewardValidator { staker_tx_id } if *staker_tx_id == due => {}
                    _ => {
                        return Err(Error::Malformed(format!(
                            "proposal has to decide staker {due}"
                        )));
                    }
                }

                let mut on_commit = parent.fork();
                on_commit.remove_current_staker(&due, RewardDecision::Commit)?;
                let mut on_abort = parent.fork();
                on_abort.remove_current_staker(&due, RewardDecision::Abort)?;
                Ok(Staged::Proposal {
                    on_commit,
                    on_abort,
                })
            }
            BlockKind::Commit | BlockKind::Abort => {
                if ts != parent.timestamp() {
                    return Err(Error::InvalidTiming(format!(
                        "option time {} differs from proposal time {}",
                        ts,
                        parent.timestamp()
                    )));
                }
                // the branch already carries the decision; keep its journal
                Ok(Staged::Standard(parent.clone()))
            }
        }
    }
}

fn check_standard_timestamp(parent: &Staking, ts: Timestamp, now: Timestamp) -> Result<()> {
    if ts < parent.timestamp() {
        return Err(Error::InvalidTiming(format!(
            "block time {} before parent time {}",
            ts,
            parent.timestamp()
        )));
    }
    if ts > now.saturating_add(parent.cfg().sync_bound) {
        return Err(Error::InvalidTiming(format!(
            "block time {ts} too far ahead of local time {now}"
        )));
    }
    if let Some(next) = parent.next_staker_change_time() {
        if ts > next {
            return Err(Error::InvalidTiming(format!(
                "block time {ts} skips the staker change at {next}"
            )));
        }
    }
    Ok(())
}

/// Consume the shared-memory entries imported by `block`, then persist it.
fn commit_block(
    ledger: &mut LedgerState,
    shared_memory: &SharedMemory,
    block: &Block,
    staged: Option<Staking>,
) -> Result<()> {
    let mut requests: BTreeMap<ChainId, Requests> = BTreeMap::new();
    for tx in block.txs() {
        if let UnsignedTx::Import {
            source_chain,
            inputs,
            ..
        } = tx.unsigned()
        {
            requests
                .entry(*source_chain)
                .or_default()
                .removes
                .extend(inputs.iter().map(import_key));
        }
    }
    if !requests.is_empty() {
        shared_memory.apply(requests)?;
    }
    ledger.commit(block, staged)
}
