//!
//! # Ledger state
//!
//! Committed staking state, the diff index and accepted block history,
//! persisted through a [`KvStore`] and rebuilt from it on restart.
//!

pub mod db;
pub mod diffs;


use {
    crate::{
        data_model::{
            Address, Amount, Block, BlockHeight, BlockId, BlockKind, Genesis, Id, Staker,
            StakerKind, SubnetId, Timestamp, PRIMARY_NETWORK_ID,
        },
        error::{Error, Result},
        staking::{Staking, StakingParts},
    },
    config::staking::StakingConfig,
    db::{KVBatch, KvStore},
    diffs::{DiffIndex, ValidatorSet},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::{convert::TryInto, sync::Arc},
    tracing::info,
};

const META_KEY: &[u8] = b"meta";
const CURRENT_PREFIX: &[u8] = b"staker/c/";
const PENDING_PREFIX: &[u8] = b"staker/p/";
const SUBNET_PREFIX: &[u8] = b"subnet/";
const DELEGATEE_REWARD_PREFIX: &[u8] = b"dreward/";
const BALANCE_PREFIX: &[u8] = b"balance/";
const IMPORT_PREFIX: &[u8] = b"import/";
const TX_PREFIX: &[u8] = b"tx/";
const DIFF_PREFIX: &[u8] = b"diff/";
const BLOCK_PREFIX: &[u8] = b"block/";
const BLOCK_ID_PREFIX: &[u8] = b"blockid/";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    height: BlockHeight,
    last_accepted: BlockId,
    timestamp: Timestamp,
    current_supply: u64,
}

#[inline(always)]
fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(suffix);
    k
}

#[inline(always)]
fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(Error::from)
}

#[inline(always)]
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Fatal(format!("corrupted entry: {e}")))
}

fn suffix_id(k: &[u8], prefix: &[u8]) -> Result<Id> {
    k[prefix.len()..]
        .try_into()
        .map(Id)
        .map_err(|_| Error::Fatal(format!("corrupted key {}", hex::encode(k))))
}

/// Committed chain state.
pub struct LedgerState {
    db: Arc<dyn KvStore>,
    cfg: Arc<StakingConfig>,
    staking: Staking,
    height: BlockHeight,
    last_accepted: BlockId,
    diffs: DiffIndex,
}

impl LedgerState {
    /// Reload the state persisted in `db`, or write `genesis` to an empty one.
    pub fn load_or_init(
        db: Arc<dyn KvStore>,
        cfg: Arc<StakingConfig>,
        genesis: &Genesis,
    ) -> Result<Self> {
        match Self::load(db.clone(), cfg.clone())? {
            Some(ls) => Ok(ls),
            None => Self::init(db, cfg, genesis),
        }
    }

    fn init(db: Arc<dyn KvStore>, cfg: Arc<StakingConfig>, genesis: &Genesis) -> Result<Self> {
        let mut staking = Staking::new(cfg.clone(), genesis.timestamp, genesis.initial_supply);
        for gv in genesis.validators.iter() {
            let tx_id = Id::hash(&encode(&(genesis.timestamp, gv))?);
            staking.add_genesis_validator(Staker {
                tx_id,
                node_id: gv.node_id,
                subnet_id: PRIMARY_NETWORK_ID,
                weight: gv.weight,
                start_time: genesis.timestamp,
                end_time: gv.end_time,
                bls_key: gv.bls_key.clone(),
                reward_owner: gv.reward_owner,
                potential_reward: 0,
                delegation_fee: Some(gv.delegation_fee),
                kind: StakerKind::PrimaryValidator,
            })?;
        }
        for (addr, amount) in genesis.allocations.iter() {
            staking.credit(*addr, *amount);
        }

        let block = Block::new(
            Id::default(),
            0,
            genesis.timestamp,
            BlockKind::Standard { txs: vec![] },
        )?;
        let mut ls = LedgerState {
            db,
            diffs: DiffIndex::new(cfg.validator_set_cache_size),
            staking: Staking::new(cfg.clone(), genesis.timestamp, genesis.initial_supply),
            cfg,
            height: 0,
            last_accepted: Id::default(),
        };
        ls.write_block(&block, staking)?;
        info!(
            "initialized genesis {} with {} validators",
            block.id(),
            genesis.validators.len()
        );
        Ok(ls)
    }

    fn load(db: Arc<dyn KvStore>, cfg: Arc<StakingConfig>) -> Result<Option<Self>> {
        let meta: Meta = match db.get(META_KEY)? {
            Some(bytes) => decode(&bytes)?,
            None => return Ok(None),
        };

        let stakers = |prefix: &[u8]| -> Result<Vec<Staker>> {
            db.iter_prefix(prefix)?
                .iter()
                .map(|(_, v)| decode(v))
                .collect()
        };
        let mut parts = StakingParts {
            timestamp: meta.timestamp,
            current_supply: meta.current_supply,
            current: stakers(CURRENT_PREFIX)?,
            pending: stakers(PENDING_PREFIX)?,
            ..Default::default()
        };
        for (k, v) in db.iter_prefix(SUBNET_PREFIX)? {
            parts.subnets.insert(suffix_id(&k, SUBNET_PREFIX)?, decode(&v)?);
        }
        for (k, v) in db.iter_prefix(DELEGATEE_REWARD_PREFIX)? {
            parts
                .delegatee_rewards
                .insert(suffix_id(&k, DELEGATEE_REWARD_PREFIX)?, decode(&v)?);
        }
        for (_, v) in db.iter_prefix(BALANCE_PREFIX)? {
            let (addr, amount): (Address, Amount) = decode(&v)?;
            parts.balances.insert(addr, amount);
        }
        for (k, _) in db.iter_prefix(IMPORT_PREFIX)? {
            parts.consumed_imports.insert(suffix_id(&k, IMPORT_PREFIX)?);
        }
        for (k, _) in db.iter_prefix(TX_PREFIX)? {
            parts.applied_txs.insert(suffix_id(&k, TX_PREFIX)?);
        }

        let mut diffs = DiffIndex::new(cfg.validator_set_cache_size);
        for (k, v) in db.iter_prefix(DIFF_PREFIX)? {
            let h: [u8; 8] = k[DIFF_PREFIX.len()..]
                .try_into()
                .map_err(|_| Error::Fatal("corrupted diff key".to_owned()))?;
            diffs.record_height(u64::from_be_bytes(h), decode(&v)?)?;
        }

        let staking = Staking::from_parts(cfg.clone(), parts)?;
        let (current, pending) = staking.staker_counts();
        info!(
            "reloaded ledger at height {}: {} current, {} pending stakers",
            meta.height, current, pending
        );
        Ok(Some(LedgerState {
            db,
            cfg,
            staking,
            height: meta.height,
            last_accepted: meta.last_accepted,
            diffs,
        }))
    }

    /// An empty in-memory ledger with no genesis validators.
    #[cfg(test)]
    pub fn tmp_ledger() -> Self {
        let cfg = Arc::new(crate::staking::test::test_cfg());
        let genesis = Genesis {
            timestamp: 0,
            initial_supply: 360_000_000 * config::staking::UNITS,
            validators: vec![],
            allocations: vec![],
        };
        Self::load_or_init(Arc::new(db::MemDB::new()), cfg, &genesis).unwrap()
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn staking(&self) -> &Staking {
        &self.staking
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn cfg(&self) -> &Arc<StakingConfig> {
        &self.cfg
    }

    /// Height of the last accepted block.
    #[inline(always)]
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn last_accepted(&self) -> BlockId {
        self.last_accepted
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn diffs(&self) -> &DiffIndex {
        &self.diffs
    }

    /// Make `block` the new tip. `staged` is the state the block produced;
    /// `None` keeps the current one.
    ///
    /// Everything goes to storage in one batch before memory is touched, so
    /// a failure leaves the previous tip intact.
    pub fn commit(&mut self, block: &Block, staged: Option<Staking>) -> Result<()> {
        if block.parent_id() != self.last_accepted || block.height() != self.height + 1 {
            return Err(Error::Fatal(format!(
                "block {} at height {} does not extend tip {} at height {}",
                block.id(),
                block.height(),
                self.last_accepted,
                self.height
            )));
        }
        let staking = staged.unwrap_or_else(|| self.staking.fork());
        self.write_block(block, staking)
    }

    fn write_block(&mut self, block: &Block, staking: Staking) -> Result<()> {
        let height = block.height();
        let diffs = staking.validator_diffs();

        let mut batch = staking_batch(&staking)?;
        if !diffs.is_empty() {
            batch.push((key(DIFF_PREFIX, &height.to_be_bytes()), Some(encode(&diffs)?)));
        }
        batch.push((key(BLOCK_PREFIX, &height.to_be_bytes()), Some(block.to_bytes()?)));
        batch.push((key(BLOCK_ID_PREFIX, &block.id().0), Some(height.to_be_bytes().to_vec())));
        batch.push((
            META_KEY.to_vec(),
            Some(encode(&Meta {
                height,
                last_accepted: block.id(),
                timestamp: staking.timestamp(),
                current_supply: staking.current_supply(),
            })?),
        ));

        self.db
            .commit(batch)
            .map_err(|e| Error::Fatal(format!("writing block {}: {}", block.id(), e)))?;

        self.diffs.record_height(height, diffs)?;
        self.staking = staking.fork();
        self.height = height;
        self.last_accepted = block.id();
        Ok(())
    }

    /// Validator set of `subnet` right after the block at `height`.
    pub fn validator_set_at(&self, height: BlockHeight, subnet: &SubnetId) -> Result<ValidatorSet> {
        self.diffs
            .validator_set_at(height, subnet, self.height, || self.staking.validator_set(subnet))
    }

    /// Accepted block at `height`.
    pub fn block_at(&self, height: BlockHeight) -> Result<Option<Block>> {
        self.db
            .get(&key(BLOCK_PREFIX, &height.to_be_bytes()))?
            .map(|b| Block::from_bytes(&b))
            .transpose()
    }

    /// Accepted block with id `id`.
    pub fn get_block(&self, id: &BlockId) -> Result<Option<Block>> {
        match self.db.get(&key(BLOCK_ID_PREFIX, &id.0))? {
            Some(h) => {
                let h: [u8; 8] = h
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Fatal("corrupted block index".to_owned()))?;
                self.block_at(u64::from_be_bytes(h))
            }
            None => Ok(None),
        }
    }
}

/// Storage writes for everything `staking` touched since its fork.
fn staking_batch(staking: &Staking) -> Result<KVBatch> {
    let j = staking.journal();
    let mut batch = KVBatch::new();

    for tx in j.stakers.iter() {
        let (c, p) = (key(CURRENT_PREFIX, &tx.0), key(PENDING_PREFIX, &tx.0));
        if let Some(s) = staking.current_staker(tx) {
            batch.push((c, Some(encode(s)?)));
            batch.push((p, None));
        } else if let Some(s) = staking.pending_staker(tx) {
            batch.push((p, Some(encode(s)?)));
            batch.push((c, None));
        } else {
            batch.push((c, None));
            batch.push((p, None));
        }
    }
    for id in j.subnets.iter() {
        batch.push((key(SUBNET_PREFIX, &id.0), Some(encode(staking.subnet(id)?)?)));
    }
    for tx in j.delegatee_rewards.iter() {
        let k = key(DELEGATEE_REWARD_PREFIX, &tx.0);
        match staking.delegatee_reward(tx) {
            0 => batch.push((k, None)),
            r => batch.push((k, Some(encode(&r)?))),
        }
    }
    for addr in j.balances.iter() {
        batch.push((
            key(BALANCE_PREFIX, &addr.0),
            Some(encode(&(*addr, staking.balance(addr)))?),
        ));
    }
    for id in j.imports.iter() {
        batch.push((key(IMPORT_PREFIX, &id.0), Some(vec![])));
    }
    for id in j.txs.iter() {
        batch.push((key(TX_PREFIX, &id.0), Some(vec![])));
    }
    Ok(batch)
}
