//!
//! # Data model
//!
//! Identifiers, stakers, transactions and blocks of the platform chain.
//!

use {
    crate::{
        crypto::BlsPublicKey,
        error::{Error, Result},
    },
    config::staking::StakingConfig,
    serde::{Deserialize, Serialize},
    std::{convert::TryFrom, fmt},
};


/// Unix seconds.
pub type Timestamp = u64;
#[allow(missing_docs)]
pub type BlockHeight = u64;
/// Nano-units of the staking asset.
pub type Amount = u64;
/// Stake weight, in the same unit as `Amount`.
pub type Weight = u64;

/// 32-byte sha256 identifier.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Id(pub [u8; 32]);

#[allow(missing_docs)]
pub type TxId = Id;
#[allow(missing_docs)]
pub type BlockId = Id;
/// A subnet is identified by the id of the transaction that created it.
pub type SubnetId = Id;
#[allow(missing_docs)]
pub type ChainId = Id;

/// The subnet every validator belongs to.
pub const PRIMARY_NETWORK_ID: SubnetId = Id([0; 32]);

impl Id {
    /// sha256 of `bytes`.
    #[inline(always)]
    pub fn hash(bytes: &[u8]) -> Self {
        Id(globutils::sha256(bytes))
    }

    #[allow(missing_docs)]
    pub fn random() -> Self {
        Id(rand::random())
    }

    #[allow(missing_docs)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

/// 20-byte node identity.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    #[allow(missing_docs)]
    pub fn random() -> Self {
        NodeId(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID-{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 20-byte account address; reward owners and import recipients.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

/// Role of a staker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum StakerKind {
    PrimaryValidator,
    SubnetValidator,
    Delegator,
}

impl StakerKind {
    /// Tie-break among pending stakers starting at the same instant.
    #[inline(always)]
    pub fn pending_rank(self) -> u8 {
        match self {
            StakerKind::PrimaryValidator => 0,
            StakerKind::SubnetValidator => 1,
            StakerKind::Delegator => 2,
        }
    }

    /// Tie-break among current stakers ending at the same instant.
    #[inline(always)]
    pub fn removal_rank(self) -> u8 {
        match self {
            StakerKind::SubnetValidator => 0,
            StakerKind::Delegator => 1,
            StakerKind::PrimaryValidator => 2,
        }
    }

    /// Whether removal of this staker goes through a reward decision.
    #[inline(always)]
    pub fn is_rewarded(self) -> bool {
        !matches!(self, StakerKind::SubnetValidator)
    }
}

/// A bonded stake over a fixed window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Staker {
    pub tx_id: TxId,
    pub node_id: NodeId,
    pub subnet_id: SubnetId,
    pub weight: Weight,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub bls_key: Option<BlsPublicKey>,
    pub reward_owner: Address,
    // fixed when the staker is promoted
    pub potential_reward: Amount,
    // validators only, parts per million
    pub delegation_fee: Option<u32>,
    pub kind: StakerKind,
}

impl Staker {
    #[allow(missing_docs)]
    #[inline(always)]
    pub fn duration(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn is_validator(&self) -> bool {
        !matches!(self.kind, StakerKind::Delegator)
    }
}

/// Weight and key of one node in a validator set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ValidatorEntry {
    pub weight: Weight,
    pub bls_key: Option<BlsPublicKey>,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightDiff {
    pub decrease: bool,
    pub amount: Weight,
}

/// Change of one validator-set entry caused by one accepted block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DiffRecord {
    pub subnet_id: SubnetId,
    pub node_id: NodeId,
    pub weight: WeightDiff,
    pub bls_before: Option<BlsPublicKey>,
    pub bls_after: Option<BlsPublicKey>,
}

/// One UTXO being imported from a peer chain's shared memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ImportInput {
    pub utxo_id: Id,
    pub amount: Amount,
    // indices into the exported output's owners that signed the import
    pub sig_indices: Vec<u32>,
}

/// Value a peer chain publishes for an exported UTXO. Spending it takes
/// `threshold` signatures out of `owners`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExportedOutput {
    pub amount: Amount,
    pub owners: Vec<Address>,
    pub threshold: u32,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsignedTx {
    AddValidator {
        node_id: NodeId,
        start_time: Timestamp,
        end_time: Timestamp,
        weight: Weight,
        reward_owner: Address,
        delegation_fee: u32,
        bls_key: Option<BlsPublicKey>,
        payer: Address,
        fee: Amount,
    },
    AddSubnetValidator {
        node_id: NodeId,
        subnet_id: SubnetId,
        start_time: Timestamp,
        end_time: Timestamp,
        weight: Weight,
        // indices into the subnet's owner list
        subnet_auth: Vec<u32>,
        payer: Address,
        fee: Amount,
    },
    AddDelegator {
        node_id: NodeId,
        start_time: Timestamp,
        end_time: Timestamp,
        weight: Weight,
        reward_owner: Address,
        payer: Address,
        fee: Amount,
    },
    RemoveSubnetValidator {
        node_id: NodeId,
        subnet_id: SubnetId,
        subnet_auth: Vec<u32>,
        payer: Address,
        fee: Amount,
    },
    CreateSubnet {
        owners: Vec<Address>,
        threshold: u32,
        payer: Address,
        fee: Amount,
    },
    Import {
        source_chain: ChainId,
        inputs: Vec<ImportInput>,
        to: Address,
        fee: Amount,
    },
    /// Only ever built by the block builder, never issued.
    RewardValidator { staker_tx_id: TxId },
}

impl UnsignedTx {
    /// Fee carried by the transaction.
    pub fn fee(&self) -> Amount {
        match self {
            UnsignedTx::AddValidator { fee, .. }
            | UnsignedTx::AddSubnetValidator { fee, .. }
            | UnsignedTx::AddDelegator { fee, .. }
            | UnsignedTx::RemoveSubnetValidator { fee, .. }
            | UnsignedTx::CreateSubnet { fee, .. }
            | UnsignedTx::Import { fee, .. } => *fee,
            UnsignedTx::RewardValidator { .. } => 0,
        }
    }

    /// Account paying the fee and, for stakers, the locked stake. Imports
    /// pay out of the imported funds.
    pub fn payer(&self) -> Option<Address> {
        match self {
            UnsignedTx::AddValidator { payer, .. }
            | UnsignedTx::AddSubnetValidator { payer, .. }
            | UnsignedTx::AddDelegator { payer, .. }
            | UnsignedTx::RemoveSubnetValidator { payer, .. }
            | UnsignedTx::CreateSubnet { payer, .. } => Some(*payer),
            UnsignedTx::Import { .. } | UnsignedTx::RewardValidator { .. } => None,
        }
    }

    /// Stake locked from the payer until the staker leaves.
    pub fn locked_stake(&self) -> Amount {
        match self {
            UnsignedTx::AddValidator { weight, .. } | UnsignedTx::AddDelegator { weight, .. } => {
                *weight
            }
            _ => 0,
        }
    }

    /// Fee the transaction has to burn.
    pub fn required_fee(&self, cfg: &StakingConfig) -> Amount {
        match self {
            UnsignedTx::AddValidator { .. } => cfg.add_primary_network_validator_fee,
            UnsignedTx::AddSubnetValidator { .. } => cfg.add_subnet_validator_fee,
            UnsignedTx::AddDelegator { .. } => cfg.add_delegator_fee,
            UnsignedTx::CreateSubnet { .. } => cfg.create_subnet_fee,
            UnsignedTx::RemoveSubnetValidator { .. } | UnsignedTx::Import { .. } => {
                cfg.tx_fee
            }
            UnsignedTx::RewardValidator { .. } => 0,
        }
    }
}

/// Signature material attached to a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Credential {
    pub signer: Address,
    pub sig: Vec<u8>,
}

/// Wire form of a [`Tx`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignedTx {
    pub unsigned: UnsignedTx,
    pub creds: Vec<Credential>,
}

/// A signed transaction together with its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignedTx", into = "SignedTx")]
pub struct Tx {
    unsigned: UnsignedTx,
    creds: Vec<Credential>,
    id: TxId,
}

impl Tx {
    /// The id is the sha256 of the encoded signed transaction.
    pub fn new(unsigned: UnsignedTx, creds: Vec<Credential>) -> Result<Self> {
        let signed = SignedTx { unsigned, creds };
        let id = Id::hash(&bincode::serialize(&signed)?);
        Ok(Tx {
            unsigned: signed.unsigned,
            creds: signed.creds,
            id,
        })
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn unsigned(&self) -> &UnsignedTx {
        &self.unsigned
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn creds(&self) -> &[Credential] {
        &self.creds
    }

    /// Bytes the credentials sign.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.unsigned).map_err(Error::from)
    }

    /// Id of the unsigned body. Reordering or adding credentials changes
    /// [`Tx::id`] but not this one.
    pub fn body_id(&self) -> Result<TxId> {
        Ok(Id::hash(&self.unsigned_bytes()?))
    }

    #[allow(missing_docs)]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::from)
    }

    #[allow(missing_docs)]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::from)
    }
}

impl TryFrom<SignedTx> for Tx {
    type Error = Error;
    fn try_from(s: SignedTx) -> Result<Self> {
        Tx::new(s.unsigned, s.creds)
    }
}

impl From<Tx> for SignedTx {
    fn from(tx: Tx) -> Self {
        SignedTx {
            unsigned: tx.unsigned,
            creds: tx.creds,
        }
    }
}

/// Payload of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Batched transactions, executed after advancing chain time.
    Standard {
        #[allow(missing_docs)]
        txs: Vec<Tx>,
    },
    /// Carries a reward decision; followed by exactly one accepted option.
    Proposal {
        #[allow(missing_docs)]
        tx: Tx,
    },
    /// Option of a proposal that pays the reward.
    Commit,
    /// Option of a proposal that forfeits the reward.
    Abort,
}

/// Wire form of a [`Block`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct UnsignedBlock {
    pub parent_id: BlockId,
    pub height: BlockHeight,
    pub timestamp: Timestamp,
    pub kind: BlockKind,
}

/// A block together with its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UnsignedBlock", into = "UnsignedBlock")]
pub struct Block {
    inner: UnsignedBlock,
    id: BlockId,
}

impl Block {
    #[allow(missing_docs)]
    pub fn new(
        parent_id: BlockId,
        height: BlockHeight,
        timestamp: Timestamp,
        kind: BlockKind,
    ) -> Result<Self> {
        let inner = UnsignedBlock {
            parent_id,
            height,
            timestamp,
            kind,
        };
        let id = Id::hash(&bincode::serialize(&inner)?);
        Ok(Block { inner, id })
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn parent_id(&self) -> BlockId {
        self.inner.parent_id
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn height(&self) -> BlockHeight {
        self.inner.height
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn timestamp(&self) -> Timestamp {
        self.inner.timestamp
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn kind(&self) -> &BlockKind {
        &self.inner.kind
    }

    /// Transactions carried by the block, in execution order.
    pub fn txs(&self) -> &[Tx] {
        match &self.inner.kind {
            BlockKind::Standard { txs } => txs,
            BlockKind::Proposal { tx } => std::slice::from_ref(tx),
            BlockKind::Commit | BlockKind::Abort => &[],
        }
    }

    #[allow(missing_docs)]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::from)
    }

    #[allow(missing_docs)]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::from)
    }
}

impl TryFrom<UnsignedBlock> for Block {
    type Error = Error;
    fn try_from(b: UnsignedBlock) -> Result<Self> {
        Block::new(b.parent_id, b.height, b.timestamp, b.kind)
    }
}

impl From<Block> for UnsignedBlock {
    fn from(b: Block) -> Self {
        b.inner
    }
}

/// Decision status of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Status {
    Processing,
    Accepted,
    Rejected,
}

/// A validator of the primary network present at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GenesisValidator {
    pub node_id: NodeId,
    pub weight: Weight,
    pub end_time: Timestamp,
    pub reward_owner: Address,
    pub delegation_fee: u32,
    pub bls_key: Option<BlsPublicKey>,
}

/// Initial state of the chain, accepted as height 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Genesis {
    pub timestamp: Timestamp,
    pub initial_supply: Amount,
    pub validators: Vec<GenesisValidator>,
    // spendable balances
    pub allocations: Vec<(Address, Amount)>,
}
