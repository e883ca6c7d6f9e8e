//!
//! # Error taxonomy
//!
//! Callers branch on the class of a failure: admission errors go back to
//! the submitter, recoverable verification errors leave a block processing,
//! and `Fatal` halts the chain.
//!

use {
    crate::data_model::{BlockHeight, BlockId, ChainId, NodeId, SubnetId, TxId},
    thiserror::Error,
};

/// Result alias used across the ledger.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the ledger reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Accepting the staker would push a validator above its maximum weight
    /// at some instant of the staker's window.
    #[error("validator {node} on subnet {subnet} would be over-delegated")]
    #[allow(missing_docs)]
    OverDelegated { subnet: SubnetId, node: NodeId },
    /// Start/end ordering, duration bounds or block timestamp violations.
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    /// Stake amount or delegation fee outside the configured bounds.
    #[error("invalid stake: {0}")]
    InvalidStake(String),
    #[allow(missing_docs)]
    #[error("insufficient fee: required {required}, provided {provided}")]
    InsufficientFee { required: u64, provided: u64 },
    /// Referenced state is missing.
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),
    /// Structurally invalid transaction or block.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The operation collides with existing state, e.g. a double spend.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The mempool holds nothing that can go into a block right now.
    #[error("nothing to build")]
    NothingToBuild,
    /// Encoding or decoding failure.
    #[error("codec: {0}")]
    Codec(String),
    /// Storage corruption or a broken invariant; processing must stop.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// What was missing for an `Error::NotFound`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum NotFound {
    #[error("validator {node} on subnet {subnet}")]
    Validator { subnet: SubnetId, node: NodeId },
    #[error("staker {0}")]
    Staker(TxId),
    #[error("subnet {0}")]
    Subnet(SubnetId),
    #[error("block {0}")]
    Block(BlockId),
    #[error("height {0}")]
    Height(BlockHeight),
    #[error("shared memory entry {key} from chain {chain}")]
    SharedMemory { chain: ChainId, key: String },
}

impl Error {
    /// Failures that may disappear on their own, so a block hitting one
    /// stays processing and a mempool keeps the transaction.
    #[inline(always)]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotFound(NotFound::SharedMemory { .. }))
    }

    /// Wrap any displayable failure as `Fatal`.
    #[inline(always)]
    pub fn fatal(e: impl std::fmt::Display) -> Self {
        Error::Fatal(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
