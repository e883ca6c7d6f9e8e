//!
//! # Platform-chain ledger
//!
//! Staking ledger, height-indexed validator diffs, the block executor
//! and the shared-memory bridge used by cross-chain imports.
//!

#![warn(missing_docs)]

pub mod crypto;
pub mod data_model;
pub mod error;
pub mod executor;
pub mod shared_memory;
pub mod staking;
pub mod store;

pub use error::{Error, NotFound, Result};
