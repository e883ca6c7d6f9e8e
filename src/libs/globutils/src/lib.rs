//!
//! # Global common utils
//!

#![deny(missing_docs)]

pub mod logging;

use {
    sha2::{Digest, Sha256},
    std::{fs, path::PathBuf},
};

/// Length of a sha256 digest.
pub const HASH_LEN: usize = 32;

/// Hash arbitrary bytes with sha256.
#[inline(always)]
pub fn sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut h = [0; HASH_LEN];
    h.copy_from_slice(&Sha256::digest(bytes));
    h
}

/// Create a new temporary directory for a `pchain_ledger` test run.
pub fn fresh_tmp_dir() -> PathBuf {
    let basedir = std::env::temp_dir();
    loop {
        let path = basedir.join(format!("pchain_ledger_{}", rand::random::<u64>()));
        if fs::create_dir(&path).is_ok() {
            return path;
        }
    }
}
