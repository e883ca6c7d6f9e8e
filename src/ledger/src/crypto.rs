//!
//! # Crypto collaborator
//!
//! Signature checking is consumed through [`SignatureVerifier`]; the ledger
//! only decides which signers a transaction needs.
//!

use {
    crate::{
        data_model::{Address, Credential},
        error::{Error, Result},
    },
    serde::{Deserialize, Serialize},
    std::{collections::BTreeSet, convert::TryFrom, fmt},
};

/// Length of a compressed BLS12-381 G1 public key.
pub const BLS_PUBLIC_KEY_LEN: usize = 48;

const COMPRESSION_FLAG: u8 = 0x80;
const INFINITY_FLAG: u8 = 0x40;

/// Verifies that `creds` carry a valid signature over `msg` from every
/// address in `required`.
pub trait SignatureVerifier: Send + Sync {
    #[allow(missing_docs)]
    fn verify(&self, msg: &[u8], creds: &[Credential], required: &[Address]) -> bool;
}

/// Owners named by `indices` out of a `threshold`-of-`owners` key set.
///
/// Every index must be in range and distinct, and there must be at least
/// `threshold` of them.
pub fn select_signers(owners: &[Address], threshold: u32, indices: &[u32]) -> Result<Vec<Address>> {
    if indices.len() < threshold as usize {
        return Err(Error::Malformed(format!(
            "{} of {} required owners signed",
            indices.len(),
            threshold
        )));
    }
    let mut seen = BTreeSet::new();
    let mut signers = Vec::with_capacity(indices.len());
    for &i in indices {
        let owner = owners
            .get(i as usize)
            .ok_or_else(|| Error::Malformed(format!("owner index {i} out of range")))?;
        if !seen.insert(i) {
            return Err(Error::Malformed(format!("owner index {i} repeated")));
        }
        signers.push(*owner);
    }
    Ok(signers)
}

/// Deterministic keyed-digest scheme for local networks and tests:
/// the signature of `msg` by `addr` is `sha256(addr || msg)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestVerifier;

impl DigestVerifier {
    /// Produce the credential `addr` would attach to `msg`.
    pub fn sign(addr: Address, msg: &[u8]) -> Credential {
        let mut buf = addr.0.to_vec();
        buf.extend_from_slice(msg);
        Credential {
            signer: addr,
            sig: globutils::sha256(&buf).to_vec(),
        }
    }
}

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, msg: &[u8], creds: &[Credential], required: &[Address]) -> bool {
        required.iter().all(|addr| {
            let expected = Self::sign(*addr, msg);
            creds.iter().any(|c| *c == expected)
        })
    }
}

/// A compressed BLS public key.
///
/// Only the encoding is checked here; group membership belongs to the
/// crypto backend.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct BlsPublicKey(Vec<u8>);

impl BlsPublicKey {
    /// Parse a compressed key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLS_PUBLIC_KEY_LEN {
            return Err(Error::Malformed(format!(
                "bls public key must be {} bytes, got {}",
                BLS_PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        if bytes[0] & COMPRESSION_FLAG == 0 || bytes[0] & INFINITY_FLAG != 0 {
            return Err(Error::Malformed(
                "bls public key is not a compressed finite point".to_owned(),
            ));
        }
        Ok(BlsPublicKey(bytes.to_vec()))
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    #[allow(missing_docs)]
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for BlsPublicKey {
    type Error = Error;
    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        BlsPublicKey::from_bytes(&bytes)
    }
}

impl From<BlsPublicKey> for Vec<u8> {
    fn from(k: BlsPublicKey) -> Self {
        k.0
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({})", hex::encode(&self.0))
    }
}
