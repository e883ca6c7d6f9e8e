//!
//! # Shared memory
//!
//! Key/value areas through which two chains exchange atomic transfers.
//! The area written by chain `A` for chain `B` is read, and consumed, by
//! `B` only. Lookups never wait: a missing entry is reported at once and
//! retrying is up to the caller.
//!

use {
    crate::{
        crypto::select_signers,
        data_model::{Address, Amount, ChainId, ExportedOutput, ImportInput},
        error::{Error, NotFound, Result},
    },
    parking_lot::Mutex,
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    },
};

type Area = BTreeMap<Vec<u8>, Vec<u8>>;

/// All areas of one node, keyed by (writer, reader).
#[derive(Debug, Default)]
pub struct Memory {
    areas: Mutex<BTreeMap<(ChainId, ChainId), Area>>,
}

impl Memory {
    #[allow(missing_docs)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle through which `chain` reads and writes its areas.
    pub fn new_shared_memory(self: &Arc<Self>, chain: ChainId) -> SharedMemory {
        SharedMemory {
            chain,
            memory: Arc::clone(self),
        }
    }
}

/// Writes one chain performs against one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requests {
    /// Entries published for the peer to read.
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    /// Entries the peer published for us, now consumed.
    pub removes: Vec<Vec<u8>>,
}

/// One chain's view of the shared memory.
#[derive(Clone, Debug)]
pub struct SharedMemory {
    chain: ChainId,
    memory: Arc<Memory>,
}

impl SharedMemory {
    #[allow(missing_docs)]
    #[inline(always)]
    pub fn chain_id(&self) -> ChainId {
        self.chain
    }

    /// Values `peer` published for this chain under `keys`, in order.
    pub fn get(&self, peer: ChainId, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let areas = self.memory.areas.lock();
        let area = areas.get(&(peer, self.chain));
        keys.iter()
            .map(|k| {
                area.and_then(|a| a.get(k)).cloned().ok_or_else(|| {
                    Error::NotFound(NotFound::SharedMemory {
                        chain: peer,
                        key: hex::encode(k),
                    })
                })
            })
            .collect()
    }

    /// Apply all requests atomically: either every put and remove happens or
    /// none does.
    pub fn apply(&self, requests: BTreeMap<ChainId, Requests>) -> Result<()> {
        let mut areas = self.memory.areas.lock();

        for (peer, req) in requests.iter() {
            if *peer == self.chain {
                return Err(Error::Malformed("shared memory request to self".to_owned()));
            }
            let inbound = areas.get(&(*peer, self.chain));
            let mut seen = BTreeSet::new();
            for k in req.removes.iter() {
                if !seen.insert(k) || !inbound.map_or(false, |a| a.contains_key(k)) {
                    return Err(Error::NotFound(NotFound::SharedMemory {
                        chain: *peer,
                        key: hex::encode(k),
                    }));
                }
            }
            let outbound = areas.get(&(self.chain, *peer));
            let mut seen = BTreeSet::new();
            for (k, _) in req.puts.iter() {
                if !seen.insert(k) || outbound.map_or(false, |a| a.contains_key(k)) {
                    return Err(Error::Conflict(format!(
                        "shared memory key {} already published",
                        hex::encode(k)
                    )));
                }
            }
        }

        for (peer, req) in requests {
            if let Some(inbound) = areas.get_mut(&(peer, self.chain)) {
                for k in req.removes.iter() {
                    inbound.remove(k);
                }
            }
            let outbound = areas.entry((self.chain, peer)).or_default();
            outbound.extend(req.puts);
        }
        Ok(())
    }
}

/// Shared-memory key of an imported UTXO.
#[inline(always)]
pub fn import_key(input: &ImportInput) -> Vec<u8> {
    input.utxo_id.0.to_vec()
}

/// What an import may spend, once every input has been found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Sum of the input amounts.
    pub total: Amount,
    /// Owners whose signatures the import has to carry.
    pub signers: Vec<Address>,
}

/// Check that `source_chain` published every input with the declared amount,
/// and collect their total and the owners that have to sign.
pub fn resolve_import(
    shared: &SharedMemory,
    source_chain: ChainId,
    inputs: &[ImportInput],
) -> Result<ResolvedImport> {
    if source_chain == shared.chain_id() {
        return Err(Error::Malformed("import from the importing chain".to_owned()));
    }
    if inputs.is_empty() {
        return Err(Error::Malformed("import without inputs".to_owned()));
    }
    let keys: Vec<Vec<u8>> = inputs.iter().map(import_key).collect();
    let values = shared.get(source_chain, &keys)?;

    let mut total: Amount = 0;
    let mut signers = vec![];
    for (input, value) in inputs.iter().zip(values.iter()) {
        let out: ExportedOutput = bincode::deserialize(value)?;
        if out.amount != input.amount {
            return Err(Error::Malformed(format!(
                "utxo {} holds {}, import claims {}",
                input.utxo_id, out.amount, input.amount
            )));
        }
        signers.extend(select_signers(&out.owners, out.threshold, &input.sig_indices)?);
        total = total
            .checked_add(out.amount)
            .ok_or_else(|| Error::Malformed("import amount overflows".to_owned()))?;
    }
    signers.sort();
    signers.dedup();
    Ok(ResolvedImport { total, signers })
}
