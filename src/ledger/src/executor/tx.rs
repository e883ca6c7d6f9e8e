//!
//! Execution of standard-block transactions against a staged ledger.
//!

use {
    crate::{
        crypto::{select_signers, SignatureVerifier},
        data_model::{
            Address, NodeId, Staker, StakerKind, SubnetId, Tx, UnsignedTx, PRIMARY_NETWORK_ID,
        },
        error::{Error, Result},
        shared_memory::{resolve_import, SharedMemory},
        staking::{Staking, Subnet},
    },
    tracing::debug,
};

/// Applies one transaction at a time to a [`Staking`].
///
/// On error the staking state may be partially modified; callers run each
/// transaction on a throwaway copy when they need to continue.
pub(crate) struct StandardTxExecutor<'a> {
    pub verifier: &'a dyn SignatureVerifier,
    pub shared_memory: &'a SharedMemory,
}

impl<'a> StandardTxExecutor<'a> {
    pub fn execute(&self, staking: &mut Staking, tx: &Tx) -> Result<()> {
        let unsigned = tx.unsigned();
        staking.record_tx(tx.body_id()?)?;

        let required = unsigned.required_fee(staking.cfg());
        if unsigned.fee() < required {
            return Err(Error::InsufficientFee {
                required,
                provided: unsigned.fee(),
            });
        }
        if let Some(payer) = unsigned.payer() {
            self.check_signed(tx, &[payer], "payer")?;
            let cost = unsigned
                .fee()
                .checked_add(unsigned.locked_stake())
                .ok_or_else(|| Error::Malformed("fee and stake overflow".to_owned()))?;
            staking.debit(payer, cost)?;
        }

        match unsigned {
            UnsignedTx::AddValidator {
                node_id,
                start_time,
                end_time,
                weight,
                reward_owner,
                delegation_fee,
                bls_key,
                ..
            } => staking.stage_add_staker(Staker {
                tx_id: tx.id(),
                node_id: *node_id,
                subnet_id: PRIMARY_NETWORK_ID,
                weight: *weight,
                start_time: *start_time,
                end_time: *end_time,
                bls_key: bls_key.clone(),
                reward_owner: *reward_owner,
                potential_reward: 0,
                delegation_fee: Some(*delegation_fee),
                kind: StakerKind::PrimaryValidator,
            }),
            UnsignedTx::AddSubnetValidator {
                node_id,
                subnet_id,
                start_time,
                end_time,
                weight,
                subnet_auth,
                ..
            } => {
                self.check_subnet_auth(staking, subnet_id, subnet_auth, tx)?;
                staking.stage_add_staker(Staker {
                    tx_id: tx.id(),
                    node_id: *node_id,
                    subnet_id: *subnet_id,
                    weight: *weight,
                    start_time: *start_time,
                    end_time: *end_time,
                    bls_key: None,
                    reward_owner: Address::default(),
                    potential_reward: 0,
                    delegation_fee: None,
                    kind: StakerKind::SubnetValidator,
                })
            }
            UnsignedTx::AddDelegator {
                node_id,
                start_time,
                end_time,
                weight,
                reward_owner,
                ..
            } => staking.stage_add_staker(Staker {
                tx_id: tx.id(),
                node_id: *node_id,
                subnet_id: PRIMARY_NETWORK_ID,
                weight: *weight,
                start_time: *start_time,
                end_time: *end_time,
                bls_key: None,
                reward_owner: *reward_owner,
                potential_reward: 0,
                delegation_fee: None,
                kind: StakerKind::Delegator,
            }),
            UnsignedTx::RemoveSubnetValidator {
                node_id,
                subnet_id,
                subnet_auth,
                ..
            } => {
                self.check_subnet_auth(staking, subnet_id, subnet_auth, tx)?;
                remove_subnet_validator(staking, subnet_id, node_id)
            }
            UnsignedTx::CreateSubnet {
                owners, threshold, ..
            } => staking.create_subnet(
                tx.id(),
                Subnet {
                    owners: owners.clone(),
                    threshold: *threshold,
                },
            ),
            UnsignedTx::Import {
                source_chain,
                inputs,
                to,
                fee,
            } => {
                for input in inputs.iter() {
                    staking.consume_import(input.utxo_id)?;
                }
                let resolved = resolve_import(self.shared_memory, *source_chain, inputs)?;
                self.check_signed(tx, &resolved.signers, "utxo owner")?;
                if resolved.total < *fee {
                    return Err(Error::InsufficientFee {
                        required: *fee,
                        provided: resolved.total,
                    });
                }
                staking.credit(*to, resolved.total - fee);
                debug!("imported {} from {} to {:?}", resolved.total, source_chain, to);
                Ok(())
            }
            UnsignedTx::RewardValidator { .. } => Err(Error::Malformed(
                "reward transactions only go into proposal blocks".to_owned(),
            )),
        }
    }

    fn check_signed(&self, tx: &Tx, signers: &[Address], role: &str) -> Result<()> {
        if !self.verifier.verify(&tx.unsigned_bytes()?, tx.creds(), signers) {
            return Err(Error::Malformed(format!("missing {role} signature")));
        }
        Ok(())
    }

    /// `auth` holds indices into the subnet's owners; every indexed owner
    /// must have signed, and there must be at least `threshold` of them.
    fn check_subnet_auth(
        &self,
        staking: &Staking,
        subnet_id: &SubnetId,
        auth: &[u32],
        tx: &Tx,
    ) -> Result<()> {
        let Subnet { owners, threshold } = staking.subnet(subnet_id)?;
        let signers = select_signers(owners, *threshold, auth)?;
        if !self.verifier.verify(&tx.unsigned_bytes()?, tx.creds(), &signers) {
            return Err(Error::Malformed("subnet authorization failed".to_owned()));
        }
        Ok(())
    }
}

fn remove_subnet_validator(staking: &mut Staking, subnet: &SubnetId, node: &NodeId) -> Result<()> {
    let s = staking.remove_subnet_validator(subnet, node)?;
    debug!("subnet validator {} left {} early", s.node_id, s.subnet_id);
    Ok(())
}
