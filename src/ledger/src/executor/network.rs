//!
//! Requests peers send to this chain, answered from the last accepted
//! state. Every request carries a deadline; once it has passed the request
//! is dropped without an answer.
//!

use {
    super::Vm,
    crate::{
        data_model::{BlockHeight, NodeId, Staker, SubnetId, Timestamp, ValidatorEntry},
        error::{Error, Result},
    },
    serde::{Deserialize, Serialize},
    tracing::debug,
};

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppRequest {
    CurrentHeight,
    ValidatorSet {
        height: BlockHeight,
        subnet_id: SubnetId,
    },
    Validator {
        subnet_id: SubnetId,
        node_id: NodeId,
    },
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppResponse {
    CurrentHeight(BlockHeight),
    ValidatorSet {
        height: BlockHeight,
        validators: Vec<(NodeId, ValidatorEntry)>,
    },
    /// `None` when the node does not currently validate the subnet.
    Validator(Option<Staker>),
}

impl Vm {
    /// Answer `request` from `node`, or `None` once `deadline` has passed.
    pub fn app_request(
        &self,
        node: NodeId,
        deadline: Timestamp,
        request: &AppRequest,
    ) -> Result<Option<AppResponse>> {
        let now = self.clock.now();
        if now > deadline {
            debug!("dropping request from {}: deadline {} passed at {}", node, deadline, now);
            return Ok(None);
        }

        let chain = self.chain.read();
        let response = match request {
            AppRequest::CurrentHeight => AppResponse::CurrentHeight(chain.ledger.height()),
            AppRequest::ValidatorSet { height, subnet_id } => AppResponse::ValidatorSet {
                height: *height,
                validators: chain
                    .ledger
                    .validator_set_at(*height, subnet_id)?
                    .into_iter()
                    .collect(),
            },
            AppRequest::Validator { subnet_id, node_id } => {
                match chain.ledger.staking().current_validator(subnet_id, node_id) {
                    Ok(s) => AppResponse::Validator(Some(s)),
                    Err(Error::NotFound(_)) => AppResponse::Validator(None),
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(Some(response))
    }

    /// [`Vm::app_request`] over JSON-encoded messages.
    pub fn app_request_bytes(
        &self,
        node: NodeId,
        deadline: Timestamp,
        request: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let request: AppRequest = serde_json::from_slice(request)?;
        self.app_request(node, deadline, &request)?
            .map(|r| serde_json::to_vec(&r).map_err(Error::from))
            .transpose()
    }
}
