//! Direct vs. multisig routing of activation calls.

use alloy_core::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{
    contract::{ContractCall, TxReceipt},
    error::DeployError,
    retry::{self, RetryPolicy},
    safe::{MultisigApi, SafeProposalBuilder},
    signer::ChainSigner,
};

/// What happened to a routed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RouteOutcome {
    /// Sent and mined.
    Mined(TxReceipt),
    /// Queued on the wallet, pending owner approval.
    Proposed {
        safe_address: Address,
        safe_tx_hash: B256,
    },
}

impl RouteOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, RouteOutcome::Proposed { .. })
    }
}

#[derive(Debug)]
enum Route<M> {
    Direct(RetryPolicy),
    Multisig(SafeProposalBuilder<M>),
}

/// Sends every call of a session the same way, decided once at construction.
#[derive(Debug)]
pub struct TransactionRouter<M> {
    route: Route<M>,
}

impl<M: MultisigApi> TransactionRouter<M> {
    /// Sign and broadcast, retrying transient network failures only.
    ///
    /// A broadcast transaction whose receipt never shows up is not retried.
    pub fn direct(retry: RetryPolicy) -> Self {
        Self {
            route: Route::Direct(retry),
        }
    }

    /// Propose every call to the wallet behind `builder`.
    pub fn multisig(builder: SafeProposalBuilder<M>) -> Self {
        Self {
            route: Route::Multisig(builder),
        }
    }

    pub fn is_multisig(&self) -> bool {
        matches!(self.route, Route::Multisig(_))
    }

    pub async fn send<G: ChainSigner>(
        &self,
        call: &ContractCall,
        signer: &G,
    ) -> Result<RouteOutcome, DeployError> {
        match &self.route {
            Route::Multisig(builder) => {
                let safe_tx_hash = builder.propose_transaction(call, signer).await?;
                Ok(RouteOutcome::Proposed {
                    safe_address: builder.safe_address(),
                    safe_tx_hash,
                })
            }
            Route::Direct(retry) => {
                let receipt = retry::run(retry, || signer.send_transaction(call)).await?;
                tracing::info!(
                    target_address = %call.target,
                    function = %call.abi_fragment,
                    tx_hash = %receipt.tx_hash,
                    "Transaction mined"
                );
                Ok(RouteOutcome::Mined(receipt))
            }
        }
    }
}
