//! Transaction senders and hash signers.

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes, Signature};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;

use crate::{
    contract::{ContractCall, TxReceipt},
    error::DeployError,
    rpc::{RpcClient, TransactionRequest},
};

/// An account able to send transactions and sign multisig hashes.
pub trait ChainSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Broadcast `call` and wait for it to be mined. A reverted receipt is an error.
    fn send_transaction(
        &self,
        call: &ContractCall,
    ) -> impl Future<Output = Result<TxReceipt, DeployError>> + Send;

    /// Create a contract from `init_code` and wait for the receipt.
    fn deploy_code(
        &self,
        init_code: Bytes,
    ) -> impl Future<Output = Result<TxReceipt, DeployError>> + Send;

    /// Sign a 32-byte hash. `None` when the signer cannot or will not sign.
    fn sign_hash(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Signature>, DeployError>> + Send;
}

/// Sends through a node-managed (unlocked) account.
///
/// Hash signing needs a local key; without one `sign_hash` yields `None`.
#[derive(Debug, Clone)]
pub struct RpcSigner {
    rpc: RpcClient,
    from: Address,
    key: Option<PrivateKeySigner>,
}

impl RpcSigner {
    pub fn new(rpc: RpcClient, from: Address) -> Self {
        Self {
            rpc,
            from,
            key: None,
        }
    }

    /// Send from the address of `key` and sign hashes with it.
    pub fn from_key(rpc: RpcClient, key: PrivateKeySigner) -> Self {
        Self::new(rpc, key.address()).with_key(key)
    }

    /// Use `key` for hash signing and send from its address.
    pub fn with_key(mut self, key: PrivateKeySigner) -> Self {
        self.from = key.address();
        self.key = Some(key);
        self
    }

    /// First account the node reports as unlocked.
    pub async fn first_account(rpc: RpcClient) -> Result<Self, DeployError> {
        let from = rpc
            .accounts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::Config("node exposes no unlocked account".to_string()))?;

        Ok(Self::new(rpc, from))
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn submit(&self, request: TransactionRequest) -> Result<TxReceipt, DeployError> {
        let tx_hash = self.rpc.send_transaction(&request).await?;
        tracing::debug!(%tx_hash, from = %self.from, to = ?request.to, "Transaction sent");

        let receipt = self.rpc.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(DeployError::Reverted {
                tx_hash,
                reason: "receipt status 0".to_string(),
            });
        }

        Ok(receipt)
    }
}

impl ChainSigner for RpcSigner {
    fn address(&self) -> Address {
        self.from
    }

    async fn send_transaction(&self, call: &ContractCall) -> Result<TxReceipt, DeployError> {
        self.submit(TransactionRequest {
            from: self.from,
            to: Some(call.target),
            data: call.payload.clone(),
            value: call.value,
        })
        .await
    }

    async fn deploy_code(&self, init_code: Bytes) -> Result<TxReceipt, DeployError> {
        self.submit(TransactionRequest {
            from: self.from,
            to: None,
            data: init_code,
            value: Default::default(),
        })
        .await
    }

    async fn sign_hash(&self, hash: B256) -> Result<Option<Signature>, DeployError> {
        let Some(key) = &self.key else {
            tracing::warn!(signer = %self.from, "No local key configured, cannot sign hash");
            return Ok(None);
        };

        key.sign_hash_sync(&hash)
            .map(Some)
            .map_err(|e| DeployError::Encoding(format!("failed to sign hash: {e}")))
    }
}
