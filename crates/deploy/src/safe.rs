//! Multisig (Safe) proposals.
//!
//! A proposal binds a call to the wallet's next unused nonce, hashes it with the
//! Safe EIP-712 scheme, signs the hash and hands everything to the transaction
//! service. Execution happens later, once the owners approve.

use std::{future::Future, time::Duration};

use alloy_core::{
    primitives::{Address, B256, Bytes, Signature, U256, b256, keccak256},
    sol_types::{SolValue, eip712_domain},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{
    contract::ContractCall,
    error::DeployError,
    retry::{self, RetryPolicy},
    signer::ChainSigner,
};

/// `keccak256("SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)")`
pub const SAFE_TX_TYPEHASH: B256 =
    b256!("0xbb8310d486368db6bd6f849402fdd73ad53d316b5a4b2644ad6efe0f941286d8");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[default]
    Call,
    DelegateCall,
}

impl Operation {
    pub fn as_u8(self) -> u8 {
        match self {
            Operation::Call => 0,
            Operation::DelegateCall => 1,
        }
    }
}

/// The transaction a Safe executes once enough owners have signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: Operation,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub nonce: u64,
}

impl SafeTransaction {
    /// A plain call without gas refund.
    pub fn from_call(call: &ContractCall, nonce: u64) -> Self {
        Self {
            to: call.target,
            value: call.value,
            data: call.payload.clone(),
            operation: Operation::Call,
            safe_tx_gas: U256::ZERO,
            base_gas: U256::ZERO,
            gas_price: U256::ZERO,
            gas_token: Address::ZERO,
            refund_receiver: Address::ZERO,
            nonce,
        }
    }

    pub fn struct_hash(&self) -> B256 {
        keccak256(
            (
                SAFE_TX_TYPEHASH,
                self.to,
                self.value,
                keccak256(&self.data),
                U256::from(self.operation.as_u8()),
                self.safe_tx_gas,
                self.base_gas,
                self.gas_price,
                self.gas_token,
                self.refund_receiver,
                U256::from(self.nonce),
            )
                .abi_encode(),
        )
    }

    /// The hash owners sign, bound to one wallet on one chain.
    pub fn signing_hash(&self, chain_id: u64, safe: Address) -> B256 {
        let domain = eip712_domain! {
            chain_id: chain_id,
            verifying_contract: safe,
        };

        let mut digest = Vec::with_capacity(66);
        digest.extend_from_slice(&[0x19, 0x01]);
        digest.extend_from_slice(domain.separator().as_slice());
        digest.extend_from_slice(self.struct_hash().as_slice());
        keccak256(digest)
    }
}

/// Everything the transaction service needs to queue a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeProposal {
    pub safe_address: Address,
    pub transaction: SafeTransaction,
    pub safe_tx_hash: B256,
    pub sender: Address,
    pub signature: Signature,
}

/// Multisig wallet backend.
pub trait MultisigApi: Send + Sync {
    /// Next nonce not used by an executed or queued transaction.
    fn get_next_nonce(&self, safe: Address) -> impl Future<Output = Result<u64, DeployError>> + Send;

    fn propose_transaction(
        &self,
        proposal: &SafeProposal,
    ) -> impl Future<Output = Result<(), DeployError>> + Send;

    /// Hash of a queued, not yet executed transaction calling `to` with `data`.
    fn find_pending(
        &self,
        safe: Address,
        to: Address,
        data: &Bytes,
    ) -> impl Future<Output = Result<Option<B256>, DeployError>> + Send;
}

/// Builds, signs and submits proposals for one wallet.
#[derive(Debug)]
pub struct SafeProposalBuilder<M> {
    api: M,
    safe_address: Address,
    chain_id: u64,
    retry: RetryPolicy,
}

impl<M: MultisigApi> SafeProposalBuilder<M> {
    pub fn new(api: M, safe_address: Address, chain_id: u64) -> Self {
        Self {
            api,
            safe_address,
            chain_id,
            retry: RetryPolicy::transient(3, Duration::from_secs(2)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn safe_address(&self) -> Address {
        self.safe_address
    }

    pub fn api(&self) -> &M {
        &self.api
    }

    /// Queue `call` on the wallet and return the Safe transaction hash.
    ///
    /// A call already waiting in the queue is not proposed again; its hash is returned.
    /// Otherwise the nonce is fetched for every proposal so that proposals queued back
    /// to back never share one.
    pub async fn propose_transaction<G: ChainSigner>(
        &self,
        call: &ContractCall,
        signer: &G,
    ) -> Result<B256, DeployError> {
        let queued = retry::run(&self.retry, || {
            self.api
                .find_pending(self.safe_address, call.target, &call.payload)
        })
        .await?;
        if let Some(safe_tx_hash) = queued {
            tracing::info!(
                safe = %self.safe_address,
                %safe_tx_hash,
                target = %call.target,
                function = %call.abi_fragment,
                "Identical transaction already queued, not proposing again"
            );
            return Ok(safe_tx_hash);
        }

        let nonce = retry::run(&self.retry, || self.api.get_next_nonce(self.safe_address)).await?;

        let transaction = SafeTransaction::from_call(call, nonce);
        let safe_tx_hash = transaction.signing_hash(self.chain_id, self.safe_address);

        let sender = signer.address();
        let signature =
            signer
                .sign_hash(safe_tx_hash)
                .await?
                .ok_or(DeployError::SignatureMissing {
                    signer: sender,
                    hash: safe_tx_hash,
                })?;

        let proposal = SafeProposal {
            safe_address: self.safe_address,
            transaction,
            safe_tx_hash,
            sender,
            signature,
        };

        retry::run(&self.retry, || self.api.propose_transaction(&proposal)).await?;

        tracing::info!(
            safe = %self.safe_address,
            %safe_tx_hash,
            nonce,
            target = %call.target,
            function = %call.abi_fragment,
            "Multisig transaction proposed"
        );
        Ok(safe_tx_hash)
    }
}

/// Client for the Safe transaction service HTTP API.
#[derive(Debug, Clone)]
pub struct SafeServiceClient {
    client: reqwest::Client,
    base_url: Url,
}

impl SafeServiceClient {
    pub fn new(base_url: Url) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeployError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path)
            .map_err(|e| DeployError::Config(format!("invalid safe service url: {e}")))
    }

    async fn get_json(&self, url: Url) -> Result<Value, DeployError> {
        tracing::debug!(%url, "Querying safe service");
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeployError::from_http(e, DeployError::Multisig))?
            .json()
            .await
            .map_err(|e| DeployError::Multisig(format!("invalid response: {e}")))
    }
}

/// Nonces come back as numbers or decimal strings depending on the service version.
fn parse_nonce(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// First queued transaction in a `multisig-transactions` page carrying `data`.
fn matching_pending(page: &Value, data: &Bytes) -> Option<B256> {
    page.get("results")?.as_array()?.iter().find_map(|tx| {
        let tx_data = match tx.get("data").and_then(|d| d.as_str()) {
            Some(hex) => hex.parse::<Bytes>().ok()?,
            None => Bytes::new(),
        };
        if tx_data != *data {
            return None;
        }
        tx.get("safeTxHash")?.as_str()?.parse().ok()
    })
}

impl SafeServiceClient {
    async fn safe_nonce(&self, safe: Address) -> Result<u64, DeployError> {
        let info = self
            .get_json(self.endpoint(&format!("api/v1/safes/{safe}/"))?)
            .await?;
        info.get("nonce")
            .and_then(parse_nonce)
            .ok_or_else(|| DeployError::Multisig("safe info has no nonce".to_string()))
    }

    /// Queued transactions that can still execute, i.e. at or above the safe nonce.
    fn queued_url(&self, safe: Address, safe_nonce: u64) -> Result<Url, DeployError> {
        let mut url = self.endpoint(&format!("api/v1/safes/{safe}/multisig-transactions/"))?;
        url.query_pairs_mut()
            .append_pair("executed", "false")
            .append_pair("nonce__gte", &safe_nonce.to_string())
            .append_pair("ordering", "-nonce");
        Ok(url)
    }
}

impl MultisigApi for SafeServiceClient {
    async fn get_next_nonce(&self, safe: Address) -> Result<u64, DeployError> {
        let safe_nonce = self.safe_nonce(safe).await?;

        let mut queued_url = self.queued_url(safe, safe_nonce)?;
        queued_url.query_pairs_mut().append_pair("limit", "1");

        let queued = self.get_json(queued_url).await?;
        let highest_queued = queued
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(|tx| tx.get("nonce"))
            .and_then(parse_nonce);

        Ok(next_nonce(safe_nonce, highest_queued))
    }

    async fn propose_transaction(&self, proposal: &SafeProposal) -> Result<(), DeployError> {
        let tx = &proposal.transaction;
        let url = self.endpoint(&format!(
            "api/v1/safes/{}/multisig-transactions/",
            proposal.safe_address
        ))?;

        let body = serde_json::json!({
            "to": tx.to.to_checksum(None),
            "value": tx.value.to_string(),
            "data": tx.data,
            "operation": tx.operation.as_u8(),
            "safeTxGas": tx.safe_tx_gas.to_string(),
            "baseGas": tx.base_gas.to_string(),
            "gasPrice": tx.gas_price.to_string(),
            "gasToken": tx.gas_token.to_checksum(None),
            "refundReceiver": tx.refund_receiver.to_checksum(None),
            "nonce": tx.nonce,
            "contractTransactionHash": proposal.safe_tx_hash,
            "sender": proposal.sender.to_checksum(None),
            "signature": format!("0x{}", hex::encode(proposal.signature.as_bytes())),
            "origin": "proxup",
        });

        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeployError::from_http(e, DeployError::Multisig))?;

        Ok(())
    }

    async fn find_pending(
        &self,
        safe: Address,
        to: Address,
        data: &Bytes,
    ) -> Result<Option<B256>, DeployError> {
        let safe_nonce = self.safe_nonce(safe).await?;
        let mut url = self.queued_url(safe, safe_nonce)?;
        url.query_pairs_mut().append_pair("to", &to.to_checksum(None));

        let page = self.get_json(url).await?;
        Ok(matching_pending(&page, data))
    }
}

fn next_nonce(safe_nonce: u64, highest_queued: Option<u64>) -> u64 {
    match highest_queued {
        Some(queued) if queued >= safe_nonce => queued + 1,
        _ => safe_nonce,
    }
}
