//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes, U64, U256, b256};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::{contract::TxReceipt, error::DeployError};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between polling attempts.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// ERC-1967 implementation slot, `keccak256("eip1967.proxy.implementation") - 1`.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, DeployError> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {e}")))
}

/// Make a JSON-RPC call and deserialize the result.
///
/// Transport failures map to [`DeployError::Network`]. An `error` object in the
/// response maps to [`DeployError::Rpc`] and is never retried.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, DeployError> {
    let response = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| DeployError::Network(format!("failed to send {method} request: {e}")))?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| DeployError::Network(format!("failed to parse {method} response: {e}")))?;

    if let Some(error) = result.get("error") {
        return Err(DeployError::Rpc {
            method: method.to_string(),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| DeployError::Encoding(format!("no result in {method} response")))?;

    serde_json::from_value(result_value)
        .map_err(|e| DeployError::Encoding(format!("failed to deserialize {method} result: {e}")))
}

/// Poll `check_fn` until it yields a value or `timeout` elapses.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    check_fn: F,
) -> Result<T, DeployError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>, DeployError>>,
{
    let start = tokio::time::Instant::now();

    loop {
        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                tracing::trace!(error = %e, what, "Poll failed, retrying...");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(DeployError::Timeout(what.to_string()));
        }

        tokio::time::sleep(interval).await;
    }
}

/// Transaction fields sent with `eth_sendTransaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: Address,
    /// `None` creates a contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
}

/// Receipt fields as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<U64>,
    pub contract_address: Option<Address>,
    pub status: Option<U64>,
}

impl From<RpcReceipt> for TxReceipt {
    fn from(receipt: RpcReceipt) -> Self {
        TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.to::<u64>()),
            contract_address: receipt.contract_address,
            success: receipt.status.is_none_or(|s| s == U64::from(1)),
        }
    }
}

/// Thin typed wrapper over the handful of RPC methods the orchestrator needs.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    url: Url,
    receipt_timeout: Duration,
}

impl RpcClient {
    pub fn new(url: Url) -> Result<Self, DeployError> {
        Ok(Self {
            client: create_client()?,
            url,
            receipt_timeout: Duration::from_secs(120),
        })
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, DeployError> {
        tracing::trace!(method, url = %self.url, "RPC call");
        json_rpc_call(&self.client, &self.url, method, params).await
    }

    pub async fn chain_id(&self) -> Result<u64, DeployError> {
        let id: U64 = self.call("eth_chainId", vec![]).await?;
        Ok(id.to::<u64>())
    }

    pub async fn accounts(&self) -> Result<Vec<Address>, DeployError> {
        self.call("eth_accounts", vec![]).await
    }

    pub async fn get_code(&self, address: Address) -> Result<Bytes, DeployError> {
        self.call("eth_getCode", vec![to_value(address)?, "latest".into()])
            .await
    }

    pub async fn get_storage_at(&self, address: Address, slot: B256) -> Result<B256, DeployError> {
        let word: U256 = self
            .call(
                "eth_getStorageAt",
                vec![to_value(address)?, to_value(slot)?, "latest".into()],
            )
            .await?;
        Ok(B256::from(word.to_be_bytes::<32>()))
    }

    /// Implementation address stored in the proxy's ERC-1967 slot.
    pub async fn implementation_of(&self, proxy: Address) -> Result<Address, DeployError> {
        let word = self.get_storage_at(proxy, IMPLEMENTATION_SLOT).await?;
        Ok(Address::from_word(word))
    }

    pub async fn eth_call(&self, to: Address, data: &Bytes) -> Result<Bytes, DeployError> {
        let request = serde_json::json!({ "to": to, "data": data });
        self.call("eth_call", vec![request, "latest".into()]).await
    }

    pub async fn send_transaction(&self, request: &TransactionRequest) -> Result<B256, DeployError> {
        self.call("eth_sendTransaction", vec![to_value(request)?])
            .await
    }

    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, DeployError> {
        self.call("eth_getTransactionReceipt", vec![to_value(hash)?])
            .await
    }

    /// Wait until `hash` is mined and return its receipt, reverted or not.
    ///
    /// Running out of time is a [`DeployError::ReceiptTimeout`], never a transient
    /// error: the transaction is out and must not be broadcast again.
    pub async fn wait_for_receipt(&self, hash: B256) -> Result<TxReceipt, DeployError> {
        let receipt = poll_until(
            "transaction receipt",
            self.receipt_timeout,
            DEFAULT_POLL_INTERVAL,
            || self.transaction_receipt(hash),
        )
        .await
        .map_err(|e| match e {
            DeployError::Timeout(_) => DeployError::ReceiptTimeout { tx_hash: hash },
            e => e,
        })?;

        tracing::debug!(tx_hash = %hash, block = ?receipt.block_number, "Transaction mined");
        Ok(receipt.into())
    }
}

fn to_value(value: impl Serialize) -> Result<Value, DeployError> {
    serde_json::to_value(value).map_err(|e| DeployError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::{address, keccak256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_implementation_slot_derivation() {
        let hash = U256::from_be_bytes(keccak256("eip1967.proxy.implementation").0);
        let slot = B256::from((hash - U256::from(1)).to_be_bytes::<32>());
        assert_eq!(slot, IMPLEMENTATION_SLOT);
    }

    #[test]
    fn test_receipt_conversion() {
        let raw: RpcReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x2a",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "status": "0x1"
        }))
        .unwrap();

        let receipt = TxReceipt::from(raw);
        assert_eq!(receipt.block_number, Some(42));
        assert_eq!(
            receipt.contract_address,
            Some(address!("0x5FbDB2315678afecb367f032d93F642f64180aa3"))
        );
        assert!(receipt.success);
    }

    #[test]
    fn test_reverted_receipt() {
        let raw: RpcReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x3",
            "contractAddress": null,
            "status": "0x0"
        }))
        .unwrap();

        assert!(!TxReceipt::from(raw).success);
    }

    #[test]
    fn test_creation_request_omits_to() {
        let request = TransactionRequest {
            from: Address::ZERO,
            to: None,
            data: Bytes::from_static(&[0x60, 0x80]),
            value: U256::ZERO,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("to").is_none());
        assert_eq!(json["data"], "0x6080");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_value() {
        let calls = AtomicUsize::new(0);

        let value = poll_until("value", Duration::from_secs(10), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result: Result<(), _> =
            poll_until("never", Duration::from_secs(3), Duration::from_secs(1), || async {
                Ok(None)
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, DeployError::Timeout(ref what) if what == "never"));
        assert!(!err.is_transient());
    }
}
