//! Error taxonomy for the deployment orchestrator.
//!
//! Only [`DeployError::Network`] is transient. Everything else propagates to the
//! caller of `deploy()` unchanged, which is expected to halt the session.

use alloy_core::primitives::{Address, B256};

use crate::state::DeployStatus;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("illegal state transition: cannot switch to {attempted} from {current}")]
    IllegalStateTransition {
        attempted: DeployStatus,
        current: DeployStatus,
    },

    #[error("storage layout incompatible for proxy {proxy}: {reason}")]
    StorageLayoutIncompatible { proxy: Address, reason: String },

    #[error("network error: {0}")]
    Network(String),

    /// The node answered with a JSON-RPC error object.
    #[error("{method} rejected by node: {message}")]
    Rpc { method: String, message: String },

    /// A polled condition did not hold within its deadline.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// The transaction was broadcast but no receipt appeared in time. It may still be
    /// mined, so it is never sent again.
    #[error("transaction {tx_hash} sent but not mined in time")]
    ReceiptTimeout { tx_hash: B256 },

    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: B256, reason: String },

    #[error("verification of {address} failed: {reason}")]
    Verification {
        address: Address,
        reason: String,
        /// Output captured from the explorer tooling during the failed attempt.
        output: String,
    },

    #[error("signer {signer} returned no signature for safe transaction {hash}")]
    SignatureMissing { signer: Address, hash: B256 },

    #[error("registry inconsistency: {0}")]
    RegistryInconsistency(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("multisig service error: {0}")]
    Multisig(String),

    #[error("explorer error: {0}")]
    Explorer(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl DeployError {
    /// Whether this error is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeployError::Network(_))
    }

    /// Map a transport failure from `reqwest`.
    ///
    /// Connection problems, timeouts, rate limiting and server errors are transient;
    /// anything else is attributed to the service through `fallback`.
    pub fn from_http(err: reqwest::Error, fallback: fn(String) -> DeployError) -> Self {
        let transient = err.is_connect()
            || err.is_timeout()
            || err.is_request()
            || err
                .status()
                .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);

        if transient {
            DeployError::Network(err.to_string())
        } else {
            fallback(err.to_string())
        }
    }
}
