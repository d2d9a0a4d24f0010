//! Contract calls as plain values.
//!
//! A [`ContractCall`] carries the target, the fully encoded calldata and the function
//! signature it was built from. Signers and routers only ever see this value.

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, U256, keccak256},
    sol_types::SolValue,
};
use serde::{Deserialize, Serialize};

use crate::error::DeployError;

/// Signature of the UUPS activation entry point.
pub const UPGRADE_TO_AND_CALL: &str = "upgradeToAndCall(address,bytes)";

/// First four bytes of the keccak hash of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calldata for `signature` with dynamically typed arguments.
pub fn encode_calldata(signature: &str, args: &[DynSolValue]) -> Bytes {
    let encoded = DynSolValue::Tuple(args.to_vec()).abi_encode_params();
    let mut calldata = Vec::with_capacity(4 + encoded.len());
    calldata.extend_from_slice(&selector(signature));
    calldata.extend_from_slice(&encoded);
    calldata.into()
}

/// Canonical signature of `name` taking `args`, e.g. `initialize(uint256,address)`.
pub fn signature_for(name: &str, args: &[DynSolValue]) -> Result<String, DeployError> {
    let types = args
        .iter()
        .map(|arg| {
            arg.sol_type_name()
                .map(|t| t.to_string())
                .ok_or_else(|| DeployError::Encoding(format!("argument {arg:?} has no ABI type")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!("{name}({})", types.join(",")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub target: Address,
    /// Selector followed by the ABI-encoded arguments.
    pub payload: Bytes,
    /// Canonical signature, e.g. `upgradeToAndCall(address,bytes)`.
    pub abi_fragment: String,
    #[serde(default)]
    pub value: U256,
}

impl ContractCall {
    /// Build a call from a signature and already encoded arguments.
    pub fn from_encoded_args(target: Address, signature: &str, encoded_args: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(4 + encoded_args.len());
        payload.extend_from_slice(&selector(signature));
        payload.extend_from_slice(encoded_args);

        Self {
            target,
            payload: payload.into(),
            abi_fragment: signature.to_string(),
            value: U256::ZERO,
        }
    }

    /// Build a call from dynamically typed arguments.
    pub fn dynamic(target: Address, signature: &str, args: &[DynSolValue]) -> Self {
        Self {
            target,
            payload: encode_calldata(signature, args),
            abi_fragment: signature.to_string(),
            value: U256::ZERO,
        }
    }

    /// `upgradeToAndCall(implementation, data)` on `proxy`.
    pub fn upgrade_to_and_call(proxy: Address, implementation: Address, data: Bytes) -> Self {
        Self::from_encoded_args(
            proxy,
            UPGRADE_TO_AND_CALL,
            &(implementation, data).abi_encode_params(),
        )
    }

    pub fn selector(&self) -> Option<[u8; 4]> {
        self.payload.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
    }

    /// Encoded arguments without the selector.
    pub fn args(&self) -> &[u8] {
        self.payload.get(4..).unwrap_or_default()
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// A mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    /// Set for contract creations.
    pub contract_address: Option<Address>,
    pub success: bool,
}
