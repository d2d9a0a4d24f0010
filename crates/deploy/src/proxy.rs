//! Proxy primitives: artifacts, proxy creation, upgrade preparation and validation.
//!
//! [`ProxyBackend`] and [`StorageLayoutValidator`] are the seams the orchestrator
//! drives. [`RpcProxyBackend`] implements both on top of a JSON-RPC node and
//! Foundry build artifacts.

use std::{
    collections::BTreeMap,
    fs,
    future::Future,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, keccak256},
    sol_types::SolValue,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    contract::{ContractCall, selector},
    error::DeployError,
    history::BytecodeHistoryStore,
    rpc::{IMPLEMENTATION_SLOT, RpcClient},
    signer::ChainSigner,
};

/// Name of the artifact deployed as the proxy itself.
pub const DEFAULT_PROXY_ARTIFACT: &str = "ERC1967Proxy";

/// Compiled creation code of a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArtifact {
    pub name: String,
    pub bytecode: Bytes,
}

#[derive(Deserialize)]
struct FoundryArtifact {
    bytecode: FoundryBytecode,
}

#[derive(Deserialize)]
struct FoundryBytecode {
    object: Bytes,
}

#[derive(Deserialize)]
struct FoundryMetadataArtifact {
    metadata: Option<FoundryMetadata>,
}

#[derive(Deserialize)]
struct FoundryMetadata {
    compiler: FoundryCompiler,
    settings: FoundrySettings,
}

#[derive(Deserialize)]
struct FoundryCompiler {
    version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FoundrySettings {
    compilation_target: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct FoundryBuildInfo {
    input: Value,
}

fn artifact_path(out_dir: &Path, name: &str) -> PathBuf {
    out_dir.join(format!("{name}.sol")).join(format!("{name}.json"))
}

fn read_artifact_file(path: &Path) -> Result<String, DeployError> {
    fs::read_to_string(path).map_err(|e| {
        DeployError::Config(format!("failed to read artifact {}: {e}", path.display()))
    })
}

/// What an explorer needs to rebuild a contract from source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBundle {
    /// Fully qualified name, e.g. `src/Stub_Contract.sol:Stub_Contract`.
    pub contract_path: String,
    /// Full solc version, e.g. `0.8.20+commit.a1b79de6`.
    pub compiler_version: String,
    /// solc standard JSON input the contract was compiled from.
    pub standard_json: Value,
}

impl SourceBundle {
    /// Resolve the source of `name` from its artifact metadata and the build info
    /// that compiled it. Needs a build with `--build-info`.
    pub fn load_foundry(out_dir: &Path, name: &str) -> Result<Self, DeployError> {
        let path = artifact_path(out_dir, name);
        let artifact: FoundryMetadataArtifact = serde_json::from_str(&read_artifact_file(&path)?)
            .map_err(|e| {
                DeployError::Encoding(format!("invalid artifact {}: {e}", path.display()))
            })?;

        let metadata = artifact.metadata.ok_or_else(|| {
            DeployError::Config(format!("artifact {name} carries no compiler metadata"))
        })?;
        let source_path = metadata
            .settings
            .compilation_target
            .into_iter()
            .find_map(|(source, contract)| (contract == name).then_some(source))
            .ok_or_else(|| {
                DeployError::Config(format!("artifact {name} has no compilation target"))
            })?;

        let standard_json = find_build_input(&out_dir.join("build-info"), &source_path)?;

        Ok(Self {
            contract_path: format!("{source_path}:{name}"),
            compiler_version: metadata.compiler.version,
            standard_json,
        })
    }
}

/// Standard JSON input of the first build info compiling `source_path`.
fn find_build_input(build_info_dir: &Path, source_path: &str) -> Result<Value, DeployError> {
    let entries = fs::read_dir(build_info_dir).map_err(|e| {
        DeployError::Config(format!(
            "no build info in {} (build with --build-info): {e}",
            build_info_dir.display()
        ))
    })?;

    for entry in entries {
        let path = entry
            .map_err(|e| DeployError::Storage(format!("failed to list build info: {e}")))?
            .path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let build_info: FoundryBuildInfo = serde_json::from_str(&read_artifact_file(&path)?)
            .map_err(|e| {
                DeployError::Encoding(format!("invalid build info {}: {e}", path.display()))
            })?;
        if build_info.input["sources"].get(source_path).is_some() {
            tracing::trace!(build_info = %path.display(), source_path, "Found build input");
            return Ok(build_info.input);
        }
    }

    Err(DeployError::Config(format!(
        "no build info in {} compiles {source_path}",
        build_info_dir.display()
    )))
}

impl ContractArtifact {
    pub fn new(name: impl Into<String>, bytecode: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytecode: bytecode.into(),
        }
    }

    /// Identity of a deployed instance: the hash of its full init code.
    ///
    /// Constructor arguments are part of it, so the same creation code built with
    /// different arguments never counts as the same implementation.
    pub fn code_hash(&self, constructor_args: &[u8]) -> B256 {
        keccak256(self.init_code(constructor_args))
    }

    /// Load `{out_dir}/{name}.sol/{name}.json`.
    pub fn load_foundry(out_dir: &Path, name: &str) -> Result<Self, DeployError> {
        let path = artifact_path(out_dir, name);
        let artifact: FoundryArtifact = serde_json::from_str(&read_artifact_file(&path)?).map_err(|e| {
            DeployError::Encoding(format!("invalid artifact {}: {e}", path.display()))
        })?;

        if artifact.bytecode.object.is_empty() {
            return Err(DeployError::Config(format!(
                "artifact {name} has no creation code (abstract contract or interface?)"
            )));
        }

        Ok(Self::new(name, artifact.bytecode.object))
    }

    /// Creation code followed by ABI-encoded constructor arguments.
    pub fn init_code(&self, constructor_args: &[u8]) -> Bytes {
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(constructor_args);
        code.into()
    }
}

/// Per-call knobs for creation and upgrade.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Initializer signature. Derived from the init arguments when unset.
    pub initializer: Option<String>,
    /// ABI-encoded constructor arguments of the implementation.
    pub constructor_args: Bytes,
    /// Calldata forwarded by `upgradeToAndCall`.
    pub upgrade_data: Bytes,
    pub validate_storage_layout: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            initializer: None,
            constructor_args: Bytes::new(),
            upgrade_data: Bytes::new(),
            validate_storage_layout: true,
        }
    }
}

/// Proxy primitives used by the orchestrator.
pub trait ProxyBackend: Send + Sync {
    /// Resolve the artifact for `name`.
    fn artifact(&self, name: &str) -> Result<ContractArtifact, DeployError>;

    /// Deploy (or reuse) the implementation, then a proxy initialised with `init_data`.
    fn create_proxy(
        &self,
        artifact: &ContractArtifact,
        init_data: &Bytes,
        options: &DeployOptions,
    ) -> impl Future<Output = Result<Address, DeployError>> + Send;

    /// Make an implementation of `artifact` available without activating it.
    ///
    /// Returns the current implementation when it already runs this code.
    fn prepare_upgrade(
        &self,
        proxy: Address,
        artifact: &ContractArtifact,
        options: &DeployOptions,
    ) -> impl Future<Output = Result<Address, DeployError>> + Send;

    fn current_implementation(
        &self,
        proxy: Address,
    ) -> impl Future<Output = Result<Address, DeployError>> + Send;

    fn contract_exists(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<bool, DeployError>> + Send;

    /// The call that points `proxy` at `implementation`.
    fn activation_call(
        &self,
        proxy: Address,
        implementation: Address,
        options: &DeployOptions,
    ) -> ContractCall {
        ContractCall::upgrade_to_and_call(proxy, implementation, options.upgrade_data.clone())
    }
}

/// Checks an upgrade before any activation transaction is sent.
pub trait StorageLayoutValidator: Send + Sync {
    /// Fails with [`DeployError::StorageLayoutIncompatible`] when unsafe.
    fn validate_upgrade(
        &self,
        proxy: Address,
        candidate: Address,
        artifact: &ContractArtifact,
    ) -> impl Future<Output = Result<(), DeployError>> + Send;
}

/// Proxy backend over JSON-RPC with Foundry artifacts.
///
/// Implementations are shared by code hash: an implementation already recorded for
/// an artifact's code is reused instead of being deployed again.
#[derive(Debug)]
pub struct RpcProxyBackend<G, H> {
    rpc: RpcClient,
    signer: G,
    history: H,
    artifacts_dir: PathBuf,
    proxy_artifact: String,
}

impl<G: ChainSigner, H: BytecodeHistoryStore> RpcProxyBackend<G, H> {
    pub fn new(rpc: RpcClient, signer: G, history: H, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            rpc,
            signer,
            history,
            artifacts_dir: artifacts_dir.into(),
            proxy_artifact: DEFAULT_PROXY_ARTIFACT.to_string(),
        }
    }

    pub fn with_proxy_artifact(mut self, name: impl Into<String>) -> Self {
        self.proxy_artifact = name.into();
        self
    }

    async fn deploy(
        &self,
        artifact: &ContractArtifact,
        constructor_args: &[u8],
    ) -> Result<Address, DeployError> {
        let receipt = self
            .signer
            .deploy_code(artifact.init_code(constructor_args))
            .await?;

        let address = receipt.contract_address.ok_or_else(|| DeployError::Reverted {
            tx_hash: receipt.tx_hash,
            reason: "creation receipt has no contract address".to_string(),
        })?;

        tracing::info!(contract = %artifact.name, %address, tx_hash = %receipt.tx_hash, "Contract deployed");
        Ok(address)
    }

    /// A live implementation with `code_hash`, preferring `current` when it qualifies.
    async fn existing_implementation(
        &self,
        code_hash: B256,
        current: Option<Address>,
    ) -> Result<Option<Address>, DeployError> {
        let Some(group) = self.history.find_by_code_hash(code_hash).await? else {
            return Ok(None);
        };

        let candidates = current
            .filter(|c| group.contains(*c))
            .into_iter()
            .chain(group.addresses());

        for address in candidates {
            if self.contract_exists(address).await? {
                return Ok(Some(address));
            }
            tracing::debug!(%address, "Recorded implementation has no code, skipping");
        }

        Ok(None)
    }

    async fn implementation_for(
        &self,
        artifact: &ContractArtifact,
        current: Option<Address>,
        options: &DeployOptions,
    ) -> Result<Address, DeployError> {
        let code_hash = artifact.code_hash(&options.constructor_args);
        if let Some(address) = self.existing_implementation(code_hash, current).await? {
            tracing::debug!(contract = %artifact.name, %address, "Reusing implementation");
            return Ok(address);
        }

        let address = self.deploy(artifact, &options.constructor_args).await?;
        self.history.record_alias(code_hash, address).await?;
        Ok(address)
    }
}

impl<G: ChainSigner, H: BytecodeHistoryStore> ProxyBackend for RpcProxyBackend<G, H> {
    fn artifact(&self, name: &str) -> Result<ContractArtifact, DeployError> {
        ContractArtifact::load_foundry(&self.artifacts_dir, name)
    }

    async fn create_proxy(
        &self,
        artifact: &ContractArtifact,
        init_data: &Bytes,
        options: &DeployOptions,
    ) -> Result<Address, DeployError> {
        let implementation = self.implementation_for(artifact, None, options).await?;

        let proxy_artifact = self.artifact(&self.proxy_artifact)?;
        let constructor_args = (implementation, init_data.clone()).abi_encode_params();

        self.deploy(&proxy_artifact, &constructor_args).await
    }

    async fn prepare_upgrade(
        &self,
        proxy: Address,
        artifact: &ContractArtifact,
        options: &DeployOptions,
    ) -> Result<Address, DeployError> {
        let current = self.current_implementation(proxy).await?;
        self.implementation_for(artifact, Some(current), options).await
    }

    async fn current_implementation(&self, proxy: Address) -> Result<Address, DeployError> {
        self.rpc.implementation_of(proxy).await
    }

    async fn contract_exists(&self, address: Address) -> Result<bool, DeployError> {
        Ok(!self.rpc.get_code(address).await?.is_empty())
    }
}

impl<G: ChainSigner, H: BytecodeHistoryStore> StorageLayoutValidator for RpcProxyBackend<G, H> {
    /// The candidate must be UUPS-upgradeable: `proxiableUUID()` has to return the
    /// ERC-1967 implementation slot, otherwise the proxy would lose its upgrade path.
    async fn validate_upgrade(
        &self,
        proxy: Address,
        candidate: Address,
        artifact: &ContractArtifact,
    ) -> Result<(), DeployError> {
        let incompatible = |reason: String| DeployError::StorageLayoutIncompatible { proxy, reason };

        let calldata = Bytes::from(selector("proxiableUUID()").to_vec());
        let returned = match self.rpc.eth_call(candidate, &calldata).await {
            Ok(returned) => returned,
            Err(DeployError::Rpc { message, .. }) => {
                return Err(incompatible(format!(
                    "{} at {candidate} does not implement proxiableUUID(): {message}",
                    artifact.name
                )));
            }
            Err(e) => return Err(e),
        };

        let uuid = B256::abi_decode(&returned)
            .map_err(|e| incompatible(format!("malformed proxiableUUID() result: {e}")))?;

        if uuid != IMPLEMENTATION_SLOT {
            return Err(incompatible(format!(
                "{} reports proxiable UUID {uuid}, expected the ERC-1967 implementation slot",
                artifact.name
            )));
        }

        tracing::debug!(%proxy, %candidate, "Upgrade target is UUPS compatible");
        Ok(())
    }
}

/// Initializer calldata for a new proxy. Empty when there is nothing to initialise.
pub fn initializer_calldata(
    init_args: &[DynSolValue],
    options: &DeployOptions,
) -> Result<Bytes, DeployError> {
    let signature = match &options.initializer {
        Some(signature) => signature.clone(),
        None if init_args.is_empty() => return Ok(Bytes::new()),
        None => crate::contract::signature_for("initialize", init_args)?,
    };

    Ok(crate::contract::encode_calldata(&signature, init_args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::{U256, address};
    use tempdir::TempDir;

    #[test]
    fn test_load_foundry_artifact() {
        let temp_dir = TempDir::new("proxup-artifacts").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("Stub_Contract.sol");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("Stub_Contract.json"),
            r#"{"abi":[],"bytecode":{"object":"0x6080604052","sourceMap":""}}"#,
        )
        .unwrap();

        let artifact = ContractArtifact::load_foundry(temp_dir.path(), "Stub_Contract").unwrap();
        assert_eq!(artifact.name, "Stub_Contract");
        assert_eq!(artifact.bytecode, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]));
        assert_eq!(artifact.code_hash(&[]), keccak256([0x60u8, 0x80, 0x60, 0x40, 0x52]));
    }

    #[test]
    fn test_source_bundle_from_build_info() {
        let temp_dir = TempDir::new("proxup-artifacts").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("Stub_Contract.sol");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("Stub_Contract.json"),
            serde_json::json!({
                "bytecode": { "object": "0x6080" },
                "metadata": {
                    "compiler": { "version": "0.8.20+commit.a1b79de6" },
                    "settings": { "compilationTarget": { "src/Stub_Contract.sol": "Stub_Contract" } }
                }
            })
            .to_string(),
        )
        .unwrap();

        let build_info = temp_dir.path().join("build-info");
        std::fs::create_dir_all(&build_info).unwrap();
        std::fs::write(
            build_info.join("a.json"),
            r#"{"input":{"language":"Solidity","sources":{"src/Other.sol":{}}}}"#,
        )
        .unwrap();
        std::fs::write(
            build_info.join("b.json"),
            r#"{"input":{"language":"Solidity","sources":{"src/Stub_Contract.sol":{"content":"contract Stub_Contract {}"}}}}"#,
        )
        .unwrap();

        let bundle = SourceBundle::load_foundry(temp_dir.path(), "Stub_Contract").unwrap();
        assert_eq!(bundle.contract_path, "src/Stub_Contract.sol:Stub_Contract");
        assert_eq!(bundle.compiler_version, "0.8.20+commit.a1b79de6");
        assert!(bundle.standard_json["sources"]["src/Stub_Contract.sol"].is_object());

        std::fs::remove_file(build_info.join("b.json")).unwrap();
        assert!(matches!(
            SourceBundle::load_foundry(temp_dir.path(), "Stub_Contract"),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn test_abstract_artifact_rejected() {
        let temp_dir = TempDir::new("proxup-artifacts").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("Base.sol");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Base.json"), r#"{"bytecode":{"object":"0x"}}"#).unwrap();

        assert!(matches!(
            ContractArtifact::load_foundry(temp_dir.path(), "Base"),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn test_init_code_appends_constructor_args() {
        let artifact = ContractArtifact::new("Stub", vec![0x60u8, 0x80]);
        assert_eq!(
            artifact.init_code(&[0xaa, 0xbb]),
            Bytes::from_static(&[0x60, 0x80, 0xaa, 0xbb])
        );
    }

    #[test]
    fn test_code_hash_covers_constructor_args() {
        let artifact = ContractArtifact::new("Stub", vec![0x60u8, 0x80]);
        let one = U256::from(1).abi_encode();
        let two = U256::from(2).abi_encode();

        assert_eq!(artifact.code_hash(&one), artifact.code_hash(&one));
        assert_ne!(artifact.code_hash(&one), artifact.code_hash(&two));
        assert_ne!(artifact.code_hash(&one), artifact.code_hash(&[]));
    }

    #[test]
    fn test_initializer_calldata() {
        let owner = address!("0xB8c77482e45F1F44dE1745F52C74426C631bDD52");
        let args = [DynSolValue::Uint(U256::from(100), 256), DynSolValue::Address(owner)];

        let data = initializer_calldata(&args, &DeployOptions::default()).unwrap();
        assert_eq!(&data[..4], &selector("initialize(uint256,address)"));
        assert_eq!(data.len(), 4 + 64);

        let custom = DeployOptions {
            initializer: Some("setup(uint256,address)".to_string()),
            ..Default::default()
        };
        let data = initializer_calldata(&args, &custom).unwrap();
        assert_eq!(&data[..4], &selector("setup(uint256,address)"));

        assert!(initializer_calldata(&[], &DeployOptions::default()).unwrap().is_empty());
    }
}
