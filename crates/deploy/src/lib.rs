//! proxup-deploy - Deployment and upgrade orchestration for proxy contracts.
//!
//! This crate decides, for every logical contract instance, whether a proxy must be
//! created, whether its implementation changed, and how the activation call reaches
//! the chain (direct transaction or multisig proposal).

mod bytecode;
pub use bytecode::BytecodeComparator;

mod config;
pub use config::{
    CONFIG_FILENAME, ENV_PREFIX, NetworkConfig, NetworkTier, OrchestratorConfig, RetryConfig,
    RoutingConfig, VerificationConfig,
};

mod contract;
pub use contract::{
    ContractCall, TxReceipt, UPGRADE_TO_AND_CALL, encode_calldata, selector, signature_for,
};

mod error;
pub use error::DeployError;

mod explorer;
pub use explorer::{EtherscanClient, ExplorerApi, VerificationTarget};

mod history;
pub use history::{
    BytecodeAlias, BytecodeAliasGroup, BytecodeHistoryStore, FileHistoryStore, MemoryHistoryStore,
};

mod orchestrator;
pub use orchestrator::{
    DeployRequest, DeploymentRecord, DeploymentSession, OrchestrationContext, ProxyOrchestrator,
};

mod proxy;
pub use proxy::{
    ContractArtifact, DEFAULT_PROXY_ARTIFACT, DeployOptions, ProxyBackend, RpcProxyBackend,
    SourceBundle, StorageLayoutValidator, initializer_calldata,
};

mod registry;
pub use registry::{
    DeploymentRegistry, FileRegistryStore, KEY_SEPARATORS, LogicalName, MemoryRegistryStore,
    RegistryEntry, RegistryKey, RegistryStore,
};

pub mod retry;
pub use retry::RetryPolicy;

mod router;
pub use router::{RouteOutcome, TransactionRouter};

pub mod rpc;
pub use rpc::RpcClient;

mod safe;
pub use safe::{
    MultisigApi, Operation, SAFE_TX_TYPEHASH, SafeProposal, SafeProposalBuilder,
    SafeServiceClient, SafeTransaction,
};

mod signer;
pub use signer::{ChainSigner, RpcSigner};

mod state;
pub use state::{DeployState, DeployStatus};

mod verify;
pub use verify::{VerificationOutcome, VerificationService};
