//! Deploy-or-upgrade orchestration for one logical proxy at a time.
//!
//! Every step commits its own side effect before the next one starts: a freshly
//! created proxy is in the registry before anything assumes it exists, so an
//! interrupted call can simply be run again.

use std::{collections::BTreeMap, fmt};

use alloy_core::{dyn_abi::DynSolValue, primitives::Address};
use derive_more::Deref;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::BytecodeComparator,
    error::DeployError,
    explorer::{ExplorerApi, VerificationTarget},
    history::BytecodeHistoryStore,
    proxy::{DeployOptions, ProxyBackend, StorageLayoutValidator, initializer_calldata},
    registry::{DeploymentRegistry, LogicalName, RegistryEntry, RegistryKey, RegistryStore},
    router::{RouteOutcome, TransactionRouter},
    safe::MultisigApi,
    signer::ChainSigner,
    state::{DeployState, DeployStatus},
    verify::VerificationService,
};

/// What a single `deploy` call works on.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    pub network: String,
    pub key: RegistryKey,
}

impl fmt::Display for OrchestrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.key, self.network)
    }
}

/// Input of [`ProxyOrchestrator::deploy`].
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub logical_name: LogicalName,
    pub deployment_id: Option<String>,
    /// Initializer arguments, used only when the proxy is created.
    pub init_args: Vec<DynSolValue>,
    pub options: DeployOptions,
}

impl DeployRequest {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            logical_name: LogicalName::new(artifact),
            deployment_id: None,
            init_args: Vec::new(),
            options: DeployOptions::default(),
        }
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.logical_name = self.logical_name.with_tags(tags);
        self
    }

    pub fn deployment_id(mut self, id: impl Into<String>) -> Self {
        self.deployment_id = Some(id.into());
        self
    }

    pub fn init_args(mut self, args: Vec<DynSolValue>) -> Self {
        self.init_args = args;
        self
    }

    pub fn options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> RegistryKey {
        RegistryKey::new(self.logical_name.clone(), self.deployment_id.clone())
    }
}

/// Result of one `deploy` call for one logical proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub logical_name: LogicalName,
    pub deployment_id: Option<String>,
    pub proxy_address: Address,
    /// Implementation behind the proxy, or about to be once a pending proposal executes.
    pub implementation_address: Address,
    pub status: DeployStatus,
    /// Implementation source published and the proxy linked to it on the explorer.
    /// For a pending proposal, only the candidate's source.
    pub verified: bool,
    /// Set when an activation call was sent or proposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<RouteOutcome>,
}

impl DeploymentRecord {
    pub fn key(&self) -> RegistryKey {
        RegistryKey::new(self.logical_name.clone(), self.deployment_id.clone())
    }
}

/// Records of a deployment session, keyed by proxy address.
///
/// Passed explicitly into every `deploy` call and merged by the caller.
#[derive(Debug, Clone, Default, Deref)]
pub struct DeploymentSession(BTreeMap<Address, DeploymentRecord>);

impl DeploymentSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `record`, replacing an earlier record of the same proxy.
    pub fn insert(&mut self, record: DeploymentRecord) {
        self.0.insert(record.proxy_address, record);
    }

    pub fn merge(&mut self, other: DeploymentSession) {
        self.0.extend(other.0);
    }

    pub fn records(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.0.values()
    }

    /// Records whose activation still awaits multisig approval.
    pub fn pending(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.records()
            .filter(|r| r.activation.as_ref().is_some_and(RouteOutcome::is_pending))
    }
}

/// Composes the registry, comparator, router and verifier around a proxy backend.
pub struct ProxyOrchestrator<B, S, H, E, M, G> {
    backend: B,
    registry: DeploymentRegistry<S>,
    comparator: BytecodeComparator<H>,
    verifier: VerificationService<E>,
    router: TransactionRouter<M>,
    signer: G,
    network: String,
}

impl<B, S, H, E, M, G> ProxyOrchestrator<B, S, H, E, M, G>
where
    B: ProxyBackend + StorageLayoutValidator,
    S: RegistryStore,
    H: BytecodeHistoryStore,
    E: ExplorerApi,
    M: MultisigApi,
    G: ChainSigner,
{
    pub fn new(
        backend: B,
        registry: DeploymentRegistry<S>,
        comparator: BytecodeComparator<H>,
        verifier: VerificationService<E>,
        router: TransactionRouter<M>,
        signer: G,
    ) -> Self {
        Self {
            backend,
            registry,
            comparator,
            verifier,
            router,
            signer,
            network: "unknown".to_string(),
        }
    }

    /// Network name used in logs.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &DeploymentRegistry<S> {
        &self.registry
    }

    /// All registered proxies.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>, DeployError> {
        self.registry.entries().await
    }

    /// Create the proxy if needed, upgrade it if its code changed, then verify the
    /// implementation and the proxy in front of it.
    ///
    /// The returned record is also inserted into `session`.
    pub async fn deploy(
        &self,
        request: DeployRequest,
        session: &mut DeploymentSession,
    ) -> Result<DeploymentRecord, DeployError> {
        let ctx = OrchestrationContext {
            network: self.network.clone(),
            key: request.key(),
        };
        let artifact = self.backend.artifact(&ctx.key.logical_name.artifact)?;
        let mut state = DeployState::new();

        let proxy = match self.registry.get_proxy_address(&ctx.key).await? {
            Some(proxy) => {
                if !self.backend.contract_exists(proxy).await? {
                    return Err(DeployError::RegistryInconsistency(format!(
                        "{ctx} is registered at {proxy} but no contract exists there"
                    )));
                }
                tracing::debug!(deployment = %ctx, %proxy, "Found registered proxy");
                proxy
            }
            None => {
                let init_data = initializer_calldata(&request.init_args, &request.options)?;
                let proxy = self
                    .backend
                    .create_proxy(&artifact, &init_data, &request.options)
                    .await?;

                self.registry.save_proxy(&ctx.key, proxy).await?;
                state.switch_to(DeployStatus::Deployed)?;
                tracing::info!(deployment = %ctx, %proxy, "Proxy created");
                proxy
            }
        };

        let current = self.backend.current_implementation(proxy).await?;
        if current == Address::ZERO {
            return Err(DeployError::RegistryInconsistency(format!(
                "proxy {proxy} of {ctx} has no implementation"
            )));
        }

        let candidate = self
            .backend
            .prepare_upgrade(proxy, &artifact, &request.options)
            .await?;
        self.comparator
            .history()
            .record_alias(
                artifact.code_hash(&request.options.constructor_args),
                candidate,
            )
            .await?;

        let (implementation, activation) =
            if self.comparator.have_same_bytecode(current, candidate).await? {
                tracing::info!(deployment = %ctx, %proxy, implementation = %current, "Implementation unchanged");
                (current, None)
            } else {
                if request.options.validate_storage_layout {
                    self.backend
                        .validate_upgrade(proxy, candidate, &artifact)
                        .await?;
                }

                let call = self
                    .backend
                    .activation_call(proxy, candidate, &request.options);
                let outcome = self.router.send(&call, &self.signer).await?;
                state.switch_to(DeployStatus::Upgraded)?;

                tracing::info!(
                    deployment = %ctx,
                    %proxy,
                    from = %current,
                    to = %candidate,
                    pending = outcome.is_pending(),
                    "Proxy upgraded"
                );
                (candidate, Some(outcome))
            };

        let constructor_args = &request.options.constructor_args;
        let verification = match &activation {
            // The proxy keeps its current implementation until the proposal executes,
            // so only the candidate's source can be published for now.
            Some(outcome) if outcome.is_pending() => {
                self.verifier
                    .verify(&VerificationTarget::Source {
                        address: implementation,
                        contract: artifact.name.clone(),
                        constructor_args: constructor_args.clone(),
                    })
                    .await
            }
            _ => {
                self.verifier
                    .verify_proxy(proxy, implementation, &artifact.name, constructor_args)
                    .await
            }
        };
        let verified = verification.is_verified();

        let record = DeploymentRecord {
            logical_name: request.logical_name,
            deployment_id: request.deployment_id,
            proxy_address: proxy,
            implementation_address: implementation,
            status: state.finish(),
            verified,
            activation,
        };
        session.insert(record.clone());

        Ok(record)
    }
}
