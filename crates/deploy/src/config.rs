//! Session configuration.
//!
//! Resolved once, before the first deployment, from defaults, then `Proxup.toml`,
//! then `PROXUP_*` environment variables (`__` separates nested keys, e.g.
//! `PROXUP_NETWORK__RPC_URL`). Nothing downstream reads the environment again.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::{Address, B256};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::DeployError, retry::RetryPolicy};

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "Proxup.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "PROXUP_";

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NetworkTier {
    /// Ephemeral development chain, never verified.
    #[default]
    Local,
    Testnet,
    Mainnet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub tier: NetworkTier,
    pub rpc_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            chain_id: 31337,
            tier: NetworkTier::Local,
            rpc_url: "http://127.0.0.1:8545".to_string(),
        }
    }
}

/// How activation calls reach the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RoutingConfig {
    #[default]
    Direct,
    Multisig {
        safe_address: Address,
        service_url: Url,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retries: usize,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Policy retrying transient network failures only.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::transient(self.retries, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub retries: usize,
    pub delay_ms: u64,
    /// Wait after each submission before asking the explorer again.
    pub safety_delay_ms: u64,
    pub explorer_url: Option<Url>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries: 5,
            delay_ms: 5_000,
            safety_delay_ms: 10_000,
            explorer_url: None,
            api_key: None,
        }
    }
}

impl VerificationConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.delay_ms))
    }

    pub fn safety_delay(&self) -> Duration {
        Duration::from_millis(self.safety_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub network: NetworkConfig,
    pub routing: RoutingConfig,
    pub retry: RetryConfig,
    pub verification: VerificationConfig,
    /// Logical id to proxy address table.
    pub registry_path: PathBuf,
    /// Bytecode alias manifest.
    pub history_path: PathBuf,
    /// Foundry `out/` directory.
    pub artifacts_dir: PathBuf,
    /// Treat implementations sharing an alias group as unchanged.
    pub bytecode_aliasing: bool,
    /// Key used to sign multisig proposals. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub signer_key: Option<B256>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            routing: RoutingConfig::default(),
            retry: RetryConfig::default(),
            verification: VerificationConfig::default(),
            registry_path: PathBuf::from("deployments/registry.json"),
            history_path: PathBuf::from("deployments/history.json"),
            artifacts_dir: PathBuf::from("out"),
            bytecode_aliasing: true,
            signer_key: None,
        }
    }
}

impl OrchestratorConfig {
    /// Layer defaults, the TOML file and the environment.
    ///
    /// A missing file is not an error; the defaults and environment still apply.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.map_or_else(|| PathBuf::from(CONFIG_FILENAME), Path::to_path_buf);

        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, DeployError> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, DeployError> {
        let config: Self = figment
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))?;
        config.validate()?;

        tracing::debug!(
            network = %config.network.name,
            chain_id = config.network.chain_id,
            tier = %config.network.tier,
            multisig = config.is_multisig(),
            "Configuration resolved"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        self.rpc_url()?;

        if self.verification_enabled() && self.verification.explorer_url.is_none() {
            return Err(DeployError::Config(format!(
                "verification is enabled on {} but no explorer_url is set",
                self.network.tier
            )));
        }
        Ok(())
    }

    /// Verification is always off on local networks.
    pub fn verification_enabled(&self) -> bool {
        self.verification.enabled && self.network.tier != NetworkTier::Local
    }

    pub fn rpc_url(&self) -> Result<Url, DeployError> {
        Url::parse(&self.network.rpc_url).map_err(|e| {
            DeployError::Config(format!("invalid rpc_url {}: {e}", self.network.rpc_url))
        })
    }

    pub fn is_multisig(&self) -> bool {
        matches!(self.routing, RoutingConfig::Multisig { .. })
    }

    /// Save the configuration to a TOML file. Secrets are left out.
    pub fn save_to_file(&self, path: &Path) -> Result<(), DeployError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DeployError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            DeployError::Storage(format!("failed to write config to {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}
