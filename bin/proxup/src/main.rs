//! proxup is a CLI tool to deploy and upgrade proxy contracts without ever deploying twice.

mod cli;

use std::{path::PathBuf, sync::Arc};

use alloy_core::primitives::Bytes;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, DeployArgs, OutputFormat};
use proxup_deploy::{
    BytecodeComparator, DeployOptions, DeployRequest, DeploymentRecord, DeploymentRegistry,
    DeploymentSession, EtherscanClient, FileHistoryStore, FileRegistryStore, OrchestratorConfig,
    ProxyOrchestrator, RegistryEntry, RoutingConfig, RpcClient, RpcProxyBackend, RpcSigner,
    SafeProposalBuilder, SafeServiceClient, TransactionRouter, VerificationService,
};

type Orchestrator = ProxyOrchestrator<
    RpcProxyBackend<RpcSigner, Arc<FileHistoryStore>>,
    FileRegistryStore,
    Arc<FileHistoryStore>,
    EtherscanClient,
    SafeServiceClient,
    RpcSigner,
>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config_path = cli.config.as_ref().map(PathBuf::from);
    let config = OrchestratorConfig::load(config_path.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Deploy(args) => {
            let orchestrator = build_orchestrator(&config).await?;
            let mut session = DeploymentSession::new();

            let request = deploy_request(args)?;
            tracing::info!(
                deployment = %request.key(),
                network = %config.network.name,
                "Deploying..."
            );
            orchestrator.deploy(request, &mut session).await?;

            print_records(session.records(), cli.output)?;
            for record in session.pending() {
                tracing::warn!(
                    proxy = %record.proxy_address,
                    "Upgrade proposed to the multisig, awaiting execution by its owners"
                );
            }
        }
        Command::List => {
            let registry = DeploymentRegistry::new(FileRegistryStore::new(&config.registry_path));
            print_entries(&registry.entries().await?, cli.output)?;
        }
        Command::SaveConfig { path } => {
            config.save_to_file(&PathBuf::from(path))?;
        }
    }

    Ok(())
}

fn deploy_request(args: DeployArgs) -> Result<DeployRequest> {
    let upgrade_data = match args.upgrade_data {
        Some(hex) => hex.parse::<Bytes>().context("Invalid --upgrade-data")?,
        None => Bytes::new(),
    };

    let mut request = DeployRequest::new(args.artifact)
        .tags(args.tags)
        .init_args(args.init_args.into_iter().map(|arg| arg.0).collect())
        .options(DeployOptions {
            initializer: args.initializer,
            upgrade_data,
            validate_storage_layout: !args.skip_layout_check,
            ..Default::default()
        });
    if let Some(id) = args.deployment_id {
        request = request.deployment_id(id);
    }

    Ok(request)
}

/// Wire every component from the resolved configuration.
async fn build_orchestrator(config: &OrchestratorConfig) -> Result<Orchestrator> {
    let rpc = RpcClient::new(config.rpc_url()?)?;

    let chain_id = rpc.chain_id().await.context("Failed to reach the RPC node")?;
    if chain_id != config.network.chain_id {
        anyhow::bail!(
            "RPC node reports chain id {chain_id}, but network {} is configured with {}",
            config.network.name,
            config.network.chain_id
        );
    }

    let signer = match config.signer_key {
        Some(key) => RpcSigner::from_key(
            rpc.clone(),
            PrivateKeySigner::from_bytes(&key).context("Invalid signer key")?,
        ),
        None => RpcSigner::first_account(rpc.clone()).await?,
    };

    let history = Arc::new(FileHistoryStore::new(&config.history_path));
    let backend = RpcProxyBackend::new(
        rpc,
        signer.clone(),
        history.clone(),
        &config.artifacts_dir,
    );

    let mut comparator = BytecodeComparator::new(history);
    if !config.bytecode_aliasing {
        comparator = comparator.without_aliasing();
    }

    let verifier = match &config.verification.explorer_url {
        Some(url) if config.verification_enabled() => VerificationService::new(
            EtherscanClient::new(
                url.clone(),
                config.verification.api_key.clone().unwrap_or_default(),
                chain_id,
            )?
            .with_artifacts_dir(&config.artifacts_dir),
            config.verification.policy(),
            config.verification.safety_delay(),
        ),
        _ => VerificationService::disabled(),
    };

    let router = match &config.routing {
        RoutingConfig::Direct => TransactionRouter::direct(config.retry.policy()),
        RoutingConfig::Multisig {
            safe_address,
            service_url,
        } => TransactionRouter::multisig(
            SafeProposalBuilder::new(
                SafeServiceClient::new(service_url.clone())?,
                *safe_address,
                chain_id,
            )
            .with_retry(config.retry.policy()),
        ),
    };

    Ok(ProxyOrchestrator::new(
        backend,
        DeploymentRegistry::new(FileRegistryStore::new(&config.registry_path)),
        comparator,
        verifier,
        router,
        signer,
    )
    .with_network(&config.network.name))
}

fn print_records<'a>(
    records: impl Iterator<Item = &'a DeploymentRecord>,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let records: Vec<_> = records.collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec![
                "Contract",
                "Proxy",
                "Implementation",
                "Status",
                "Verified",
                "Pending",
            ]);
            for record in records {
                table.add_row(vec![
                    record.key().to_string(),
                    record.proxy_address.to_string(),
                    record.implementation_address.to_string(),
                    record.status.to_string(),
                    record.verified.to_string(),
                    record
                        .activation
                        .as_ref()
                        .is_some_and(|a| a.is_pending())
                        .to_string(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

fn print_entries(entries: &[RegistryEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["Contract", "Proxy"]);
            for entry in entries {
                table.add_row(vec![entry.id.clone(), entry.address.to_string()]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
