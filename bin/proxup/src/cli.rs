use std::str::FromStr;

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use clap::{Parser, Subcommand};
use proxup_deploy::KEY_SEPARATORS;
use tracing::level_filters::LevelFilter;

/// A tag or deployment id: non-empty, without registry key separators.
fn parse_key_part(s: &str) -> Result<String, String> {
    if s.is_empty() || s.contains(KEY_SEPARATORS) {
        return Err(format!("{s:?} must be non-empty and contain neither ':' nor '@'"));
    }
    Ok(s.to_string())
}

/// A typed initializer argument, written `<solidity-type>:<value>`.
///
/// e.g. `uint256:100`, `address:0xB8c7...DD52`, `string:hello`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitArg(pub DynSolValue);

impl FromStr for InitArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, value) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected <type>:<value>, got {s}"))?;

        let ty = DynSolType::parse(ty)?;
        Ok(Self(ty.coerce_str(value)?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "proxup")]
#[command(
    author,
    version,
    about = "Deploy and upgrade proxy contracts, idempotently"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "PROXUP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file.
    ///
    /// Defaults to ./Proxup.toml. Every key can also be set through `PROXUP_*`
    /// environment variables.
    #[arg(long, alias = "conf", global = true, env = "PROXUP_CONFIG")]
    pub config: Option<String>,

    /// How results are printed.
    #[arg(long, global = true, env = "PROXUP_OUTPUT", default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy a proxy for an artifact, or upgrade it if its code changed.
    Deploy(DeployArgs),

    /// List registered proxies.
    List,

    /// Write the resolved configuration to a file.
    SaveConfig {
        /// Destination file.
        #[arg(default_value = "Proxup.toml")]
        path: String,
    },
}

#[derive(Debug, clap::Args)]
pub struct DeployArgs {
    /// Name of the compiled artifact, e.g. `Stub_Contract`.
    pub artifact: String,

    /// Tags distinguishing variants of the same artifact.
    #[arg(short, long = "tag", value_parser = parse_key_part)]
    pub tags: Vec<String>,

    /// Instance id, for several proxies of the same logical contract.
    #[arg(short, long, value_parser = parse_key_part)]
    pub deployment_id: Option<String>,

    /// Initializer arguments as `<type>:<value>`. Only used when the proxy is created.
    #[arg(short = 'a', long = "arg")]
    pub init_args: Vec<InitArg>,

    /// Initializer signature. Derived from the argument types when omitted.
    #[arg(long)]
    pub initializer: Option<String>,

    /// Calldata (hex) executed on upgrade.
    #[arg(long)]
    pub upgrade_data: Option<String>,

    /// Skip the storage layout check before upgrading.
    #[arg(long, default_value_t = false)]
    pub skip_layout_check: bool,
}
