//! Configuration management for the vault harness
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::ChainId;
use crate::error::{HarnessError, HarnessResult};
use crate::tx::ProxyType;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const CONFIG_ENV_VAR: &str = "VAULT_HARNESS_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub harness: HarnessConfig,
    pub metrics: MetricsConfig,
    pub accounts: AccountsConfig,
    pub setup: SetupConfig,
    pub localnet: LocalnetConfig,
    pub bitcoin: BitcoinConfig,
    pub arbitrum: EvmConfig,
    pub ethereum: EvmConfig,
    pub solana: Option<SolanaConfig>,
}

/// When a submitted extrinsic counts as done
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InclusionPolicy {
    #[default]
    InBlock,
    Finalized,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub inclusion: InclusionPolicy,
    pub reconnect_delay_ms: u64,
    /// Finalized blocks buffered per chain feed before slow observers lag
    pub feed_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            inclusion: InclusionPolicy::InBlock,
            reconnect_delay_ms: 2_000,
            feed_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Signer URIs. Dev URIs (`//Name`) are fine to keep in files, real seeds
/// should come in through `${VAR}` substitution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub governance_uri: String,
    pub funding_uri: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            governance_uri: "//Snowwhite".to_string(),
            funding_uri: "//Alice".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Planck sent to the new vault account
    pub vault_funding: u64,
    /// Planck sent to the account of the new polkadot key
    pub key_funding: u64,
    pub proxy_type: ProxyType,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            vault_funding: 100 * DOT_PLANCK,
            key_funding: 100 * DOT_PLANCK,
            proxy_type: ProxyType::Any,
        }
    }
}

/// 1 DOT in planck
pub const DOT_PLANCK: u64 = 10_000_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalnetConfig {
    pub block_time_ms: u64,
    /// Blocks between a rotation request and the new keys appearing
    pub keygen_delay_blocks: u64,
    /// Vault chains that take part in key generation
    pub answering_chains: Vec<ChainId>,
    /// Balance minted to every dev account on the relay chain
    pub endowment: u64,
}

impl Default for LocalnetConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 500,
            keygen_delay_blocks: 2,
            answering_chains: vec![ChainId::Polkadot, ChainId::Bitcoin, ChainId::Arbitrum],
            endowment: 1_000_000 * DOT_PLANCK,
        }
    }
}

/// Where a peripheral chain lives
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Localnet,
    Rpc,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BitcoinConfig {
    pub backend: Backend,
    pub rpc_url: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EvmConfig {
    pub backend: Backend,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    /// Name of the environment variable holding the signer's private key
    pub private_key_env: Option<String>,
    pub key_manager_address: Option<String>,
    /// ERC-20 tokens by symbol
    pub tokens: HashMap<String, TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    /// Aggregate key the vault programs are initialised with
    pub agg_key: String,
}

impl Settings {
    /// Load settings from `path`, `$VAULT_HARNESS_CONFIG` or the default file.
    ///
    /// A missing default file yields built-in localnet settings; an explicitly
    /// requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

        let config_path = match explicit {
            Some(path) => path,
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    tracing::info!("No config file found, using localnet defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.harness.feed_capacity == 0 {
            anyhow::bail!("harness.feed_capacity must be at least 1");
        }

        if self.bitcoin.backend == Backend::Rpc && self.bitcoin.rpc_url.is_none() {
            anyhow::bail!("Bitcoin RPC backend has no rpc_url configured");
        }

        // Arbitrum is only driven by vault setup, which runs against the
        // localnet control chain
        if self.arbitrum.backend == Backend::Rpc {
            anyhow::bail!("arbitrum cannot use an rpc backend: vault setup runs on the localnet");
        }

        if self.ethereum.backend == Backend::Rpc {
            if self.ethereum.rpc_url.is_none() {
                anyhow::bail!("{} RPC backend has no rpc_url configured", ChainId::Ethereum);
            }
            if self.ethereum.private_key_env.is_none() {
                anyhow::bail!("{} RPC backend has no private_key_env configured", ChainId::Ethereum);
            }
        }

        if self.localnet.answering_chains.iter().any(|c| {
            !matches!(c, ChainId::Polkadot | ChainId::Bitcoin | ChainId::Arbitrum)
        }) {
            anyhow::bail!("localnet.answering_chains may only list polkadot, bitcoin and arbitrum");
        }

        Ok(())
    }

    /// Check that every peripheral chain can run beside the localnet
    /// control chain. Keys generated by the localnet are fabricated, so they
    /// must never reach a real chain.
    pub fn validate_localnet(&self) -> HarnessResult<()> {
        let backends = [
            (ChainId::Bitcoin, self.bitcoin.backend),
            (ChainId::Arbitrum, self.arbitrum.backend),
            (ChainId::Ethereum, self.ethereum.backend),
        ];
        match backends.iter().find(|(_, backend)| *backend == Backend::Rpc) {
            Some((chain, _)) => Err(HarnessError::Config(format!(
                "{} uses an rpc backend; the localnet control chain only drives localnet peripherals",
                chain
            ))),
            None => Ok(()),
        }
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    let result = re.replace_all(input, |cap: &regex::Captures<'_>| {
        env::var(&cap[1]).unwrap_or_default()
    });
    Ok(result.into_owned())
}
