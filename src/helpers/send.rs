//! Asset transfer dispatcher

use crate::chain::{AccountId, BitcoinRpc, ChainId, EvmChain};
use crate::error::{HarnessError, HarnessResult};
use crate::tx::{ExtrinsicSubmitter, RuntimeCall};

use ethers::types::U256;
use ethers::utils::ParseUnits;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Btc,
    Eth,
    Dot,
    Usdc,
    Flip,
}

impl Asset {
    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Dot => "DOT",
            Asset::Usdc => "USDC",
            Asset::Flip => "FLIP",
        }
    }

    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Btc => 8,
            Asset::Eth | Asset::Flip => 18,
            Asset::Dot => 10,
            Asset::Usdc => 6,
        }
    }

    /// Amount sent when the operator gives none
    pub fn default_amount(&self) -> &'static str {
        match self {
            Asset::Btc => "0.05",
            Asset::Eth => "5",
            Asset::Dot => "50",
            Asset::Usdc | Asset::Flip => "500",
        }
    }
}

impl FromStr for Asset {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "DOT" => Ok(Asset::Dot),
            "USDC" => Ok(Asset::Usdc),
            "FLIP" => Ok(Asset::Flip),
            _ => Err(HarnessError::UnsupportedAsset(s.to_string())),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Digits in `u128::MAX`
const MAX_UNIT_DIGITS: usize = 39;

/// Decimal string to integer base units, e.g. `("1.5", 10)` -> 15_000_000_000
pub fn parse_units(amount: &str, decimals: u32) -> HarnessResult<u128> {
    let invalid = |reason: &str| HarnessError::InvalidAmount {
        amount: amount.to_string(),
        reason: reason.to_string(),
    };

    if !amount.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    let (whole, fraction) = amount.split_once('.').unwrap_or((amount, ""));
    // ethers truncates excess fractional digits rather than rejecting them
    if fraction.len() > decimals as usize {
        return Err(invalid("more fractional digits than the asset supports"));
    }
    // Keeps the U256 scaling below from overflowing
    if whole.trim_start_matches('0').len() + decimals as usize > MAX_UNIT_DIGITS {
        return Err(invalid("amount too large"));
    }

    match ethers::utils::parse_units(amount, decimals).map_err(|e| invalid(&e.to_string()))? {
        ParseUnits::U256(units) if units <= U256::from(u128::MAX) => Ok(units.as_u128()),
        ParseUnits::U256(_) => Err(invalid("amount too large")),
        ParseUnits::I256(_) => Err(invalid("negative amount")),
    }
}

/// Error for commands that need the control or relay chain without one
pub fn no_substrate_backend() -> HarnessError {
    HarnessError::Config("no Substrate backend configured".to_string())
}

/// Sends assets to addresses on whichever chain holds them. Chains that are
/// not attached reject their assets with a configuration error.
#[derive(Default)]
pub struct AssetSender {
    bitcoin: Option<Arc<dyn BitcoinRpc>>,
    ethereum: Option<Arc<dyn EvmChain>>,
    polkadot: Option<Arc<ExtrinsicSubmitter>>,
}

impl AssetSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bitcoin(mut self, bitcoin: Arc<dyn BitcoinRpc>) -> Self {
        self.bitcoin = Some(bitcoin);
        self
    }

    pub fn with_ethereum(mut self, ethereum: Arc<dyn EvmChain>) -> Self {
        self.ethereum = Some(ethereum);
        self
    }

    pub fn with_polkadot(mut self, polkadot: Arc<ExtrinsicSubmitter>) -> Self {
        self.polkadot = Some(polkadot);
        self
    }

    /// Send `amount` (or the asset's default) and return a transaction reference
    pub async fn send(&self, asset: Asset, address: &str, amount: Option<&str>) -> HarnessResult<String> {
        let amount = amount.unwrap_or_else(|| asset.default_amount());
        // Reject malformed amounts before touching any chain
        let units = parse_units(amount, asset.decimals())?;

        match asset {
            Asset::Btc => {
                let bitcoin = self.bitcoin.as_ref().ok_or_else(|| unattached(ChainId::Bitcoin))?;
                info!("Sending {} {} to {}", amount, asset, address);
                bitcoin.send_to_address(address, amount).await
            }
            Asset::Eth => {
                let ethereum = self.ethereum.as_ref().ok_or_else(|| unattached(ChainId::Ethereum))?;
                info!("Sending {} {} to {}", amount, asset, address);
                ethereum.send_native(address, amount).await
            }
            Asset::Dot => {
                let polkadot = self.polkadot.as_ref().ok_or_else(no_substrate_backend)?;
                info!("Sending {} {} to {}", amount, asset, address);
                let result = polkadot
                    .submit_and_wait(RuntimeCall::Transfer {
                        dest: AccountId::new(address),
                        amount: units,
                    })
                    .await?;
                Ok(format!("{}-{}", result.block_number, result.extrinsic_index))
            }
            Asset::Usdc | Asset::Flip => {
                let ethereum = self.ethereum.as_ref().ok_or_else(|| unattached(ChainId::Ethereum))?;
                info!("Sending {} {} to {}", amount, asset, address);
                ethereum.send_erc20(asset.symbol(), address, amount).await
            }
        }
    }
}

fn unattached(chain: ChainId) -> HarnessError {
    HarnessError::Config(format!("no {} backend configured", chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assets_parse_case_insensitively() {
        assert_eq!("btc".parse::<Asset>().unwrap(), Asset::Btc);
        assert_eq!("Usdc".parse::<Asset>().unwrap(), Asset::Usdc);
        let err = "SOL".parse::<Asset>().unwrap_err();
        assert_eq!(err, HarnessError::UnsupportedAsset("SOL".into()));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn default_amounts() {
        assert_eq!(Asset::Btc.default_amount(), "0.05");
        assert_eq!(Asset::Eth.default_amount(), "5");
        assert_eq!(Asset::Dot.default_amount(), "50");
        assert_eq!(Asset::Flip.default_amount(), "500");
    }

    #[test]
    fn decimal_amounts_scale_to_base_units() {
        assert_eq!(parse_units("1.5", 10).unwrap(), 15_000_000_000);
        assert_eq!(parse_units("500", 6).unwrap(), 500_000_000);
        assert_eq!(parse_units("0.05", 8).unwrap(), 5_000_000);
        assert_eq!(parse_units(".5", 1).unwrap(), 5);
        assert_eq!(parse_units("007", 0).unwrap(), 7);
    }

    #[test]
    fn amounts_beyond_u128_are_rejected() {
        assert_eq!(parse_units(&u128::MAX.to_string(), 0).unwrap(), u128::MAX);

        let err = parse_units("340282366920938463463374607431768211456", 0).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidAmount { ref reason, .. } if reason == "amount too large"
        ));
        assert!(parse_units("1000000000000000000000", 18).is_err());
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let err = parse_units("-1", 2).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidAmount { ref reason, .. } if reason == "negative amount"
        ));
    }

    #[tokio::test]
    async fn unattached_chains_are_a_config_error() {
        let sender = AssetSender::new();

        let err = sender.send(Asset::Dot, "0xaa", Some("1")).await.unwrap_err();
        assert_eq!(err, no_substrate_backend());
        assert_eq!(err.exit_code(), 255);

        let err = sender.send(Asset::Btc, "bcrt1qxyz", None).await.unwrap_err();
        assert!(matches!(err, HarnessError::Config(ref message) if message.contains("bitcoin")));
    }

    #[tokio::test]
    async fn malformed_amount_fails_before_the_chain_check() {
        let err = AssetSender::new().send(Asset::Eth, "0xaa", Some("1.x")).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidAmount { .. }));
    }

    #[test]
    fn malformed_amounts_are_rejected() {
        for amount in ["", ".", "1.2.3", "-1", "abc", "0.123"] {
            let result = parse_units(amount, 2);
            assert!(
                matches!(result, Err(HarnessError::InvalidAmount { .. })),
                "{} should be rejected",
                amount
            );
        }
    }
}
