//! EVM chain client: key manager calls and asset transfers

use super::{ChainId, EvmChain};
use crate::config::EvmConfig;
use crate::error::{HarnessError, HarnessResult};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Function selector: keccak256(signature)[..4]
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calldata for `setAggKeyWithGovKey((uint256 pubKeyX, uint8 pubKeyYParity))`
/// from a compressed secp256k1 key
pub fn encode_set_agg_key(agg_key: &[u8]) -> HarnessResult<Vec<u8>> {
    if agg_key.len() != 33 {
        return Err(HarnessError::Evm {
            chain: ChainId::Arbitrum,
            message: format!("aggregate key must be 33 bytes, got {}", agg_key.len()),
        });
    }
    let parity = match agg_key[0] {
        0x02 => 0u8,
        0x03 => 1u8,
        prefix => {
            return Err(HarnessError::Evm {
                chain: ChainId::Arbitrum,
                message: format!("invalid compressed key prefix 0x{:02x}", prefix),
            })
        }
    };

    let mut data = selector("setAggKeyWithGovKey((uint256,uint8))").to_vec();
    data.extend(abi::encode(&[Token::Tuple(vec![
        Token::Uint(U256::from_big_endian(&agg_key[1..])),
        Token::Uint(U256::from(parity)),
    ])]));
    Ok(data)
}

/// Calldata for ERC-20 `transfer(address,uint256)`
pub fn encode_erc20_transfer(to: Address, amount: U256) -> Vec<u8> {
    let mut data = selector("transfer(address,uint256)").to_vec();
    data.extend(abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    data
}

#[derive(Debug, Clone)]
struct Token20 {
    address: Address,
    decimals: u32,
}

/// `ethers`-backed client for one EVM chain
pub struct EvmClient {
    chain: ChainId,
    client: Arc<SignerClient>,
    key_manager: Option<Address>,
    tokens: HashMap<String, Token20>,
}

impl EvmClient {
    /// Connect to the chain's RPC endpoint and load the signer from the
    /// environment variable named in the config
    pub async fn connect(chain: ChainId, config: &EvmConfig) -> HarnessResult<Self> {
        let err = |message: String| HarnessError::Evm { chain, message };

        let url = config
            .rpc_url
            .as_deref()
            .ok_or_else(|| HarnessError::Config(format!("{} has no rpc_url", chain)))?;
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| err(format!("invalid rpc url {}: {}", url, e)))?
            .interval(Duration::from_millis(100));

        let key_env = config
            .private_key_env
            .as_deref()
            .ok_or_else(|| HarnessError::Config(format!("{} has no private_key_env", chain)))?;
        let key = std::env::var(key_env)
            .map_err(|_| HarnessError::Config(format!("{} is not set", key_env)))?;
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| HarnessError::Config(format!("invalid private key in {}: {}", key_env, e)))?;

        let chain_id = match config.chain_id {
            Some(id) => id,
            None => provider
                .get_chainid()
                .await
                .map_err(|e| HarnessError::Connectivity {
                    chain,
                    message: e.to_string(),
                })?
                .as_u64(),
        };
        let wallet = wallet.with_chain_id(chain_id);
        info!("{} client connected as {:?} (chain id {})", chain, wallet.address(), chain_id);

        let key_manager = config
            .key_manager_address
            .as_deref()
            .map(|a| a.parse::<Address>())
            .transpose()
            .map_err(|e| HarnessError::Config(format!("invalid key manager address: {}", e)))?;

        let mut tokens = HashMap::new();
        for (symbol, token) in &config.tokens {
            let address = token
                .address
                .parse::<Address>()
                .map_err(|e| HarnessError::Config(format!("invalid {} address: {}", symbol, e)))?;
            tokens.insert(
                symbol.to_uppercase(),
                Token20 {
                    address,
                    decimals: token.decimals,
                },
            );
        }

        Ok(Self {
            chain,
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            key_manager,
            tokens,
        })
    }

    /// Send a transaction and wait for a successful receipt
    async fn send(&self, to: Address, value: U256, data: Vec<u8>) -> HarnessResult<String> {
        let err = |message: String| HarnessError::Evm {
            chain: self.chain,
            message,
        };

        let tx = TransactionRequest::new().to(to).value(value).data(data);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| err(format!("send failed: {}", e)))?;
        let tx_hash = pending.tx_hash();
        debug!("{} transaction sent: {:?}", self.chain, tx_hash);

        let receipt = pending
            .await
            .map_err(|e| err(format!("receipt for {:?}: {}", tx_hash, e)))?
            .ok_or_else(|| err(format!("transaction {:?} dropped", tx_hash)))?;

        if receipt.status == Some(U64::zero()) {
            return Err(err(format!("transaction {:?} reverted", tx_hash)));
        }
        Ok(format!("{:?}", tx_hash))
    }

    fn parse_address(&self, to: &str) -> HarnessResult<Address> {
        to.parse::<Address>().map_err(|e| HarnessError::InvalidAmount {
            amount: to.to_string(),
            reason: format!("not an EVM address: {}", e),
        })
    }
}

#[async_trait]
impl EvmChain for EvmClient {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn block_number(&self) -> HarnessResult<u64> {
        self.client
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| HarnessError::Connectivity {
                chain: self.chain,
                message: e.to_string(),
            })
    }

    async fn set_agg_key_with_gov_key(&self, agg_key: &[u8]) -> HarnessResult<String> {
        let key_manager = self.key_manager.ok_or_else(|| {
            HarnessError::Config(format!("{} has no key_manager_address", self.chain))
        })?;
        let data = encode_set_agg_key(agg_key)?;
        let tx_hash = self.send(key_manager, U256::zero(), data).await?;
        info!("Aggregate key set on {} key manager in {}", self.chain, tx_hash);
        Ok(tx_hash)
    }

    async fn send_native(&self, to: &str, amount: &str) -> HarnessResult<String> {
        let to = self.parse_address(to)?;
        let value = ethers::utils::parse_ether(amount).map_err(|e| HarnessError::InvalidAmount {
            amount: amount.to_string(),
            reason: e.to_string(),
        })?;
        self.send(to, value, Vec::new()).await
    }

    async fn send_erc20(&self, symbol: &str, to: &str, amount: &str) -> HarnessResult<String> {
        let token = self
            .tokens
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| HarnessError::UnsupportedAsset(symbol.to_string()))?;
        let to = self.parse_address(to)?;
        let value: U256 = ethers::utils::parse_units(amount, token.decimals)
            .map_err(|e| HarnessError::InvalidAmount {
                amount: amount.to_string(),
                reason: e.to_string(),
            })?
            .into();
        self.send(token.address, U256::zero(), encode_erc20_transfer(to, value))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn agg_key_calldata_carries_x_and_parity() {
        let mut key = vec![0x03];
        key.extend([0x11u8; 32]);

        let data = encode_set_agg_key(&key).unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &selector("setAggKeyWithGovKey((uint256,uint8))"));
        assert_eq!(&data[4..36], &[0x11u8; 32]);
        assert_eq!(data[67], 1);
    }

    #[test]
    fn agg_key_must_be_compressed() {
        assert!(encode_set_agg_key(&[0x04; 33]).is_err());
        assert!(encode_set_agg_key(&[0x02; 32]).is_err());
    }
}
