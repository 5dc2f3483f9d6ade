//! Vault setup orchestration
//!
//! The setup workflow:
//! 1. Initializes Arbitrum on the state chain and forces a key rotation
//! 2. Waits for a new key from every vault chain
//! 3. Creates and funds the Polkadot vault, handing it to the new key
//! 4. Initializes contracts, registers the vaults and waits for the new epoch

pub mod engine;
pub mod harness;
pub mod phase;

pub use engine::{SetupParams, VaultSetup};
pub use harness::{rpc_asset_sender, Harness};
pub use phase::{SetupOutcome, SetupReport, SetupState, VaultAccount, VaultKeys};
