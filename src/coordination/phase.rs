//! Vault setup states and the data each one carries forward

use crate::chain::AccountId;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Keys produced by the rotation, one per vault chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultKeys {
    pub polkadot: Vec<u8>,
    pub bitcoin: Vec<u8>,
    pub arbitrum: Vec<u8>,
}

/// The pure proxy that becomes the Polkadot vault, and where it was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultAccount {
    pub address: AccountId,
    pub block_number: u64,
    pub extrinsic_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub keys: VaultKeys,
    pub vault: VaultAccount,
    /// Block at which the new key became the vault's proxy
    pub vault_block: u64,
    pub epoch: u64,
}

/// Vault setup state. Each non-terminal state names the phase that runs next;
/// its fields are the confirmed outputs of the phases before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
    ArbitrumChainInit,
    RotationRequested,
    AwaitingKeys {
        rotation_block: u64,
    },
    VaultCreated {
        keys: VaultKeys,
    },
    ProxyRotatedAndFunded {
        keys: VaultKeys,
        vault: VaultAccount,
    },
    ContractsInitialized {
        keys: VaultKeys,
        vault: VaultAccount,
        vault_block: u64,
    },
    VaultsRegistered {
        keys: VaultKeys,
        vault: VaultAccount,
        vault_block: u64,
    },
    EpochConfirmed {
        keys: VaultKeys,
        vault: VaultAccount,
        vault_block: u64,
        registration_block: u64,
    },
    Done(SetupOutcome),
}

impl SetupState {
    pub fn name(&self) -> &'static str {
        match self {
            SetupState::ArbitrumChainInit => "ArbitrumChainInit",
            SetupState::RotationRequested => "RotationRequested",
            SetupState::AwaitingKeys { .. } => "AwaitingKeys",
            SetupState::VaultCreated { .. } => "VaultCreated",
            SetupState::ProxyRotatedAndFunded { .. } => "ProxyRotatedAndFunded",
            SetupState::ContractsInitialized { .. } => "ContractsInitialized",
            SetupState::VaultsRegistered { .. } => "VaultsRegistered",
            SetupState::EpochConfirmed { .. } => "EpochConfirmed",
            SetupState::Done(_) => "Done",
        }
    }

    /// Position in the fixed phase order, starting at 1
    pub fn ordinal(&self) -> usize {
        match self {
            SetupState::ArbitrumChainInit => 1,
            SetupState::RotationRequested => 2,
            SetupState::AwaitingKeys { .. } => 3,
            SetupState::VaultCreated { .. } => 4,
            SetupState::ProxyRotatedAndFunded { .. } => 5,
            SetupState::ContractsInitialized { .. } => 6,
            SetupState::VaultsRegistered { .. } => 7,
            SetupState::EpochConfirmed { .. } => 8,
            SetupState::Done(_) => 9,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, SetupState::Done(_))
    }
}

impl fmt::Display for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub duration_ms: u64,
}

/// Summary of a completed run, logged as JSON
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseTiming>,
    pub polkadot_key: String,
    pub bitcoin_key: String,
    pub arbitrum_key: String,
    pub polkadot_vault: String,
    pub vault_block: u64,
    pub vault_extrinsic_index: u32,
    pub epoch: u64,
}

impl SetupReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        phases: Vec<PhaseTiming>,
        outcome: &SetupOutcome,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            phases,
            polkadot_key: format!("0x{}", hex::encode(&outcome.keys.polkadot)),
            bitcoin_key: format!("0x{}", hex::encode(&outcome.keys.bitcoin)),
            arbitrum_key: format!("0x{}", hex::encode(&outcome.keys.arbitrum)),
            polkadot_vault: outcome.vault.address.to_string(),
            vault_block: outcome.vault_block,
            vault_extrinsic_index: outcome.vault.extrinsic_index,
            epoch: outcome.epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_phase_order() {
        let keys = VaultKeys {
            polkadot: vec![1],
            bitcoin: vec![2],
            arbitrum: vec![3],
        };
        let vault = VaultAccount {
            address: AccountId::new("0xvault"),
            block_number: 4,
            extrinsic_index: 1,
        };
        let states = [
            SetupState::ArbitrumChainInit,
            SetupState::RotationRequested,
            SetupState::AwaitingKeys { rotation_block: 2 },
            SetupState::VaultCreated { keys: keys.clone() },
            SetupState::ProxyRotatedAndFunded {
                keys: keys.clone(),
                vault: vault.clone(),
            },
            SetupState::ContractsInitialized {
                keys: keys.clone(),
                vault: vault.clone(),
                vault_block: 5,
            },
            SetupState::VaultsRegistered {
                keys: keys.clone(),
                vault: vault.clone(),
                vault_block: 5,
            },
            SetupState::EpochConfirmed {
                keys: keys.clone(),
                vault: vault.clone(),
                vault_block: 5,
                registration_block: 9,
            },
            SetupState::Done(SetupOutcome {
                keys,
                vault,
                vault_block: 5,
                epoch: 1,
            }),
        ];

        let ordinals: Vec<usize> = states.iter().map(SetupState::ordinal).collect();
        assert_eq!(ordinals, (1..=9).collect::<Vec<_>>());
        assert!(states[8].is_done());
        assert_eq!(states[2].to_string(), "AwaitingKeys");
    }
}
