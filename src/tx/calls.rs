//! Runtime calls submitted by the harness

use crate::chain::{AccountId, ChainId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Proxy permission class on the relay chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyType {
    Any,
    NonTransfer,
    Governance,
    Staking,
}

/// Privileged calls dispatched through `governance.proposeGovernanceExtrinsic`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GovernanceCall {
    /// `<chain>Vault.initializeChain`
    InitializeChain(ChainId),
    /// `validator.forceRotation`
    ForceRotation,
    /// `environment.witnessPolkadotVaultCreation`
    WitnessPolkadotVaultCreation {
        vault: AccountId,
        block_number: u64,
        extrinsic_index: u32,
    },
    /// `environment.witnessCurrentBitcoinBlockNumberForKey`
    WitnessCurrentBitcoinBlockNumberForKey { block_number: u64, key: Vec<u8> },
    /// `environment.witnessInitializeArbitrumVault`
    WitnessInitializeArbitrumVault { block_number: u64 },
    /// `environment.updateSafeMode`
    UpdateSafeMode(SafeModeUpdate),
}

impl GovernanceCall {
    pub fn name(&self) -> &'static str {
        match self {
            GovernanceCall::InitializeChain(_) => "initializeChain",
            GovernanceCall::ForceRotation => "forceRotation",
            GovernanceCall::WitnessPolkadotVaultCreation { .. } => "witnessPolkadotVaultCreation",
            GovernanceCall::WitnessCurrentBitcoinBlockNumberForKey { .. } => {
                "witnessCurrentBitcoinBlockNumberForKey"
            }
            GovernanceCall::WitnessInitializeArbitrumVault { .. } => {
                "witnessInitializeArbitrumVault"
            }
            GovernanceCall::UpdateSafeMode(_) => "updateSafeMode",
        }
    }
}

/// Calls signed by ordinary accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuntimeCall {
    Governance(GovernanceCall),
    Transfer {
        dest: AccountId,
        amount: u128,
    },
    CreatePure {
        proxy_type: ProxyType,
        delay: u32,
        index: u16,
    },
    AddProxy {
        delegate: AccountId,
        proxy_type: ProxyType,
        delay: u32,
    },
    RemoveProxy {
        delegate: AccountId,
        proxy_type: ProxyType,
        delay: u32,
    },
    /// Dispatch `call` on behalf of `real`, which must have the signer as proxy
    Proxy {
        real: AccountId,
        call: Box<RuntimeCall>,
    },
    /// All-or-nothing batch
    BatchAll(Vec<RuntimeCall>),
}

impl RuntimeCall {
    pub fn kind(&self) -> CallKind {
        match self {
            RuntimeCall::Governance(_) => CallKind::Governance,
            RuntimeCall::Transfer { .. } => CallKind::Transfer,
            RuntimeCall::CreatePure { .. } => CallKind::CreatePure,
            RuntimeCall::AddProxy { .. } => CallKind::AddProxy,
            RuntimeCall::RemoveProxy { .. } => CallKind::RemoveProxy,
            RuntimeCall::Proxy { .. } => CallKind::Proxy,
            RuntimeCall::BatchAll(_) => CallKind::BatchAll,
        }
    }
}

/// Discriminant of [`RuntimeCall`], used for failure injection and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Governance,
    Transfer,
    CreatePure,
    AddProxy,
    RemoveProxy,
    Proxy,
    BatchAll,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Governance => "governance",
            CallKind::Transfer => "transfer",
            CallKind::CreatePure => "create_pure",
            CallKind::AddProxy => "add_proxy",
            CallKind::RemoveProxy => "remove_proxy",
            CallKind::Proxy => "proxy",
            CallKind::BatchAll => "batch_all",
        };
        f.write_str(name)
    }
}

/// Feature switches per pallet: pallet -> feature -> enabled
pub type AmberSettings = BTreeMap<String, BTreeMap<String, bool>>;

/// Runtime safe-mode setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafeModeUpdate {
    CodeGreen,
    CodeRed,
    CodeAmber(AmberSettings),
}

impl SafeModeUpdate {
    pub fn code(&self) -> &'static str {
        match self {
            SafeModeUpdate::CodeGreen => "CodeGreen",
            SafeModeUpdate::CodeRed => "CodeRed",
            SafeModeUpdate::CodeAmber(_) => "CodeAmber",
        }
    }
}
