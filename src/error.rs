//! Error types for the vault harness

use crate::chain::ChainId;
use thiserror::Error;

/// Main error type for the harness
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection to {chain} lost: {message}")]
    Connectivity { chain: ChainId, message: String },

    #[error("Extrinsic rejected by {chain}: {reason}")]
    SubmissionRejected { chain: ChainId, reason: String },

    #[error("Extrinsic included on {chain} but dispatch failed: {error}")]
    Dispatch { chain: ChainId, error: String },

    #[error("Failed to build extrinsic: {0}")]
    BuildFailed(String),

    #[error("Nonce error for {account} on {chain}: {message}")]
    Nonce {
        chain: ChainId,
        account: String,
        message: String,
    },

    #[error("Event {event} on {chain} is missing attribute {attribute}")]
    MissingEvidence {
        chain: ChainId,
        event: String,
        attribute: String,
    },

    #[error("Chain {0} not registered")]
    ChainNotFound(ChainId),

    #[error("EVM error on {chain}: {message}")]
    Evm { chain: ChainId, message: String },

    #[error("Bitcoin RPC error: {0}")]
    Bitcoin(String),

    #[error("Unsupported asset type: {0}")]
    UnsupportedAsset(String),

    #[error("The provided feature flag {0} is not supported!")]
    UnsupportedFeatureFlag(String),

    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: String, reason: String },

    #[error("Deferred value abandoned before it was settled")]
    Abandoned,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Operator supplied something the harness cannot act on
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            HarnessError::UnsupportedAsset(_)
                | HarnessError::UnsupportedFeatureFlag(_)
                | HarnessError::InvalidAmount { .. }
        )
    }

    /// Process exit status for an unrecovered error
    pub fn exit_code(&self) -> u8 {
        if self.is_malformed_input() {
            1
        } else {
            255
        }
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
