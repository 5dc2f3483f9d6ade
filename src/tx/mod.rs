//! Extrinsic construction and submission with nonce management

mod calls;
mod nonce;
mod submitter;

pub use calls::{AmberSettings, CallKind, GovernanceCall, ProxyType, RuntimeCall, SafeModeUpdate};
pub use nonce::NonceManager;
pub use submitter::{ExtrinsicSubmitter, GovernanceSubmitter, SubmissionResult};
