//! Runtime safe-mode switching

use crate::chain::{ChainId, EventObserver};
use crate::error::{HarnessError, HarnessResult};
use crate::events::{names, ChainEvent, EventFilter};
use crate::tx::{AmberSettings, GovernanceCall, GovernanceSubmitter, SafeModeUpdate};

use std::collections::BTreeMap;
use tracing::{info, warn};

/// Pallets that accept amber feature flags
pub const AMBER_PALLETS: [&str; 8] = [
    "emissions",
    "funding",
    "swapping",
    "liquidityProvider",
    "validator",
    "reputation",
    "pools",
    "vault",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SafeModeLevel {
    Green,
    Red,
    Amber,
}

/// Turn `<pallet>_<feature>` flags into amber settings. Every known pallet
/// is present in the result, enabled features are set to `true`.
///
/// Only the second `_`-separated segment names the feature; anything after
/// a further `_` is ignored.
pub fn parse_amber_flags<S: AsRef<str>>(flags: &[S]) -> HarnessResult<AmberSettings> {
    let mut settings: AmberSettings = AMBER_PALLETS
        .iter()
        .map(|pallet| (pallet.to_string(), BTreeMap::new()))
        .collect();

    for flag in flags {
        let flag = flag.as_ref();
        let mut segments = flag.split('_');
        let pallet = segments.next().unwrap_or_default();
        let feature = segments
            .next()
            .filter(|feature| !feature.is_empty())
            .ok_or_else(|| HarnessError::UnsupportedFeatureFlag(flag.to_string()))?;

        let features = settings
            .get_mut(pallet)
            .ok_or_else(|| HarnessError::UnsupportedFeatureFlag(flag.to_string()))?;
        features.insert(feature.to_string(), true);
    }

    Ok(settings)
}

pub fn build_update<S: AsRef<str>>(level: SafeModeLevel, flags: &[S]) -> HarnessResult<SafeModeUpdate> {
    match level {
        SafeModeLevel::Amber => Ok(SafeModeUpdate::CodeAmber(parse_amber_flags(flags)?)),
        other => {
            if !flags.is_empty() {
                warn!("Feature flags are ignored for {:?} safe mode", other);
            }
            Ok(if other == SafeModeLevel::Green {
                SafeModeUpdate::CodeGreen
            } else {
                SafeModeUpdate::CodeRed
            })
        }
    }
}

/// Submit the update through governance and wait for the runtime to apply it
pub async fn set_safe_mode(
    observer: &EventObserver,
    governance: &GovernanceSubmitter,
    update: SafeModeUpdate,
) -> HarnessResult<ChainEvent> {
    let applied = observer.observe(ChainId::StateChain, EventFilter::new(names::SAFE_MODE_UPDATED))?;

    info!("Setting safe mode to {}", update.code());
    governance
        .submit_call(GovernanceCall::UpdateSafeMode(update))
        .await?;

    applied.await
}
