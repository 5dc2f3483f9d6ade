//! Chain event types and filters
//!
//! Events are named `pallet:Event` (for example
//! `polkadotVault:AwaitingGovernanceActivation`) and carry a typed attribute
//! map. Filters match on the name plus an exact-match subset of attributes.

use crate::chain::ChainId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known event names used by the harness
pub mod names {
    pub const NEW_EPOCH: &str = "validator:NewEpoch";
    pub const PURE_CREATED: &str = "proxy:PureCreated";
    pub const PROXY_ADDED: &str = "proxy:ProxyAdded";
    pub const PROXY_REMOVED: &str = "proxy:ProxyRemoved";
    pub const TRANSFER: &str = "balances:Transfer";
    pub const SAFE_MODE_UPDATED: &str = "environment:RuntimeSafeModeUpdated";
    pub const PROPOSAL_EXECUTED: &str = "governance:Executed";
    pub const AWAITING_GOVERNANCE_ACTIVATION: &str = "AwaitingGovernanceActivation";
    pub const CHAIN_INITIALIZED: &str = "ChainInitialized";
    pub const VAULT_ACTIVATION_COMPLETED: &str = "VaultActivationCompleted";
}

/// Primitive attribute value carried by an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Bool(bool),
    U64(u64),
    U128(u128),
    Str(String),
    Bytes(Vec<u8>),
}

impl EventValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            EventValue::U64(v) => Some(*v),
            EventValue::U128(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            EventValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Bool(v) => write!(f, "{}", v),
            EventValue::U64(v) => write!(f, "{}", v),
            EventValue::U128(v) => write!(f, "{}", v),
            EventValue::Str(v) => write!(f, "{}", v),
            EventValue::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue::Bool(v)
    }
}

impl From<u64> for EventValue {
    fn from(v: u64) -> Self {
        EventValue::U64(v)
    }
}

impl From<u32> for EventValue {
    fn from(v: u32) -> Self {
        EventValue::U64(v as u64)
    }
}

impl From<u128> for EventValue {
    fn from(v: u128) -> Self {
        EventValue::U128(v)
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        EventValue::Str(v.to_string())
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        EventValue::Str(v)
    }
}

impl From<Vec<u8>> for EventValue {
    fn from(v: Vec<u8>) -> Self {
        EventValue::Bytes(v)
    }
}

impl From<&crate::chain::AccountId> for EventValue {
    fn from(account: &crate::chain::AccountId) -> Self {
        EventValue::Str(account.to_string())
    }
}

/// An event observed in a finalized block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: ChainId,
    pub block_number: u64,
    /// None for events emitted outside an extrinsic (block initialisation)
    pub extrinsic_index: Option<u32>,
    pub name: String,
    pub attributes: BTreeMap<String, EventValue>,
}

impl ChainEvent {
    pub fn attribute(&self, key: &str) -> Option<&EventValue> {
        self.attributes.get(key)
    }

    /// Look up an attribute the caller cannot proceed without
    pub fn require(&self, key: &str) -> crate::error::HarnessResult<&EventValue> {
        self.attributes
            .get(key)
            .ok_or_else(|| crate::error::HarnessError::MissingEvidence {
                chain: self.chain,
                event: self.name.clone(),
                attribute: key.to_string(),
            })
    }
}

/// Selects which events satisfy a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub name: String,
    pub predicate: BTreeMap<String, EventValue>,
}

impl EventFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: BTreeMap::new(),
        }
    }

    /// Require an attribute to equal `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.predicate.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &ChainEvent) -> bool {
        event.name == self.name
            && self
                .predicate
                .iter()
                .all(|(key, expected)| event.attributes.get(key) == Some(expected))
    }

    /// First matching event in emission order
    pub fn first_match<'a>(&self, events: &'a [ChainEvent]) -> Option<&'a ChainEvent> {
        events.iter().find(|event| self.matches(event))
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.predicate.is_empty() {
            let parts: Vec<String> = self
                .predicate
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, " {{{}}}", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Vault pallet name for a chain, e.g. `bitcoinVault`
pub fn vault_pallet(chain: ChainId) -> String {
    format!("{}Vault", chain.pallet_prefix())
}

/// `<chain>Vault:<event>`
pub fn vault_event(chain: ChainId, event: &str) -> String {
    format!("{}:{}", vault_pallet(chain), event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, attrs: &[(&str, EventValue)]) -> ChainEvent {
        ChainEvent {
            chain: ChainId::StateChain,
            block_number: 10,
            extrinsic_index: Some(1),
            name: name.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn name_only_filter_matches_any_attributes() {
        let filter = EventFilter::new(names::NEW_EPOCH);
        assert!(filter.matches(&event(names::NEW_EPOCH, &[("epochIndex", 2u64.into())])));
        assert!(!filter.matches(&event(names::PROXY_ADDED, &[])));
    }

    #[test]
    fn predicate_is_an_exact_subset_match() {
        let filter = EventFilter::new(names::PROXY_ADDED)
            .with("delegator", "0xvault")
            .with("delay", 0u32);

        let hit = event(
            names::PROXY_ADDED,
            &[
                ("delegator", "0xvault".into()),
                ("delegatee", "0xkey".into()),
                ("delay", 0u64.into()),
            ],
        );
        assert!(filter.matches(&hit));

        let wrong_value = event(
            names::PROXY_ADDED,
            &[("delegator", "0xother".into()), ("delay", 0u64.into())],
        );
        assert!(!filter.matches(&wrong_value));

        let missing = event(names::PROXY_ADDED, &[("delegator", "0xvault".into())]);
        assert!(!filter.matches(&missing));
    }

    #[test]
    fn values_of_different_types_never_match() {
        let filter = EventFilter::new("x:Y").with("n", 1u64);
        assert!(!filter.matches(&event("x:Y", &[("n", EventValue::U128(1))])));
        assert!(!filter.matches(&event("x:Y", &[("n", "1".into())])));
    }

    #[test]
    fn first_match_respects_emission_order() {
        let events = vec![
            event(names::TRANSFER, &[("to", "a".into())]),
            event(names::TRANSFER, &[("to", "b".into())]),
            event(names::TRANSFER, &[("to", "b".into()), ("n", 2u64.into())]),
        ];
        let filter = EventFilter::new(names::TRANSFER).with("to", "b");
        let found = filter.first_match(&events).unwrap();
        assert!(found.attribute("n").is_none());
    }

    #[test]
    fn vault_event_names() {
        assert_eq!(
            vault_event(ChainId::Polkadot, names::AWAITING_GOVERNANCE_ACTIVATION),
            "polkadotVault:AwaitingGovernanceActivation"
        );
        assert_eq!(vault_pallet(ChainId::Arbitrum), "arbitrumVault");
    }
}
