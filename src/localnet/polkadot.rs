//! Relay chain runtime: balances, pure proxies, proxy dispatch, batches

use super::chain::{ExtrinsicContext, Runtime};
use super::RuntimeEvent;
use crate::chain::{AccountId, ChainId};
use crate::events::names;
use crate::tx::{CallKind, ProxyType, RuntimeCall};

use sha3::{Digest, Keccak256};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDefinition {
    pub delegate: AccountId,
    pub proxy_type: ProxyType,
    pub delay: u32,
}

#[derive(Debug, Clone, Default)]
struct Ledger {
    balances: HashMap<AccountId, u128>,
    proxies: HashMap<AccountId, Vec<ProxyDefinition>>,
}

#[derive(Debug, Default)]
pub struct PolkadotRuntime {
    ledger: Ledger,
    fail_on: Option<CallKind>,
}

/// Address of the pure proxy `who` creates at `at` with `index`
pub fn pure_account(who: &AccountId, at: ExtrinsicContext, index: u16) -> AccountId {
    let mut hasher = Keccak256::new();
    hasher.update(b"modlpy/proxy____");
    hasher.update(who.as_str().as_bytes());
    hasher.update(at.block_number.to_le_bytes());
    hasher.update(at.extrinsic_index.to_le_bytes());
    hasher.update(index.to_le_bytes());
    AccountId::from_public_key(&hasher.finalize())
}

fn proxy_type_name(proxy_type: ProxyType) -> String {
    format!("{:?}", proxy_type)
}

impl PolkadotRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endow(&mut self, account: AccountId, amount: u128) {
        *self.ledger.balances.entry(account).or_default() += amount;
    }

    pub fn balance(&self, account: &AccountId) -> u128 {
        self.ledger.balances.get(account).copied().unwrap_or(0)
    }

    pub fn proxies(&self, account: &AccountId) -> Vec<ProxyDefinition> {
        self.ledger.proxies.get(account).cloned().unwrap_or_default()
    }

    /// Make every call of `kind` fail at dispatch, wherever it is nested
    pub fn inject_failure(&mut self, kind: Option<CallKind>) {
        self.fail_on = kind;
    }

    fn apply(
        &mut self,
        origin: &AccountId,
        call: &RuntimeCall,
        at: ExtrinsicContext,
        events: &mut Vec<RuntimeEvent>,
    ) -> Result<(), String> {
        if self.fail_on == Some(call.kind()) {
            return Err(format!("injected failure in {}", call.kind()));
        }

        match call {
            RuntimeCall::Transfer { dest, amount } => {
                let from = self.balance(origin);
                if from < *amount {
                    return Err("balances.InsufficientBalance".to_string());
                }
                self.ledger.balances.insert(origin.clone(), from - amount);
                *self.ledger.balances.entry(dest.clone()).or_default() += amount;
                events.push(
                    RuntimeEvent::new(names::TRANSFER)
                        .with("from", origin)
                        .with("to", dest)
                        .with("amount", *amount),
                );
            }
            RuntimeCall::CreatePure {
                proxy_type,
                delay,
                index,
            } => {
                let pure = pure_account(origin, at, *index);
                if self.ledger.proxies.contains_key(&pure) {
                    return Err("proxy.Duplicate".to_string());
                }
                self.ledger.proxies.insert(
                    pure.clone(),
                    vec![ProxyDefinition {
                        delegate: origin.clone(),
                        proxy_type: *proxy_type,
                        delay: *delay,
                    }],
                );
                events.push(
                    RuntimeEvent::new(names::PURE_CREATED)
                        .with("pure", &pure)
                        .with("who", origin)
                        .with("proxyType", proxy_type_name(*proxy_type))
                        .with("disambiguationIndex", *index as u64),
                );
            }
            RuntimeCall::AddProxy {
                delegate,
                proxy_type,
                delay,
            } => {
                let definition = ProxyDefinition {
                    delegate: delegate.clone(),
                    proxy_type: *proxy_type,
                    delay: *delay,
                };
                let proxies = self.ledger.proxies.entry(origin.clone()).or_default();
                if proxies.contains(&definition) {
                    return Err("proxy.Duplicate".to_string());
                }
                proxies.push(definition);
                events.push(
                    RuntimeEvent::new(names::PROXY_ADDED)
                        .with("delegator", origin)
                        .with("delegatee", delegate)
                        .with("proxyType", proxy_type_name(*proxy_type))
                        .with("delay", *delay),
                );
            }
            RuntimeCall::RemoveProxy {
                delegate,
                proxy_type,
                delay,
            } => {
                let proxies = self.ledger.proxies.entry(origin.clone()).or_default();
                let position = proxies
                    .iter()
                    .position(|p| &p.delegate == delegate && p.proxy_type == *proxy_type && p.delay == *delay)
                    .ok_or_else(|| "proxy.NotFound".to_string())?;
                proxies.remove(position);
                events.push(
                    RuntimeEvent::new(names::PROXY_REMOVED)
                        .with("delegator", origin)
                        .with("delegatee", delegate)
                        .with("proxyType", proxy_type_name(*proxy_type))
                        .with("delay", *delay),
                );
            }
            RuntimeCall::Proxy { real, call } => {
                let allowed = self
                    .proxies(real)
                    .iter()
                    .any(|p| &p.delegate == origin && p.proxy_type == ProxyType::Any);
                if !allowed {
                    return Err("proxy.NotProxy".to_string());
                }
                // Inner failures fail the whole extrinsic here, unlike a real
                // relay chain which reports them in ProxyExecuted
                self.apply(real, call, at, events)?;
                events.push(RuntimeEvent::new("proxy:ProxyExecuted").with("result", "Ok"));
            }
            RuntimeCall::BatchAll(calls) => {
                let snapshot = self.ledger.clone();
                let mark = events.len();
                for (i, call) in calls.iter().enumerate() {
                    if let Err(error) = self.apply(origin, call, at, events) {
                        self.ledger = snapshot;
                        events.truncate(mark);
                        return Err(format!("batch item {}: {}", i, error));
                    }
                }
                events.push(RuntimeEvent::new("utility:BatchCompleted"));
            }
            RuntimeCall::Governance(call) => {
                return Err(format!("{} is not available on polkadot", call.name()));
            }
        }
        Ok(())
    }
}

impl Runtime for PolkadotRuntime {
    fn chain(&self) -> ChainId {
        ChainId::Polkadot
    }

    fn dispatch(
        &mut self,
        origin: &AccountId,
        call: &RuntimeCall,
        at: ExtrinsicContext,
    ) -> Result<Vec<RuntimeEvent>, String> {
        let snapshot = self.ledger.clone();
        let mut events = Vec::new();
        match self.apply(origin, call, at, &mut events) {
            Ok(()) => Ok(events),
            Err(error) => {
                self.ledger = snapshot;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AT: ExtrinsicContext = ExtrinsicContext {
        block_number: 1,
        extrinsic_index: 0,
    };

    fn alice() -> AccountId {
        AccountId::new("0xalice")
    }

    fn funded() -> PolkadotRuntime {
        let mut runtime = PolkadotRuntime::new();
        runtime.endow(alice(), 1_000);
        runtime
    }

    fn event_names(events: &[RuntimeEvent]) -> Vec<&str> {
        events.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn pure_proxy_is_controlled_by_its_creator() {
        let mut runtime = funded();
        let events = runtime
            .dispatch(
                &alice(),
                &RuntimeCall::CreatePure {
                    proxy_type: ProxyType::Any,
                    delay: 0,
                    index: 0,
                },
                AT,
            )
            .unwrap();

        let pure = pure_account(&alice(), AT, 0);
        assert_eq!(events[0].name, names::PURE_CREATED);
        assert_eq!(runtime.proxies(&pure)[0].delegate, alice());

        runtime
            .dispatch(
                &alice(),
                &RuntimeCall::Proxy {
                    real: pure.clone(),
                    call: Box::new(RuntimeCall::AddProxy {
                        delegate: AccountId::new("0xkey"),
                        proxy_type: ProxyType::Any,
                        delay: 0,
                    }),
                },
                AT,
            )
            .unwrap();
        assert_eq!(runtime.proxies(&pure).len(), 2);
    }

    #[test]
    fn strangers_cannot_proxy() {
        let mut runtime = funded();
        let result = runtime.dispatch(
            &AccountId::new("0xmallory"),
            &RuntimeCall::Proxy {
                real: alice(),
                call: Box::new(RuntimeCall::Transfer {
                    dest: AccountId::new("0xmallory"),
                    amount: 10,
                }),
            },
            AT,
        );
        assert_eq!(result, Err("proxy.NotProxy".to_string()));
    }

    #[test]
    fn batch_failure_rolls_back_earlier_items() {
        let mut runtime = funded();
        let batch = RuntimeCall::BatchAll(vec![
            RuntimeCall::Transfer {
                dest: AccountId::new("0xvault"),
                amount: 100,
            },
            RuntimeCall::Transfer {
                dest: AccountId::new("0xvault"),
                amount: 5_000,
            },
        ]);

        let result = runtime.dispatch(&alice(), &batch, AT);
        assert!(result.unwrap_err().contains("InsufficientBalance"));
        assert_eq!(runtime.balance(&alice()), 1_000);
        assert_eq!(runtime.balance(&AccountId::new("0xvault")), 0);
    }

    #[test]
    fn successful_batch_emits_every_effect() {
        let mut runtime = funded();
        let batch = RuntimeCall::BatchAll(vec![
            RuntimeCall::Transfer {
                dest: AccountId::new("0xvault"),
                amount: 100,
            },
            RuntimeCall::AddProxy {
                delegate: AccountId::new("0xkey"),
                proxy_type: ProxyType::Any,
                delay: 0,
            },
        ]);

        let events = runtime.dispatch(&alice(), &batch, AT).unwrap();
        assert_eq!(
            event_names(&events),
            vec![names::TRANSFER, names::PROXY_ADDED, "utility:BatchCompleted"]
        );
    }

    #[test]
    fn removing_an_unknown_proxy_fails() {
        let mut runtime = funded();
        let result = runtime.dispatch(
            &alice(),
            &RuntimeCall::RemoveProxy {
                delegate: AccountId::new("0xnobody"),
                proxy_type: ProxyType::Any,
                delay: 0,
            },
            AT,
        );
        assert_eq!(result, Err("proxy.NotFound".to_string()));
    }
}
