//! Extrinsic submission with inclusion tracking

use super::calls::{GovernanceCall, RuntimeCall};
use super::nonce::NonceManager;
use crate::chain::{AccountId, ChainId, Inclusion, Keypair, SubstrateApi, TxStatus};
use crate::config::InclusionPolicy;
use crate::error::{HarnessError, HarnessResult};
use crate::events::ChainEvent;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a submitted extrinsic was included and the events it emitted
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResult {
    pub block_number: u64,
    pub extrinsic_index: u32,
    pub events: Vec<ChainEvent>,
}

impl SubmissionResult {
    pub fn find_event(&self, name: &str) -> Option<&ChainEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Event the extrinsic must have emitted to be useful to the caller
    pub fn require_event(&self, chain: ChainId, name: &str) -> HarnessResult<&ChainEvent> {
        self.find_event(name).ok_or_else(|| HarnessError::MissingEvidence {
            chain,
            event: name.to_string(),
            attribute: "<event>".to_string(),
        })
    }
}

/// Signs and submits calls from one account, one at a time
pub struct ExtrinsicSubmitter {
    api: Arc<dyn SubstrateApi>,
    signer: Keypair,
    account: AccountId,
    nonces: Arc<NonceManager>,
    policy: InclusionPolicy,
    /// Held from nonce reservation until the pool has the extrinsic
    submit_lock: Mutex<()>,
}

impl ExtrinsicSubmitter {
    pub fn new(
        api: Arc<dyn SubstrateApi>,
        signer: Keypair,
        nonces: Arc<NonceManager>,
        policy: InclusionPolicy,
    ) -> Self {
        let account = api.account_id(&signer);
        Self {
            api,
            signer,
            account,
            nonces,
            policy,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.api.chain()
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn api(&self) -> &dyn SubstrateApi {
        self.api.as_ref()
    }

    /// Submit `call` and wait until it is included according to the policy.
    ///
    /// Rejections are returned as errors and never retried.
    pub async fn submit_and_wait(&self, call: RuntimeCall) -> HarnessResult<SubmissionResult> {
        let chain = self.chain();
        let kind = call.kind().to_string();
        let started = Instant::now();

        let (mut statuses, nonce) = {
            let _guard = self.submit_lock.lock().await;
            let nonce = self.nonces.reserve(self.api.as_ref(), &self.account).await?;

            match self.api.submit_and_watch(&self.signer, nonce, call).await {
                Ok(statuses) => (statuses, nonce),
                Err(e) => {
                    self.nonces.release(&self.account, nonce).await;
                    crate::metrics::record_extrinsic_rejected(chain, &kind);
                    return Err(e);
                }
            }
        };

        crate::metrics::record_extrinsic_submitted(chain, &kind);
        debug!("Submitted {} from {} on {} with nonce {}", kind, self.account, chain, nonce);

        while let Some(status) = statuses.next().await {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    self.nonces.resync(&self.account).await;
                    return Err(e);
                }
            };

            match status {
                TxStatus::Ready | TxStatus::Broadcast => {
                    debug!("{} with nonce {} is {:?}", kind, nonce, status);
                }
                TxStatus::InBlock(inclusion) if self.policy == InclusionPolicy::InBlock => {
                    return self.included(&kind, nonce, inclusion, started).await;
                }
                TxStatus::InBlock(inclusion) => {
                    debug!(
                        "{} in block {}, waiting for finality",
                        kind, inclusion.block_number
                    );
                }
                TxStatus::Finalized(inclusion) => {
                    return self.included(&kind, nonce, inclusion, started).await;
                }
                TxStatus::Invalid(reason) | TxStatus::Dropped(reason) => {
                    warn!("{} with nonce {} rejected on {}: {}", kind, nonce, chain, reason);
                    self.nonces.resync(&self.account).await;
                    crate::metrics::record_extrinsic_rejected(chain, &kind);
                    return Err(HarnessError::SubmissionRejected { chain, reason });
                }
            }
        }

        self.nonces.resync(&self.account).await;
        Err(HarnessError::Connectivity {
            chain,
            message: format!("status stream for {} ended before inclusion", kind),
        })
    }

    async fn included(
        &self,
        kind: &str,
        nonce: u64,
        inclusion: Inclusion,
        started: Instant,
    ) -> HarnessResult<SubmissionResult> {
        let chain = self.chain();
        self.nonces.confirm(&self.account, nonce).await;
        crate::metrics::record_inclusion_latency(chain, started.elapsed().as_secs_f64());

        if let Some(error) = inclusion.dispatch_error {
            crate::metrics::record_extrinsic_rejected(chain, kind);
            return Err(HarnessError::Dispatch { chain, error });
        }

        debug!(
            "{} included on {} at {}-{}",
            kind, chain, inclusion.block_number, inclusion.extrinsic_index
        );
        Ok(SubmissionResult {
            block_number: inclusion.block_number,
            extrinsic_index: inclusion.extrinsic_index,
            events: inclusion.events,
        })
    }
}

/// Submits privileged calls from the single governance authority
pub struct GovernanceSubmitter {
    inner: ExtrinsicSubmitter,
}

impl GovernanceSubmitter {
    pub fn new(inner: ExtrinsicSubmitter) -> Self {
        Self { inner }
    }

    pub fn chain(&self) -> ChainId {
        self.inner.chain()
    }

    /// Build a governance call against the live api and submit it.
    ///
    /// A failing `build` returns before any nonce is taken or subscription
    /// opened.
    pub async fn submit<F>(&self, build: F) -> HarnessResult<SubmissionResult>
    where
        F: FnOnce(&dyn SubstrateApi) -> HarnessResult<GovernanceCall>,
    {
        let call = build(self.inner.api()).map_err(|e| match e {
            HarnessError::BuildFailed(_) => e,
            other => HarnessError::BuildFailed(other.to_string()),
        })?;

        info!("Submitting governance extrinsic {}", call.name());
        self.inner.submit_and_wait(RuntimeCall::Governance(call)).await
    }

    /// Submit an already built call
    pub async fn submit_call(&self, call: GovernanceCall) -> HarnessResult<SubmissionResult> {
        self.submit(move |_| Ok(call)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockSubstrateApi;
    use futures::stream;
    use std::sync::Mutex as StdMutex;

    fn inclusion(block_number: u64, extrinsic_index: u32) -> Inclusion {
        Inclusion {
            block_number,
            extrinsic_index,
            events: Vec::new(),
            dispatch_error: None,
        }
    }

    fn base_api(chain_nonce: u64) -> MockSubstrateApi {
        let mut api = MockSubstrateApi::new();
        api.expect_chain().return_const(ChainId::StateChain);
        api.expect_account_id()
            .return_const(AccountId::new("0xgovernance"));
        api.expect_account_nonce()
            .returning(move |_| Ok(chain_nonce));
        api
    }

    fn submitter(api: MockSubstrateApi, policy: InclusionPolicy) -> ExtrinsicSubmitter {
        ExtrinsicSubmitter::new(
            Arc::new(api),
            Keypair::from_uri("//Snowwhite"),
            Arc::new(NonceManager::new(ChainId::StateChain)),
            policy,
        )
    }

    #[tokio::test]
    async fn resolves_with_inclusion_location() {
        let mut api = base_api(0);
        api.expect_submit_and_watch().times(1).returning(|_, _, _| {
            Ok(stream::iter(vec![
                Ok(TxStatus::Ready),
                Ok(TxStatus::InBlock(inclusion(12, 3))),
            ])
            .boxed())
        });

        let result = submitter(api, InclusionPolicy::InBlock)
            .submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await
            .unwrap();
        assert_eq!((result.block_number, result.extrinsic_index), (12, 3));
    }

    #[tokio::test]
    async fn finalized_policy_waits_past_in_block() {
        let mut api = base_api(0);
        api.expect_submit_and_watch().returning(|_, _, _| {
            Ok(stream::iter(vec![
                Ok(TxStatus::InBlock(inclusion(12, 0))),
                Ok(TxStatus::Finalized(inclusion(13, 1))),
            ])
            .boxed())
        });

        let result = submitter(api, InclusionPolicy::Finalized)
            .submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await
            .unwrap();
        assert_eq!(result.block_number, 13);
    }

    #[tokio::test]
    async fn invalid_extrinsic_is_rejected_not_retried() {
        let mut api = base_api(4);
        api.expect_submit_and_watch().times(1).returning(|_, _, _| {
            Ok(stream::iter(vec![Ok(TxStatus::Invalid("Stale".to_string()))]).boxed())
        });

        let result = submitter(api, InclusionPolicy::InBlock)
            .submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await;
        assert_eq!(
            result,
            Err(HarnessError::SubmissionRejected {
                chain: ChainId::StateChain,
                reason: "Stale".to_string()
            })
        );
    }

    #[tokio::test]
    async fn failed_dispatch_is_an_error() {
        let mut api = base_api(0);
        api.expect_submit_and_watch().returning(|_, _, _| {
            let mut included = inclusion(5, 1);
            included.dispatch_error = Some("governance.NotMember".to_string());
            Ok(stream::iter(vec![Ok(TxStatus::InBlock(included))]).boxed())
        });

        let result = submitter(api, InclusionPolicy::InBlock)
            .submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await;
        assert!(matches!(result, Err(HarnessError::Dispatch { .. })));
    }

    #[tokio::test]
    async fn status_stream_ending_early_is_a_connectivity_error() {
        let mut api = base_api(0);
        api.expect_submit_and_watch()
            .returning(|_, _, _| Ok(stream::iter(vec![Ok(TxStatus::Ready)]).boxed()));

        let result = submitter(api, InclusionPolicy::InBlock)
            .submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation))
            .await;
        assert!(matches!(result, Err(HarnessError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn concurrent_submissions_use_distinct_nonces() {
        let used = Arc::new(StdMutex::new(Vec::new()));
        let recorded = used.clone();

        // Chain nonce stays at 7 because nothing is included until both are in
        let mut api = base_api(7);
        api.expect_submit_and_watch()
            .times(2)
            .returning(move |_, nonce, _| {
                recorded.lock().unwrap().push(nonce);
                Ok(stream::iter(vec![Ok(TxStatus::InBlock(inclusion(1, nonce as u32)))]).boxed())
            });

        let submitter = submitter(api, InclusionPolicy::InBlock);
        let (a, b) = tokio::join!(
            submitter.submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation)),
            submitter.submit_and_wait(RuntimeCall::Governance(GovernanceCall::ForceRotation)),
        );
        a.unwrap();
        b.unwrap();

        let mut nonces = used.lock().unwrap().clone();
        nonces.sort();
        assert_eq!(nonces, vec![7, 8]);
    }

    #[tokio::test]
    async fn failing_build_never_touches_the_chain() {
        let mut api = MockSubstrateApi::new();
        api.expect_chain().return_const(ChainId::StateChain);
        api.expect_account_id()
            .return_const(AccountId::new("0xgovernance"));
        api.expect_account_nonce().never();
        api.expect_submit_and_watch().never();

        let governance = GovernanceSubmitter::new(submitter(api, InclusionPolicy::InBlock));
        let result = governance
            .submit(|_| Err(HarnessError::Internal("no such pallet".to_string())))
            .await;

        match result {
            Err(HarnessError::BuildFailed(message)) => assert!(message.contains("no such pallet")),
            other => panic!("expected build failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_error_releases_the_nonce() {
        let attempts = Arc::new(StdMutex::new(Vec::new()));
        let recorded = attempts.clone();
        let mut api = base_api(2);
        let mut first = true;
        api.expect_submit_and_watch()
            .times(2)
            .returning(move |_, nonce, _| {
                recorded.lock().unwrap().push(nonce);
                if std::mem::take(&mut first) {
                    Err(HarnessError::SubmissionRejected {
                        chain: ChainId::StateChain,
                        reason: "pool full".to_string(),
                    })
                } else {
                    Ok(stream::iter(vec![Ok(TxStatus::InBlock(inclusion(3, 0)))]).boxed())
                }
            });

        let submitter = submitter(api, InclusionPolicy::InBlock);
        let call = RuntimeCall::Governance(GovernanceCall::ForceRotation);
        assert!(submitter.submit_and_wait(call.clone()).await.is_err());
        submitter.submit_and_wait(call).await.unwrap();

        assert_eq!(*attempts.lock().unwrap(), vec![2, 2]);
    }
}
