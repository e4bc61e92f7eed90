use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_RETRY_MAX_ELAPSED_SECS, RETRY_INITIAL_INTERVAL_MS, RETRY_MAX_INTERVAL_SECS,
};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::state::{ExplorationState, RoundId};
use crate::store::{StateStore, SubmitOutcome, Transition};

pub mod buyback;
pub mod commit;
pub mod lifecycle;
pub mod reveal;

pub use buyback::*;
pub use commit::*;
pub use lifecycle::*;
pub use reveal::*;

/// Exponential backoff for transient submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget; once spent the step fails with `RetriesExhausted`.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_secs(RETRY_MAX_INTERVAL_SECS),
            max_elapsed: Duration::from_secs(DEFAULT_RETRY_MAX_ELAPSED_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Submits one transition, retrying transient failures.
///
/// A rejection saying the step already happened counts as success (`AlreadyApplied`),
/// so resubmitting after a lost response never applies a step twice.
/// Contract and protocol-violation rejections are returned at once.
pub async fn submit_with_retry(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    transition: Transition,
) -> OrchestratorResult<SubmitOutcome> {
    let key = transition.key();
    let attempts = AtomicU32::new(0);

    let result = retry_notify(
        policy.backoff(),
        || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            match store.submit(transition.clone()).await {
                Ok(receipt) => Ok(receipt.outcome),
                Err(OrchestratorError::Ledger(e)) if e.is_already_applied() => {
                    Ok(SubmitOutcome::AlreadyApplied)
                }
                Err(e) if e.is_retryable() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        },
        |err: OrchestratorError, wait: Duration| {
            warn!(
                block_id = key.round.block_id,
                exploration_index = key.round.exploration_index,
                step = key.step.as_str(),
                attempt = attempts.load(Ordering::Relaxed),
                ?wait,
                error = %err,
                "transient failure, retrying"
            );
        },
    )
    .await;

    let attempts = attempts.load(Ordering::Relaxed);
    match result {
        Ok(outcome) => {
            debug!(%key, attempt = attempts, ?outcome, "step confirmed");
            Ok(outcome)
        }
        Err(e) if e.is_retryable() => Err(OrchestratorError::RetriesExhausted {
            step: key.step.as_str(),
            attempts,
            last: e.to_string(),
        }),
        Err(e) => Err(e),
    }
}

/// Reads an exploration that must exist.
pub async fn load_exploration(
    store: &dyn StateStore,
    round: RoundId,
) -> OrchestratorResult<ExplorationState> {
    store
        .exploration(round)
        .await?
        .ok_or_else(|| OrchestratorError::Transient(format!("exploration {round} not visible yet")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SOL_BLOCK_ID;
    use crate::errors::RigItError;
    use crate::settlement::FeeSplit;
    use crate::store::{IdempotencyKey, MemoryLedger, Step};
    use crate::utils::TimingParams;
    use anchor_lang::prelude::Pubkey;

    fn ledger() -> MemoryLedger {
        let l = MemoryLedger::new(TimingParams::default(), FeeSplit::default());
        l.add_block(SOL_BLOCK_ID, Pubkey::new_unique(), 9, 1_000_000_000);
        l
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            max_elapsed: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let l = ledger();
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        l.fail_next_submissions(3);
        let outcome = submit_with_retry(&l, &fast(), Transition::StartExploration { round })
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_response_is_confirmed_not_reapplied() {
        let l = ledger();
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        l.drop_next_responses(1);
        let outcome = submit_with_retry(&l, &fast(), Transition::StartExploration { round })
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyApplied);
        assert_eq!(
            l.applied_count(IdempotencyKey { round, step: Step::Start }),
            1
        );
    }

    // real time: the backoff budget is measured on the wall clock
    #[tokio::test]
    async fn exhausted_budget_is_fatal() {
        let l = ledger();
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        l.fail_next_submissions(u32::MAX);
        let policy = RetryPolicy {
            max_elapsed: Duration::from_millis(200),
            ..fast()
        };
        let err = submit_with_retry(&l, &policy, Transition::StartExploration { round })
            .await
            .unwrap_err();
        match err {
            OrchestratorError::RetriesExhausted { step, attempts, .. } => {
                assert_eq!(step, "start");
                assert!(attempts > 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn contract_rejection_is_not_retried() {
        let l = ledger();
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        let err = submit_with_retry(&l, &fast(), Transition::AllocateBuyback { round })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Ledger(RigItError::ExplorationNotSettled)
        ));
    }
}
