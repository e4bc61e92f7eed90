use tracing::info;

use crate::errors::{OrchestratorResult, RigItError};
use crate::instructions::{load_exploration, submit_with_retry, RetryPolicy};
use crate::state::{ExplorationStatus, RoundId};
use crate::store::{StateStore, SubmitOutcome, Transition};

/// Records the burn/LP/team/ecosystem budget of a settled exploration. At most once.
pub async fn allocate_buyback(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    round: RoundId,
) -> OrchestratorResult<SubmitOutcome> {
    let e = load_exploration(store, round).await?;
    if e.buyback_allocated {
        return Ok(SubmitOutcome::AlreadyApplied);
    }
    if e.status != ExplorationStatus::Settled {
        return Err(RigItError::ExplorationNotSettled.into());
    }

    let outcome = submit_with_retry(store, policy, Transition::AllocateBuyback { round }).await?;
    info!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "allocate-buyback",
        remaining_pool = e.remaining_pool,
        ?outcome,
        "buyback budget allocated"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SOL_BLOCK_ID;
    use crate::errors::OrchestratorError;
    use crate::secrets::CommitSecret;
    use crate::settlement::FeeSplit;
    use crate::store::MemoryLedger;
    use crate::utils::TimingParams;
    use anchor_lang::prelude::Pubkey;

    #[tokio::test(start_paused = true)]
    async fn allocates_only_settled_and_only_once() {
        let l = MemoryLedger::new(TimingParams::default(), FeeSplit::default());
        l.add_block(SOL_BLOCK_ID, Pubkey::new_unique(), 9, 1_000_000_000);
        let policy = RetryPolicy::default();
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        l.submit(Transition::StartExploration { round }).await.unwrap();
        l.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 2, 2_000_000_000, 0, 1)
            .unwrap();

        assert!(matches!(
            allocate_buyback(&l, &policy, round).await,
            Err(OrchestratorError::Ledger(RigItError::ExplorationNotSettled))
        ));

        l.warp(l.timing().active_duration_secs());
        let secret = CommitSecret::generate();
        let target = l.current_slot().await.unwrap() + 20;
        l.submit(Transition::CommitRandomness {
            round,
            target_slot: target,
            commit_hash: secret.commit_hash(target),
        })
        .await
        .unwrap();
        l.warp(10);
        l.submit(Transition::RevealRandomness { round, secret })
            .await
            .unwrap();

        assert_eq!(
            allocate_buyback(&l, &policy, round).await.unwrap(),
            SubmitOutcome::Applied
        );
        assert_eq!(
            allocate_buyback(&l, &policy, round).await.unwrap(),
            SubmitOutcome::AlreadyApplied
        );
    }
}
