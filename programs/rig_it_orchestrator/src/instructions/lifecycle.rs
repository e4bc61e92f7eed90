use tracing::{info, warn};

use crate::errors::{OrchestratorResult, RigItError};
use crate::instructions::{load_exploration, submit_with_retry, RetryPolicy};
use crate::state::{BlockState, ExplorationStatus, RoundId};
use crate::store::{StateStore, SubmitOutcome, Transition};

/// Opens the block's next exploration. The index is fixed from the snapshot, so a
/// resubmission after a lost response lands on the same round and reports `AlreadyApplied`.
pub async fn start_exploration(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    block: &BlockState,
) -> OrchestratorResult<(RoundId, SubmitOutcome)> {
    if block.paused {
        return Err(RigItError::BlockPaused.into());
    }
    let round = RoundId::new(block.block_id, block.current_exploration_index);
    let outcome = submit_with_retry(store, policy, Transition::StartExploration { round }).await?;

    info!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "start",
        ?outcome,
        "exploration started"
    );
    Ok((round, outcome))
}

/// Threshold not met: the exploration ends without a draw and its pool waits for carry-forward.
pub async fn roll_over(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    round: RoundId,
) -> OrchestratorResult<SubmitOutcome> {
    let e = load_exploration(store, round).await?;
    if e.status == ExplorationStatus::RolledOver {
        return Ok(SubmitOutcome::AlreadyApplied);
    }

    let outcome = submit_with_retry(store, policy, Transition::RollOver { round }).await?;
    warn!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "rollover",
        total_deposits = e.total_deposits,
        reason = "threshold not met",
        "exploration rolled over"
    );
    Ok(outcome)
}

/// Moves a rolled-over exploration's pool into `to_index`. At most once per source exploration.
pub async fn carry_forward(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    from: RoundId,
    to_index: u64,
) -> OrchestratorResult<SubmitOutcome> {
    let e = load_exploration(store, from).await?;
    if e.carry_forward_done {
        return Ok(SubmitOutcome::AlreadyApplied);
    }
    if e.status != ExplorationStatus::RolledOver {
        return Err(RigItError::InvalidExplorationStatus.into());
    }

    let outcome =
        submit_with_retry(store, policy, Transition::CarryForward { from, to_index }).await?;
    info!(
        block_id = from.block_id,
        exploration_index = from.exploration_index,
        step = "carry-forward",
        to_index,
        amount = e.total_deposits,
        ?outcome,
        "pool carried forward"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SOL_BLOCK_ID;
    use crate::settlement::FeeSplit;
    use crate::store::MemoryLedger;
    use crate::utils::TimingParams;
    use anchor_lang::prelude::Pubkey;

    fn ledger() -> MemoryLedger {
        let l = MemoryLedger::new(TimingParams::default(), FeeSplit::default());
        l.add_block(SOL_BLOCK_ID, Pubkey::new_unique(), 9, 1_000_000_000);
        l
    }

    #[tokio::test(start_paused = true)]
    async fn start_uses_snapshot_index() {
        let l = ledger();
        let policy = RetryPolicy::default();
        let block = l.block(SOL_BLOCK_ID).await.unwrap();
        let (round, outcome) = start_exploration(&l, &policy, &block).await.unwrap();
        assert_eq!(round, RoundId::new(SOL_BLOCK_ID, 0));
        assert_eq!(outcome, SubmitOutcome::Applied);

        // stale snapshot: same round, no second start
        let (again, outcome) = start_exploration(&l, &policy, &block).await.unwrap();
        assert_eq!(again, round);
        assert_eq!(outcome, SubmitOutcome::AlreadyApplied);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_block_is_not_started() {
        let l = ledger();
        l.set_block_paused(SOL_BLOCK_ID, true).unwrap();
        let block = l.block(SOL_BLOCK_ID).await.unwrap();
        assert!(start_exploration(&l, &RetryPolicy::default(), &block)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn roll_over_then_carry_forward_once() {
        let l = ledger();
        let policy = RetryPolicy::default();
        let block = l.block(SOL_BLOCK_ID).await.unwrap();
        let (round, _) = start_exploration(&l, &policy, &block).await.unwrap();
        l.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 4, 10_000_000, 0, 1)
            .unwrap();

        l.warp(l.timing().active_duration_secs());
        assert_eq!(roll_over(&l, &policy, round).await.unwrap(), SubmitOutcome::Applied);
        assert_eq!(
            roll_over(&l, &policy, round).await.unwrap(),
            SubmitOutcome::AlreadyApplied
        );

        l.warp(l.timing().cooldown_duration_secs());
        let block = l.block(SOL_BLOCK_ID).await.unwrap();
        let (next, _) = start_exploration(&l, &policy, &block).await.unwrap();
        assert_eq!(
            carry_forward(&l, &policy, round, next.exploration_index).await.unwrap(),
            SubmitOutcome::Applied
        );
        assert_eq!(
            carry_forward(&l, &policy, round, next.exploration_index).await.unwrap(),
            SubmitOutcome::AlreadyApplied
        );
        let n = l.exploration(next).await.unwrap().unwrap();
        assert_eq!(n.rollover_amount, 10_000_000);
    }
}
