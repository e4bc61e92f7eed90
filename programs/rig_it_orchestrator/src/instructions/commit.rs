use tracing::info;

use crate::constants::COMMIT_TARGET_OFFSET_SLOTS;
use crate::errors::OrchestratorResult;
use crate::instructions::{submit_with_retry, RetryPolicy};
use crate::secrets::PendingCommit;
use crate::state::RoundId;
use crate::store::{StateStore, SubmitOutcome, Transition};

/// Target slot for a commit made now: far enough ahead that its slot hash is unknown.
pub async fn next_commit_target(store: &dyn StateStore) -> OrchestratorResult<u64> {
    Ok(store.current_slot().await? + COMMIT_TARGET_OFFSET_SLOTS)
}

/// Records the commitment hash and target slot on the ledger. The secret itself stays local.
pub async fn commit_randomness(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    round: RoundId,
    pending: &PendingCommit,
) -> OrchestratorResult<SubmitOutcome> {
    let outcome = submit_with_retry(
        store,
        policy,
        Transition::CommitRandomness {
            round,
            target_slot: pending.target_slot,
            commit_hash: pending.commit_hash,
        },
    )
    .await?;

    info!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "commit",
        target_slot = pending.target_slot,
        ?outcome,
        "randomness committed"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SOL_BLOCK_ID;
    use crate::secrets::CommitSecret;
    use crate::settlement::FeeSplit;
    use crate::state::ExplorationStatus;
    use crate::store::MemoryLedger;
    use crate::utils::TimingParams;
    use anchor_lang::prelude::Pubkey;

    #[tokio::test(start_paused = true)]
    async fn commit_records_hash_and_deadline() {
        let l = MemoryLedger::new(TimingParams::default(), FeeSplit::default());
        l.add_block(SOL_BLOCK_ID, Pubkey::new_unique(), 9, 1_000_000_000);
        let round = RoundId::new(SOL_BLOCK_ID, 0);
        l.submit(Transition::StartExploration { round }).await.unwrap();
        l.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 0, 1_500_000_000, 0, 1)
            .unwrap();
        l.warp(l.timing().active_duration_secs());

        let target = next_commit_target(&l).await.unwrap();
        let pending = PendingCommit::new(CommitSecret::generate(), target);
        let policy = RetryPolicy::default();
        assert_eq!(
            commit_randomness(&l, &policy, round, &pending).await.unwrap(),
            SubmitOutcome::Applied
        );
        // same commitment again is a no-op
        assert_eq!(
            commit_randomness(&l, &policy, round, &pending).await.unwrap(),
            SubmitOutcome::AlreadyApplied
        );

        let e = l.exploration(round).await.unwrap().unwrap();
        assert_eq!(e.status, ExplorationStatus::Finalizing);
        assert!(pending.matches(e.commit_slot, &e.commit_hash));
        assert!(e.reveal_deadline_slot > e.commit_slot);
    }
}
