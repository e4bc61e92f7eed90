use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::OrchestratorResult;
use crate::instructions::{submit_with_retry, RetryPolicy};
use crate::secrets::CommitSecret;
use crate::state::RoundId;
use crate::store::{StateStore, SubmitOutcome, Transition};

/// Polls until the ledger's slot is past `target_slot`, so the target's slot hash exists.
/// Returns the slot observed.
pub async fn wait_for_slot_after(
    store: &dyn StateStore,
    target_slot: u64,
    poll_interval: Duration,
) -> OrchestratorResult<u64> {
    loop {
        let slot = store.current_slot().await?;
        if slot > target_slot {
            return Ok(slot);
        }
        debug!(slot, target_slot, "waiting for target slot");
        tokio::time::sleep(poll_interval).await;
    }
}

pub async fn reveal_randomness(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    round: RoundId,
    secret: &CommitSecret,
) -> OrchestratorResult<SubmitOutcome> {
    let outcome = submit_with_retry(
        store,
        policy,
        Transition::RevealRandomness {
            round,
            secret: secret.clone(),
        },
    )
    .await?;

    info!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "reveal",
        ?outcome,
        "randomness revealed"
    );
    Ok(outcome)
}

/// Settles from the deadline slot hash alone. Only for explorations whose reveal deadline passed.
pub async fn reveal_timeout_fallback(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    round: RoundId,
) -> OrchestratorResult<SubmitOutcome> {
    let outcome =
        submit_with_retry(store, policy, Transition::RevealTimeoutFallback { round }).await?;

    warn!(
        block_id = round.block_id,
        exploration_index = round.exploration_index,
        step = "timeout-fallback",
        ?outcome,
        "settled through reveal timeout fallback"
    );
    Ok(outcome)
}
