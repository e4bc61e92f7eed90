use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::constants::{COMMIT_TARGET_OFFSET_SLOTS, MIN_COMMIT_LEAD_SLOTS, SLOT_POLL_INTERVAL_MS};
use crate::errors::{OrchestratorError, OrchestratorResult, RigItError};
use crate::instructions::{
    allocate_buyback, carry_forward, commit_randomness, load_exploration, reveal_randomness,
    reveal_timeout_fallback, roll_over, start_exploration, wait_for_slot_after, RetryPolicy,
};
use crate::secrets::{CommitSecret, PendingCommit, SecretVault};
use crate::settlement::{self, FeeSplit, Payout, Settlement};
use crate::state::{ExplorationState, ExplorationStatus, RoundId};
use crate::store::StateStore;
use crate::utils::{select_winning_rig, ExplorationTiming, TimingParams};

/// Attempts at committing before a stale target slot is treated as a real failure.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    pub timing: TimingParams,
    pub split: FeeSplit,
    pub retry: RetryPolicy,
    pub slot_poll_interval: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            timing: TimingParams::default(),
            split: FeeSplit::default(),
            retry: RetryPolicy::default(),
            slot_poll_interval: Duration::from_millis(SLOT_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Active phase still running.
    NotDue { finalize_at: i64 },
    RolledOver { carry: u64 },
    Settled(Payout),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Paused,
    NotDue { start_at: i64 },
    Started {
        round: RoundId,
        timing: ExplorationTiming,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    Finalize,
    CarryForward,
    StartNext,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Finalize => "finalize",
            TaskKind::CarryForward => "carry-forward",
            TaskKind::StartNext => "start-next",
        }
    }
}

/// What a block needs next and when (ledger unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTask {
    pub round: RoundId,
    pub kind: TaskKind,
    pub due_ts: i64,
}

/// Checks a settled exploration against an independent recomputation:
/// the winning rig must follow from the revealed entropy and W/L/R from the deposits.
pub fn verify_settlement(e: &ExplorationState, split: &FeeSplit) -> OrchestratorResult<Payout> {
    let (Some(winning_rig), Some(entropy)) = (e.winning_rig, e.revealed_random) else {
        return Err(OrchestratorError::SettlementMismatch(format!(
            "settled exploration {}-{} without winner or entropy",
            e.block_id, e.exploration_index
        )));
    };
    let expected = select_winning_rig(&entropy, &e.rig_tickets);
    if expected != Some(winning_rig) {
        return Err(OrchestratorError::SettlementMismatch(format!(
            "ledger winner {winning_rig}, entropy selects {expected:?}"
        )));
    }
    match settlement::settle(
        &e.rig_deposits,
        &e.rig_tickets,
        e.rollover_amount,
        Some(winning_rig),
        split,
    )? {
        Settlement::Settled(payout) => {
            payout.check_ledger(e.total_winner_deposits, e.total_loser_deposits, e.remaining_pool)?;
            Ok(payout)
        }
        Settlement::RolledOver { .. } => Err(OrchestratorError::SettlementMismatch(
            "winner recorded but local settlement rolled over".into(),
        )),
    }
}

/// Drives one exploration at a time through commit, reveal and the follow-up steps.
/// Every step first re-reads the ledger, so running any method twice is harmless.
pub struct RoundMachine {
    store: Arc<dyn StateStore>,
    vault: Arc<SecretVault>,
    config: MachineConfig,
}

impl RoundMachine {
    pub fn new(store: Arc<dyn StateStore>, vault: Arc<SecretVault>, config: MachineConfig) -> Self {
        Self {
            store,
            vault,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    // ----------------------------
    // Planning
    // ----------------------------

    /// Derives the block's next task from ledger state alone.
    pub async fn plan(&self, block_id: u8) -> OrchestratorResult<Option<PlannedTask>> {
        let store = self.store.as_ref();
        let block = store.block(block_id).await?;
        if block.paused {
            return Ok(None);
        }
        let next_round = RoundId::new(block_id, block.current_exploration_index);
        let now = store.unix_timestamp().await?;

        let Some(latest_index) = block.latest_exploration_index() else {
            return Ok(Some(PlannedTask {
                round: next_round,
                kind: TaskKind::StartNext,
                due_ts: now,
            }));
        };
        let round = RoundId::new(block_id, latest_index);
        let e = load_exploration(store, round).await?;
        let timing = e.timing(&self.config.timing);

        let task = match e.status {
            ExplorationStatus::Pending => return Ok(None),
            ExplorationStatus::Active => {
                if self.owes_carry(round).await? {
                    PlannedTask {
                        round,
                        kind: TaskKind::CarryForward,
                        due_ts: now,
                    }
                } else {
                    PlannedTask {
                        round,
                        kind: TaskKind::Finalize,
                        due_ts: timing.finalize_at(),
                    }
                }
            }
            ExplorationStatus::Finalizing => PlannedTask {
                round,
                kind: TaskKind::Finalize,
                due_ts: now,
            },
            ExplorationStatus::Settled if !e.buyback_allocated => PlannedTask {
                round,
                kind: TaskKind::Finalize,
                due_ts: now,
            },
            ExplorationStatus::Settled | ExplorationStatus::RolledOver => PlannedTask {
                round: next_round,
                kind: TaskKind::StartNext,
                due_ts: timing.start_next_at(),
            },
        };
        Ok(Some(task))
    }

    /// True if the exploration before `round` rolled over and its pool has not moved yet.
    async fn owes_carry(&self, round: RoundId) -> OrchestratorResult<bool> {
        let Some(prev_index) = round.exploration_index.checked_sub(1) else {
            return Ok(false);
        };
        let prev = load_exploration(self.store.as_ref(), RoundId::new(round.block_id, prev_index)).await?;
        Ok(prev.status == ExplorationStatus::RolledOver && !prev.carry_forward_done)
    }

    // ----------------------------
    // Finalize
    // ----------------------------

    pub async fn finalize(&self, round: RoundId) -> OrchestratorResult<FinalizeOutcome> {
        let store = self.store.as_ref();
        let policy = &self.config.retry;
        let block = store.block(round.block_id).await?;
        let mut e = load_exploration(store, round).await?;
        e.check_invariants()?;

        match e.status {
            ExplorationStatus::Pending => return Err(RigItError::ExplorationNotActive.into()),
            ExplorationStatus::Active => {
                // 1) due?
                let now = store.unix_timestamp().await?;
                let timing = e.timing(&self.config.timing);
                if now < timing.active_end_ts {
                    return Ok(FinalizeOutcome::NotDue {
                        finalize_at: timing.finalize_at(),
                    });
                }

                // 2) threshold check, then commit or roll over
                if settlement::meets_threshold(e.total_deposits, block.min_threshold) {
                    self.commit(round).await?;
                } else {
                    roll_over(store, policy, round).await?;
                }
                e = load_exploration(store, round).await?;
            }
            _ => {}
        }

        // 3) reveal
        if e.status == ExplorationStatus::Finalizing {
            self.reveal(round, &e).await?;
            e = load_exploration(store, round).await?;
        }
        e.check_invariants()?;

        // 4) verify and run follow-ups
        match e.status {
            ExplorationStatus::Settled => {
                let payout = verify_settlement(&e, &self.config.split).inspect_err(|err| {
                    error!(
                        block_id = round.block_id,
                        exploration_index = round.exploration_index,
                        step = "verify",
                        fatal = true,
                        error = %err,
                        "ledger settlement does not match local calculation"
                    );
                })?;
                allocate_buyback(store, policy, round).await?;
                info!(
                    block_id = round.block_id,
                    exploration_index = round.exploration_index,
                    winning_rig = payout.winning_rig,
                    remaining_pool = payout.remaining_pool,
                    winner_pool = payout.winner_pool,
                    dust = payout.dust(),
                    "exploration settled"
                );
                Ok(FinalizeOutcome::Settled(payout))
            }
            ExplorationStatus::RolledOver => Ok(FinalizeOutcome::RolledOver {
                carry: e.total_deposits,
            }),
            status => Err(OrchestratorError::Transient(format!(
                "exploration {round} still {status:?} after finalize"
            ))),
        }
    }

    async fn commit(&self, round: RoundId) -> OrchestratorResult<()> {
        let store = self.store.as_ref();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let slot = store.current_slot().await?;
            // the ledger has no commitment yet, so a stale local one can be replaced
            let pending = match self.vault.get(round) {
                Some(p) if p.target_slot >= slot + MIN_COMMIT_LEAD_SLOTS => p,
                _ => {
                    self.vault.discard(round);
                    self.vault.insert_if_absent(
                        round,
                        PendingCommit::new(CommitSecret::generate(), slot + COMMIT_TARGET_OFFSET_SLOTS),
                    )
                }
            };

            match commit_randomness(store, &self.config.retry, round, &pending).await {
                Ok(_) => return Ok(()),
                Err(OrchestratorError::Ledger(RigItError::CommitSlotNotFuture))
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    warn!(
                        block_id = round.block_id,
                        exploration_index = round.exploration_index,
                        step = "commit",
                        attempt,
                        "target slot went stale, recommitting"
                    );
                    self.vault.discard(round);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reveal(&self, round: RoundId, e: &ExplorationState) -> OrchestratorResult<()> {
        let store = self.store.as_ref();
        let pending = self
            .vault
            .get(round)
            .filter(|p| p.matches(e.commit_slot, &e.commit_hash));

        let Some(pending) = pending else {
            error!(
                block_id = round.block_id,
                exploration_index = round.exploration_index,
                step = "reveal",
                fatal = true,
                reveal_deadline_slot = e.reveal_deadline_slot,
                "commit secret lost"
            );
            if !store.supports_timeout_fallback() {
                return Err(OrchestratorError::SecretLost {
                    block_id: round.block_id,
                    exploration_index: round.exploration_index,
                });
            }
            return self.fallback(round, e.reveal_deadline_slot).await;
        };

        // 1) wait for the target slot's hash to exist
        let slot =
            wait_for_slot_after(store, e.commit_slot, self.config.slot_poll_interval).await?;
        if slot > e.reveal_deadline_slot {
            warn!(
                block_id = round.block_id,
                exploration_index = round.exploration_index,
                slot,
                reveal_deadline_slot = e.reveal_deadline_slot,
                "reveal deadline missed"
            );
            return self.fallback(round, e.reveal_deadline_slot).await;
        }

        // 2) reveal
        match reveal_randomness(store, &self.config.retry, round, &pending.secret).await {
            Ok(_) => {}
            Err(OrchestratorError::Ledger(RigItError::RevealDeadlinePassed)) => {
                return self.fallback(round, e.reveal_deadline_slot).await;
            }
            Err(err) => return Err(err),
        }
        self.vault.discard(round);
        Ok(())
    }

    async fn fallback(&self, round: RoundId, deadline_slot: u64) -> OrchestratorResult<()> {
        let store = self.store.as_ref();
        if !store.supports_timeout_fallback() {
            error!(
                block_id = round.block_id,
                exploration_index = round.exploration_index,
                step = "timeout-fallback",
                fatal = true,
                "reveal deadline passed and the ledger has no fallback"
            );
            return Err(OrchestratorError::NoFallback {
                block_id: round.block_id,
                exploration_index: round.exploration_index,
            });
        }
        wait_for_slot_after(store, deadline_slot, self.config.slot_poll_interval).await?;
        reveal_timeout_fallback(store, &self.config.retry, round).await?;
        self.vault.discard(round);
        Ok(())
    }

    // ----------------------------
    // Start next
    // ----------------------------

    /// Opens the block's next exploration once the previous one is final and its cooldown is over.
    pub async fn start_next(&self, block_id: u8) -> OrchestratorResult<StartOutcome> {
        let store = self.store.as_ref();
        let block = store.block(block_id).await?;
        if block.paused {
            info!(block_id, "block paused, not starting");
            return Ok(StartOutcome::Paused);
        }

        if let Some(prev_index) = block.latest_exploration_index() {
            let prev_round = RoundId::new(block_id, prev_index);
            let prev = load_exploration(store, prev_round).await?;
            let timing = prev.timing(&self.config.timing);
            if !prev.status.is_final() {
                self.carry_forward_into(prev_round).await?;
                return Ok(StartOutcome::NotDue {
                    start_at: timing.start_next_at(),
                });
            }
            let now = store.unix_timestamp().await?;
            if now < timing.start_next_at() {
                return Ok(StartOutcome::NotDue {
                    start_at: timing.start_next_at(),
                });
            }
        }

        let (round, _) = start_exploration(store, &self.config.retry, &block).await?;
        self.carry_forward_into(round).await?;
        let e = load_exploration(store, round).await?;
        Ok(StartOutcome::Started {
            round,
            timing: e.timing(&self.config.timing),
        })
    }

    /// Carries the previous exploration's pool into `round` if it rolled over.
    pub async fn carry_forward_into(&self, round: RoundId) -> OrchestratorResult<()> {
        if !self.owes_carry(round).await? {
            return Ok(());
        }
        let from = RoundId::new(round.block_id, round.exploration_index - 1);
        carry_forward(
            self.store.as_ref(),
            &self.config.retry,
            from,
            round.exploration_index,
        )
        .await?;
        Ok(())
    }
}
