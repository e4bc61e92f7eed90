use std::collections::{BTreeMap, HashMap};

use anchor_lang::prelude::Pubkey;
use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sha256_hasher::hashv;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{IdempotencyKey, StateStore, SubmitOutcome, SubmitReceipt, Transition};
use crate::constants::{
    COMMIT_REVEAL_TIMEOUT_SLOTS, MIN_COMMIT_LEAD_SLOTS, MIN_DEPOSIT_AMOUNT, RIGS_PER_EXPLORATION,
};
use crate::errors::{OrchestratorError, OrchestratorResult, RigItError};
use crate::events::{
    self, AntiSnipedDepositClaimed, BuybackBudgetAllocated, DepositMade, ExplorationRolledOver,
    ExplorationSettled, ExplorationStarted, FundsCarriedForward, LedgerEvent, LoserRefunded,
    RandomnessCommitted, RandomnessTimeoutFallback, WinningsClaimed,
};
use crate::secrets::CommitSecret;
use crate::settlement::{self, BuybackAllocation, FeeSplit, Settlement};
use crate::state::{
    receipt_address, BlockState, DepositReceipt, ExplorationState, ExplorationStatus, RigState,
    RoundId,
};
use crate::utils::{
    derive_entropy, effective_tickets, select_winning_rig, verify_reveal, TimingParams,
};

/// Nominal slot length of the simulated cluster.
const SLOT_MS: i64 = 400;
/// How far back the slot-hash history reaches.
const SLOT_HASHES_DEPTH: u64 = 512;
const GENESIS_TS: i64 = 1_700_000_000;
const GENESIS_SLOT: u64 = 300_000_000;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

type Applied = (SubmitOutcome, Vec<LedgerEvent>);

fn require(cond: bool, err: RigItError) -> OrchestratorResult<()> {
    if cond {
        Ok(())
    } else {
        Err(err.into())
    }
}

/// Deterministic stand-in for the cluster's slot hash. Only slots strictly in the
/// past and inside the history window have one.
fn slot_hash_at(slot: u64, current_slot: u64) -> Option<[u8; 32]> {
    if slot >= current_slot || current_slot - slot > SLOT_HASHES_DEPTH {
        return None;
    }
    Some(hashv(&[b"slot-hash".as_ref(), slot.to_le_bytes().as_ref()]).to_bytes())
}

fn rolled_over_event(e: &ExplorationState, key: Pubkey, reason: &str) -> LedgerEvent {
    LedgerEvent::ExplorationRolledOver(ExplorationRolledOver {
        block_id: e.block_id,
        exploration_index: e.exploration_index,
        exploration_key: key,
        total_deposits: e.total_deposits,
        reason: reason.to_string(),
    })
}

/// Clock reading and fixed parameters one ledger operation runs against.
struct Env<'a> {
    program_id: &'a Pubkey,
    timing: &'a TimingParams,
    split: &'a FeeSplit,
    now: i64,
    slot: u64,
}

struct LedgerInner {
    blocks: BTreeMap<u8, BlockState>,
    explorations: HashMap<RoundId, ExplorationState>,
    rounds_by_key: HashMap<Pubkey, RoundId>,
    rigs: HashMap<(RoundId, u8), RigState>,
    receipts: HashMap<Pubkey, DepositReceipt>,
    applied: HashMap<IdempotencyKey, u32>,
    logs: Vec<String>,
    warp_ms: i64,
    fail_next: u32,
    drop_next_responses: u32,
    timeout_fallback: bool,
}

/// In-process ledger of record. Enforces the same rules as the on-chain program,
/// runs on the tokio clock (so paused-time tests drive it), and can inject failures.
pub struct MemoryLedger {
    program_id: Pubkey,
    timing: TimingParams,
    split: FeeSplit,
    origin: Instant,
    inner: Mutex<LedgerInner>,
    events: broadcast::Sender<LedgerEvent>,
}

impl MemoryLedger {
    pub fn new(timing: TimingParams, split: FeeSplit) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            program_id: crate::ID,
            timing,
            split,
            origin: Instant::now(),
            inner: Mutex::new(LedgerInner {
                blocks: BTreeMap::new(),
                explorations: HashMap::new(),
                rounds_by_key: HashMap::new(),
                rigs: HashMap::new(),
                receipts: HashMap::new(),
                applied: HashMap::new(),
                logs: Vec::new(),
                warp_ms: 0,
                fail_next: 0,
                drop_next_responses: 0,
                timeout_fallback: true,
            }),
            events,
        }
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn timing(&self) -> TimingParams {
        self.timing
    }

    fn clock(&self, inner: &LedgerInner) -> (i64, u64) {
        let elapsed_ms = self.origin.elapsed().as_millis() as i64 + inner.warp_ms;
        (
            GENESIS_TS + elapsed_ms / 1000,
            GENESIS_SLOT + (elapsed_ms / SLOT_MS) as u64,
        )
    }

    fn env(&self, inner: &LedgerInner) -> Env<'_> {
        let (now, slot) = self.clock(inner);
        Env {
            program_id: &self.program_id,
            timing: &self.timing,
            split: &self.split,
            now,
            slot,
        }
    }

    // ----------------------------
    // Setup and test controls
    // ----------------------------

    pub fn add_block(&self, block_id: u8, asset_mint: Pubkey, asset_decimals: u8, min_threshold: u64) {
        self.inner.lock().blocks.insert(
            block_id,
            BlockState {
                block_id,
                asset_mint,
                asset_decimals,
                min_threshold,
                current_exploration_index: 0,
                paused: false,
                total_volume: 0,
                total_explorations_completed: 0,
            },
        );
    }

    pub fn set_block_paused(&self, block_id: u8, paused: bool) -> OrchestratorResult<()> {
        let mut inner = self.inner.lock();
        let block = inner
            .blocks
            .get_mut(&block_id)
            .ok_or(RigItError::InvalidBlockId)?;
        block.paused = paused;
        Ok(())
    }

    /// Moves the ledger clock (and slot) forward without waiting.
    pub fn warp(&self, secs: i64) {
        self.inner.lock().warp_ms += secs * 1000;
    }

    /// The next `n` submissions fail before touching state.
    pub fn fail_next_submissions(&self, n: u32) {
        self.inner.lock().fail_next = n;
    }

    /// The next `n` submissions are applied but the caller sees a transport error.
    pub fn drop_next_responses(&self, n: u32) {
        self.inner.lock().drop_next_responses = n;
    }

    pub fn set_timeout_fallback(&self, enabled: bool) {
        self.inner.lock().timeout_fallback = enabled;
    }

    /// How many times the step behind `key` actually changed state.
    pub fn applied_count(&self, key: IdempotencyKey) -> u32 {
        self.inner.lock().applied.get(&key).copied().unwrap_or(0)
    }

    pub fn slot_hash(&self, slot: u64) -> Option<[u8; 32]> {
        let inner = self.inner.lock();
        let (_, current) = self.clock(&inner);
        slot_hash_at(slot, current)
    }

    pub fn receipt(&self, key: &Pubkey) -> Option<DepositReceipt> {
        self.inner.lock().receipts.get(key).cloned()
    }

    pub fn rig(&self, round: RoundId, rig_index: u8) -> Option<RigState> {
        self.inner.lock().rigs.get(&(round, rig_index)).cloned()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.lock().logs.clone()
    }

    // ----------------------------
    // User instructions
    // ----------------------------

    pub fn deposit(
        &self,
        user: Pubkey,
        block_id: u8,
        rig_index: u8,
        amount: u64,
        holding_balance: u64,
        nonce: u64,
    ) -> OrchestratorResult<Pubkey> {
        let (key, events) = {
            let mut inner = self.inner.lock();
            let env = self.env(&inner);
            inner.deposit(&env, user, block_id, rig_index, amount, holding_balance, nonce)?
        };
        self.publish(events)?;
        Ok(key)
    }

    pub fn claim_refund(&self, receipt: Pubkey) -> OrchestratorResult<u64> {
        let (amount, events) = self.inner.lock().claim_refund(receipt)?;
        self.publish(events)?;
        Ok(amount)
    }

    pub fn claim_winnings(&self, receipt: Pubkey) -> OrchestratorResult<u64> {
        let (amount, events) = self.inner.lock().claim_winnings(&self.split, receipt)?;
        self.publish(events)?;
        Ok(amount)
    }

    /// Moves a held-out deposit into the block's current Active exploration.
    pub fn claim_anti_sniped(&self, receipt: Pubkey) -> OrchestratorResult<Pubkey> {
        let (key, events) = {
            let mut inner = self.inner.lock();
            let env = self.env(&inner);
            inner.claim_anti_sniped(&env, receipt)?
        };
        self.publish(events)?;
        Ok(key)
    }

    // ----------------------------
    // Event emission
    // ----------------------------

    /// Logs events the way the program does and feeds subscribers from the decoded logs.
    fn publish(&self, emitted: Vec<LedgerEvent>) -> OrchestratorResult<Vec<LedgerEvent>> {
        let lines: Vec<String> = emitted.iter().map(LedgerEvent::to_log_line).collect();
        let decoded = events::decode_logs(lines.iter().map(String::as_str))?;
        self.inner.lock().logs.extend(lines);
        for event in &decoded {
            // no subscribers is fine
            let _ = self.events.send(event.clone());
        }
        Ok(decoded)
    }
}

#[async_trait]
impl StateStore for MemoryLedger {
    async fn block(&self, block_id: u8) -> OrchestratorResult<BlockState> {
        self.inner
            .lock()
            .blocks
            .get(&block_id)
            .cloned()
            .ok_or_else(|| RigItError::InvalidBlockId.into())
    }

    async fn exploration(&self, round: RoundId) -> OrchestratorResult<Option<ExplorationState>> {
        Ok(self.inner.lock().explorations.get(&round).cloned())
    }

    async fn current_slot(&self) -> OrchestratorResult<u64> {
        let inner = self.inner.lock();
        Ok(self.clock(&inner).1)
    }

    async fn unix_timestamp(&self) -> OrchestratorResult<i64> {
        let inner = self.inner.lock();
        Ok(self.clock(&inner).0)
    }

    async fn submit(&self, transition: Transition) -> OrchestratorResult<SubmitReceipt> {
        let key = transition.key();
        let (outcome, emitted, dropped) = {
            let mut inner = self.inner.lock();
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                return Err(OrchestratorError::Transient(format!("{key}: injected failure")));
            }
            let env = self.env(&inner);
            let (outcome, emitted) = inner.apply(&env, &transition)?;
            if outcome == SubmitOutcome::Applied {
                *inner.applied.entry(key).or_default() += 1;
            }
            let dropped = inner.drop_next_responses > 0;
            if dropped {
                inner.drop_next_responses -= 1;
            }
            (outcome, emitted, dropped)
        };
        debug!(%key, ?outcome, "ledger transition");

        let events = self.publish(emitted)?;
        if dropped {
            return Err(OrchestratorError::Transient(format!(
                "{key}: response lost after apply"
            )));
        }
        Ok(SubmitReceipt { outcome, events })
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    fn supports_timeout_fallback(&self) -> bool {
        self.inner.lock().timeout_fallback
    }
}

// ----------------------------
// Ledger rules
// ----------------------------

impl LedgerInner {
    fn apply(&mut self, env: &Env<'_>, transition: &Transition) -> OrchestratorResult<Applied> {
        match transition {
            Transition::StartExploration { round } => self.start(env, *round),
            Transition::CommitRandomness {
                round,
                target_slot,
                commit_hash,
            } => self.commit(env, *round, *target_slot, *commit_hash),
            Transition::RollOver { round } => self.roll_over(env, *round),
            Transition::RevealRandomness { round, secret } => self.reveal(env, *round, secret),
            Transition::RevealTimeoutFallback { round } => self.timeout_fallback(env, *round),
            Transition::AllocateBuyback { round } => self.allocate_buyback(env, *round),
            Transition::CarryForward { from, to_index } => self.carry_forward(env, *from, *to_index),
        }
    }

    fn record_completion(&mut self, block_id: u8, volume: u64) {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.total_volume = block.total_volume.saturating_add(volume as u128);
            block.total_explorations_completed = block.total_explorations_completed.saturating_add(1);
        }
    }

    fn start(&mut self, env: &Env<'_>, round: RoundId) -> OrchestratorResult<Applied> {
        let block = self
            .blocks
            .get(&round.block_id)
            .ok_or(RigItError::InvalidBlockId)?;
        if round.exploration_index < block.current_exploration_index {
            return Ok((SubmitOutcome::AlreadyApplied, Vec::new()));
        }
        require(!block.paused, RigItError::BlockPaused)?;
        require(
            round.exploration_index == block.current_exploration_index,
            RigItError::InvalidExplorationStatus,
        )?;

        // 1) previous exploration must be final and past cooldown
        let mut rollover_amount = 0;
        if let Some(prev_index) = block.latest_exploration_index() {
            let prev = self
                .explorations
                .get(&RoundId::new(round.block_id, prev_index))
                .ok_or(RigItError::InvalidExplorationStatus)?;
            require(prev.status.is_final(), RigItError::PreviousNotFinalized)?;
            require(env.now >= prev.cooldown_end_ts, RigItError::CooldownNotEnded)?;
            if prev.status == ExplorationStatus::Settled {
                rollover_amount =
                    BuybackAllocation::from_remaining_pool(prev.remaining_pool, env.split).ecosystem;
            }
        }

        // 2) open the new one
        let timing = env.timing.for_start(env.now);
        let key = round.address(env.program_id);
        self.explorations.insert(
            round,
            ExplorationState {
                block_id: round.block_id,
                exploration_index: round.exploration_index,
                status: ExplorationStatus::Active,
                start_slot: env.slot,
                start_ts: timing.start_ts,
                active_end_ts: timing.active_end_ts,
                cooldown_end_ts: timing.cooldown_end_ts,
                rollover_amount,
                ..Default::default()
            },
        );
        self.rounds_by_key.insert(key, round);
        if let Some(block) = self.blocks.get_mut(&round.block_id) {
            block.current_exploration_index += 1;
        }

        Ok((
            SubmitOutcome::Applied,
            vec![LedgerEvent::ExplorationStarted(ExplorationStarted {
                block_id: round.block_id,
                exploration_index: round.exploration_index,
                exploration_key: key,
                start_ts: timing.start_ts,
                active_end_ts: timing.active_end_ts,
                cooldown_end_ts: timing.cooldown_end_ts,
                rollover_amount,
            })],
        ))
    }

    fn commit(
        &mut self,
        env: &Env<'_>,
        round: RoundId,
        target_slot: u64,
        commit_hash: [u8; 32],
    ) -> OrchestratorResult<Applied> {
        let min_threshold = self
            .blocks
            .get(&round.block_id)
            .ok_or(RigItError::InvalidBlockId)?
            .min_threshold;
        let key = round.address(env.program_id);
        let e = self
            .explorations
            .get_mut(&round)
            .ok_or(RigItError::ExplorationNotActive)?;

        match e.status {
            ExplorationStatus::Finalizing => {
                if e.commit_slot == target_slot && e.commit_hash == commit_hash {
                    return Ok((SubmitOutcome::AlreadyApplied, Vec::new()));
                }
                return Err(RigItError::RandomnessAlreadyCommitted.into());
            }
            ExplorationStatus::Settled | ExplorationStatus::RolledOver => {
                return Err(RigItError::ExplorationAlreadyFinalized.into())
            }
            ExplorationStatus::Pending => return Err(RigItError::ExplorationNotActive.into()),
            ExplorationStatus::Active => {}
        }
        require(env.now >= e.active_end_ts, RigItError::ActivePhaseNotEnded)?;

        // below threshold the commit itself rolls the exploration over
        if !settlement::meets_threshold(e.total_deposits, min_threshold) {
            e.status = ExplorationStatus::RolledOver;
            let event = rolled_over_event(e, key, "Threshold not met");
            let volume = e.total_deposits;
            self.record_completion(round.block_id, volume);
            return Ok((SubmitOutcome::Applied, vec![event]));
        }

        require(
            target_slot >= env.slot + MIN_COMMIT_LEAD_SLOTS,
            RigItError::CommitSlotNotFuture,
        )?;
        e.commit_slot = target_slot;
        e.commit_hash = commit_hash;
        e.reveal_deadline_slot = target_slot + COMMIT_REVEAL_TIMEOUT_SLOTS;
        e.status = ExplorationStatus::Finalizing;

        Ok((
            SubmitOutcome::Applied,
            vec![LedgerEvent::RandomnessCommitted(RandomnessCommitted {
                exploration_key: key,
                commit_slot: target_slot,
                reveal_deadline_slot: e.reveal_deadline_slot,
                commit_hash,
            })],
        ))
    }

    fn roll_over(&mut self, env: &Env<'_>, round: RoundId) -> OrchestratorResult<Applied> {
        let min_threshold = self
            .blocks
            .get(&round.block_id)
            .ok_or(RigItError::InvalidBlockId)?
            .min_threshold;
        let key = round.address(env.program_id);
        let e = self
            .explorations
            .get_mut(&round)
            .ok_or(RigItError::ExplorationNotActive)?;

        match e.status {
            ExplorationStatus::RolledOver => return Ok((SubmitOutcome::AlreadyApplied, Vec::new())),
            ExplorationStatus::Settled => return Err(RigItError::ExplorationAlreadyFinalized.into()),
            ExplorationStatus::Active => {}
            _ => return Err(RigItError::InvalidExplorationStatus.into()),
        }
        require(env.now >= e.active_end_ts, RigItError::ActivePhaseNotEnded)?;
        require(
            !settlement::meets_threshold(e.total_deposits, min_threshold),
            RigItError::InvalidExplorationStatus,
        )?;

        e.status = ExplorationStatus::RolledOver;
        let event = rolled_over_event(e, key, "Threshold not met");
        let volume = e.total_deposits;
        self.record_completion(round.block_id, volume);
        Ok((SubmitOutcome::Applied, vec![event]))
    }

    fn finalizing(&self, round: RoundId) -> OrchestratorResult<&ExplorationState> {
        let e = self
            .explorations
            .get(&round)
            .ok_or(RigItError::ExplorationNotFinalizing)?;
        match e.status {
            ExplorationStatus::Finalizing => Ok(e),
            ExplorationStatus::Settled | ExplorationStatus::RolledOver => {
                Err(RigItError::ExplorationAlreadyFinalized.into())
            }
            _ => Err(RigItError::ExplorationNotFinalizing.into()),
        }
    }

    fn reveal(&mut self, env: &Env<'_>, round: RoundId, secret: &CommitSecret) -> OrchestratorResult<Applied> {
        let e = self.finalizing(round)?;
        require(env.slot >= e.commit_slot, RigItError::RevealTooEarly)?;
        require(env.slot <= e.reveal_deadline_slot, RigItError::RevealDeadlinePassed)?;
        require(
            verify_reveal(secret.expose(), e.commit_slot, &e.commit_hash),
            RigItError::InvalidRevealSecret,
        )?;
        let slot_hash =
            slot_hash_at(e.commit_slot, env.slot).ok_or(RigItError::SlotHashNotAvailable)?;
        let entropy = derive_entropy(secret.expose(), &slot_hash);
        self.settle_with_entropy(env, round, entropy, None)
    }

    fn timeout_fallback(&mut self, env: &Env<'_>, round: RoundId) -> OrchestratorResult<Applied> {
        let deadline = self.finalizing(round)?.reveal_deadline_slot;
        require(self.timeout_fallback, RigItError::InvalidExplorationStatus)?;
        require(env.slot > deadline, RigItError::RevealDeadlineNotPassed)?;
        // the deadline slot hash is the entropy; nobody could know it at commit time
        let entropy = slot_hash_at(deadline, env.slot).ok_or(RigItError::SlotHashNotAvailable)?;
        self.settle_with_entropy(env, round, entropy, Some(deadline))
    }

    fn settle_with_entropy(
        &mut self,
        env: &Env<'_>,
        round: RoundId,
        entropy: [u8; 32],
        fallback_slot: Option<u64>,
    ) -> OrchestratorResult<Applied> {
        let key = round.address(env.program_id);
        let e = self
            .explorations
            .get_mut(&round)
            .ok_or(RigItError::ExplorationNotFinalizing)?;
        e.revealed_random = Some(entropy);

        let winner = select_winning_rig(&entropy, &e.rig_tickets);
        let outcome = settlement::settle(
            &e.rig_deposits,
            &e.rig_tickets,
            e.rollover_amount,
            winner,
            env.split,
        )
        .map_err(|_| RigItError::ArithmeticOverflow)?;

        let mut events = Vec::new();
        match outcome {
            Settlement::Settled(p) => {
                e.status = ExplorationStatus::Settled;
                e.winning_rig = Some(p.winning_rig);
                e.total_winner_deposits = p.winner_deposits;
                e.total_loser_deposits = p.loser_deposits;
                e.remaining_pool = p.remaining_pool;
                events.push(LedgerEvent::ExplorationSettled(ExplorationSettled {
                    block_id: round.block_id,
                    exploration_index: round.exploration_index,
                    exploration_key: key,
                    winning_rig: p.winning_rig,
                    total_pool: e.total_pool(),
                    winner_deposits: p.winner_deposits,
                    loser_deposits: p.loser_deposits,
                    remaining_pool: p.remaining_pool,
                }));
                if let Some(fallback_slot) = fallback_slot {
                    events.push(LedgerEvent::RandomnessTimeoutFallback(
                        RandomnessTimeoutFallback {
                            exploration_key: key,
                            fallback_slot,
                            winning_rig: p.winning_rig,
                        },
                    ));
                }
            }
            Settlement::RolledOver { .. } => {
                e.status = ExplorationStatus::RolledOver;
                events.push(rolled_over_event(e, key, "No tickets"));
            }
        }

        let volume = e.total_deposits;
        self.record_completion(round.block_id, volume);
        Ok((SubmitOutcome::Applied, events))
    }

    fn allocate_buyback(&mut self, env: &Env<'_>, round: RoundId) -> OrchestratorResult<Applied> {
        let e = self
            .explorations
            .get_mut(&round)
            .ok_or(RigItError::ExplorationNotSettled)?;
        require(e.status == ExplorationStatus::Settled, RigItError::ExplorationNotSettled)?;
        require(!e.buyback_allocated, RigItError::BuybackAlreadyAllocated)?;

        let allocation = BuybackAllocation::from_remaining_pool(e.remaining_pool, env.split);
        e.buyback_allocated = true;

        Ok((
            SubmitOutcome::Applied,
            vec![LedgerEvent::BuybackBudgetAllocated(BuybackBudgetAllocated {
                exploration_key: round.address(env.program_id),
                remaining_pool: e.remaining_pool,
                burn_amount: allocation.burn,
                lp_amount: allocation.lp,
                team_amount: allocation.team,
                ecosystem_amount: allocation.ecosystem,
            })],
        ))
    }

    fn carry_forward(&mut self, env: &Env<'_>, from: RoundId, to_index: u64) -> OrchestratorResult<Applied> {
        let to = RoundId::new(from.block_id, to_index);
        let src = self
            .explorations
            .get(&from)
            .ok_or(RigItError::InvalidExplorationStatus)?;
        require(
            src.status == ExplorationStatus::RolledOver,
            RigItError::InvalidExplorationStatus,
        )?;
        require(!src.carry_forward_done, RigItError::CarryForwardAlreadyDone)?;
        require(
            to_index > from.exploration_index,
            RigItError::InvalidExplorationStatus,
        )?;
        let amount = src.total_deposits;

        let dst = self
            .explorations
            .get_mut(&to)
            .ok_or(RigItError::ExplorationNotActive)?;
        require(dst.status == ExplorationStatus::Active, RigItError::ExplorationNotActive)?;
        dst.rollover_amount = dst
            .rollover_amount
            .checked_add(amount)
            .ok_or(RigItError::ArithmeticOverflow)?;
        if let Some(src) = self.explorations.get_mut(&from) {
            src.carry_forward_done = true;
        }

        Ok((
            SubmitOutcome::Applied,
            vec![LedgerEvent::FundsCarriedForward(FundsCarriedForward {
                from_exploration: from.address(env.program_id),
                to_exploration: to.address(env.program_id),
                amount,
            })],
        ))
    }

    // ----------------------------
    // User side
    // ----------------------------

    fn credit(
        &mut self,
        round: RoundId,
        exploration_key: Pubkey,
        rig_index: u8,
        amount: u64,
        tickets: u128,
    ) -> OrchestratorResult<()> {
        let e = self
            .explorations
            .get_mut(&round)
            .ok_or(RigItError::ExplorationNotActive)?;
        let i = rig_index as usize;
        e.rig_deposits[i] = e.rig_deposits[i]
            .checked_add(amount)
            .ok_or(RigItError::ArithmeticOverflow)?;
        e.rig_tickets[i] = e.rig_tickets[i]
            .checked_add(tickets)
            .ok_or(RigItError::ArithmeticOverflow)?;
        e.total_deposits = e
            .total_deposits
            .checked_add(amount)
            .ok_or(RigItError::ArithmeticOverflow)?;

        let rig = self
            .rigs
            .entry((round, rig_index))
            .or_insert_with(|| RigState {
                exploration: exploration_key,
                rig_index,
                ..Default::default()
            });
        rig.total_deposits = rig.total_deposits.saturating_add(amount);
        rig.total_tickets = rig.total_tickets.saturating_add(tickets);
        rig.deposit_count = rig.deposit_count.saturating_add(1);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn deposit(
        &mut self,
        env: &Env<'_>,
        user: Pubkey,
        block_id: u8,
        rig_index: u8,
        amount: u64,
        holding_balance: u64,
        nonce: u64,
    ) -> OrchestratorResult<(Pubkey, Vec<LedgerEvent>)> {
        require((rig_index as usize) < RIGS_PER_EXPLORATION, RigItError::InvalidRigIndex)?;
        require(amount >= MIN_DEPOSIT_AMOUNT, RigItError::DepositTooSmall)?;
        let block = self.blocks.get(&block_id).ok_or(RigItError::InvalidBlockId)?;
        require(!block.paused, RigItError::BlockPaused)?;
        let index = block
            .latest_exploration_index()
            .ok_or(RigItError::ExplorationNotActive)?;
        let round = RoundId::new(block_id, index);
        let exploration_key = round.address(env.program_id);

        let e = self
            .explorations
            .get(&round)
            .ok_or(RigItError::ExplorationNotActive)?;
        require(
            e.status == ExplorationStatus::Active && env.now < e.active_end_ts,
            RigItError::ExplorationNotActive,
        )?;
        let anti_sniped = e.timing(env.timing).is_anti_sniped(env.now);

        let tickets = effective_tickets(amount, holding_balance);
        let receipt_key = receipt_address(env.program_id, &exploration_key, rig_index, &user, nonce);
        // receipt account already initialised
        require(
            !self.receipts.contains_key(&receipt_key),
            RigItError::InvalidExplorationStatus,
        )?;
        if !anti_sniped {
            self.credit(round, exploration_key, rig_index, amount, tickets)?;
        }
        self.receipts.insert(
            receipt_key,
            DepositReceipt {
                user,
                rig_index,
                exploration: exploration_key,
                amount,
                effective_tickets: tickets,
                deposited_at: env.now,
                deposit_nonce: nonce,
                is_anti_sniped: anti_sniped,
                rolled_to_exploration: None,
                refund_claimed: false,
                winnings_claimed: false,
            },
        );

        Ok((
            receipt_key,
            vec![LedgerEvent::DepositMade(DepositMade {
                user,
                block_id,
                exploration_index: index,
                exploration_key,
                rig_index,
                amount,
                effective_tickets: tickets,
                is_anti_sniped: anti_sniped,
                deposit_receipt: receipt_key,
            })],
        ))
    }

    fn settled_for(&self, receipt_key: Pubkey) -> OrchestratorResult<(&DepositReceipt, &ExplorationState)> {
        let r = self
            .receipts
            .get(&receipt_key)
            .ok_or(RigItError::InvalidExplorationStatus)?;
        let round = self
            .rounds_by_key
            .get(&r.exploration)
            .ok_or(RigItError::InvalidExplorationStatus)?;
        let e = self
            .explorations
            .get(round)
            .ok_or(RigItError::InvalidExplorationStatus)?;
        require(e.status == ExplorationStatus::Settled, RigItError::ExplorationNotSettled)?;
        Ok((r, e))
    }

    fn claim_refund(&mut self, receipt_key: Pubkey) -> OrchestratorResult<(u64, Vec<LedgerEvent>)> {
        let (r, e) = self.settled_for(receipt_key)?;
        require(
            !r.is_anti_sniped && e.winning_rig != Some(r.rig_index),
            RigItError::NotALoser,
        )?;
        require(!r.refund_claimed, RigItError::RefundAlreadyClaimed)?;
        let refund = settlement::loser_refund(r.amount);
        let event = LedgerEvent::LoserRefunded(LoserRefunded {
            user: r.user,
            exploration_key: r.exploration,
            deposit_receipt: receipt_key,
            original_amount: r.amount,
            refund_amount: refund,
        });

        if let Some(r) = self.receipts.get_mut(&receipt_key) {
            r.refund_claimed = true;
        }
        Ok((refund, vec![event]))
    }

    fn claim_winnings(&mut self, split: &FeeSplit, receipt_key: Pubkey) -> OrchestratorResult<(u64, Vec<LedgerEvent>)> {
        let (r, e) = self.settled_for(receipt_key)?;
        require(
            !r.is_anti_sniped && e.winning_rig == Some(r.rig_index),
            RigItError::NotAWinner,
        )?;
        require(!r.winnings_claimed, RigItError::WinningsAlreadyClaimed)?;
        let payout = match settlement::settle(
            &e.rig_deposits,
            &e.rig_tickets,
            e.rollover_amount,
            e.winning_rig,
            split,
        )
        .map_err(|_| RigItError::ArithmeticOverflow)?
        {
            Settlement::Settled(p) => p,
            Settlement::RolledOver { .. } => return Err(RigItError::NotAWinner.into()),
        };
        let amount = payout.winner_share(r.effective_tickets);
        let event = LedgerEvent::WinningsClaimed(WinningsClaimed {
            user: r.user,
            exploration_key: r.exploration,
            deposit_receipt: receipt_key,
            effective_tickets: r.effective_tickets,
            winning_amount: amount,
        });

        if let Some(r) = self.receipts.get_mut(&receipt_key) {
            r.winnings_claimed = true;
        }
        Ok((amount, vec![event]))
    }

    fn claim_anti_sniped(&mut self, env: &Env<'_>, receipt_key: Pubkey) -> OrchestratorResult<(Pubkey, Vec<LedgerEvent>)> {
        let original = self
            .receipts
            .get(&receipt_key)
            .ok_or(RigItError::DepositNotAntiSniped)?
            .clone();
        require(original.is_anti_sniped, RigItError::DepositNotAntiSniped)?;
        require(
            original.rolled_to_exploration.is_none(),
            RigItError::DepositAlreadyRolledOver,
        )?;

        // 1) the block's newest exploration must be a later, still-open one
        let origin = *self
            .rounds_by_key
            .get(&original.exploration)
            .ok_or(RigItError::InvalidExplorationStatus)?;
        let next_index = self
            .blocks
            .get(&origin.block_id)
            .ok_or(RigItError::InvalidBlockId)?
            .latest_exploration_index()
            .ok_or(RigItError::ExplorationNotActive)?;
        require(next_index > origin.exploration_index, RigItError::ExplorationNotActive)?;
        let next = RoundId::new(origin.block_id, next_index);
        let next_e = self
            .explorations
            .get(&next)
            .ok_or(RigItError::ExplorationNotActive)?;
        require(
            next_e.status == ExplorationStatus::Active && env.now < next_e.active_end_ts,
            RigItError::ExplorationNotActive,
        )?;

        // 2) same rig, nonce and tickets, counted this time
        let next_key = next.address(env.program_id);
        let new_key = receipt_address(
            env.program_id,
            &next_key,
            original.rig_index,
            &original.user,
            original.deposit_nonce,
        );
        require(!self.receipts.contains_key(&new_key), RigItError::DepositAlreadyRolledOver)?;
        self.credit(
            next,
            next_key,
            original.rig_index,
            original.amount,
            original.effective_tickets,
        )?;

        let event = LedgerEvent::AntiSnipedDepositClaimed(AntiSnipedDepositClaimed {
            original_deposit: receipt_key,
            new_deposit: new_key,
            user: original.user,
            amount: original.amount,
            new_exploration: next_key,
        });
        self.receipts.insert(
            new_key,
            DepositReceipt {
                exploration: next_key,
                deposited_at: env.now,
                is_anti_sniped: false,
                rolled_to_exploration: None,
                refund_claimed: false,
                winnings_claimed: false,
                ..original
            },
        );
        if let Some(r) = self.receipts.get_mut(&receipt_key) {
            r.rolled_to_exploration = Some(next_key);
        }
        Ok((new_key, vec![event]))
    }
}
