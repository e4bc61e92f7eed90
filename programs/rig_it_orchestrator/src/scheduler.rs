use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anchor_lang::prelude::Pubkey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::buyback::{BuybackExecutor, BuybackJob};
use crate::constants::{FINALIZE_BUFFER_SECS, RESCAN_INTERVAL_SECS};
use crate::errors::{ErrorClass, OrchestratorError, OrchestratorResult};
use crate::events::LedgerEvent;
use crate::machine::{FinalizeOutcome, PlannedTask, RoundMachine, StartOutcome, TaskKind};
use crate::state::RoundId;

/// One unit of scheduled work. At most one task per key is queued or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub round: RoundId,
    pub kind: TaskKind,
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.round, self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Attempted,
    Confirmed,
    /// Re-derived from the ledger on the next rescan.
    FailedRetryable(String),
    /// Needs an operator. Never rescheduled by this process.
    FailedFatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskReport {
    Finalized(FinalizeOutcome),
    Started(StartOutcome),
    Carried,
}

type TaskResult = (TaskKey, OrchestratorResult<TaskReport>);

/// Consecutive ledger rejections of one task before it is treated as stalled.
const MAX_CONTRACT_FAILURES: u32 = 3;

async fn run_task(machine: Arc<RoundMachine>, key: TaskKey) -> TaskResult {
    let result = match key.kind {
        TaskKind::Finalize => machine.finalize(key.round).await.map(TaskReport::Finalized),
        TaskKind::StartNext => machine
            .start_next(key.round.block_id)
            .await
            .map(TaskReport::Started),
        TaskKind::CarryForward => machine
            .carry_forward_into(key.round)
            .await
            .map(|_| TaskReport::Carried),
    };
    (key, result)
}

/// Keeps every configured block moving: derives due work from the ledger,
/// reacts to ledger events, and runs tasks concurrently across blocks.
pub struct Scheduler {
    machine: Arc<RoundMachine>,
    program_id: Pubkey,
    blocks: Vec<u8>,
    rescan_interval: Duration,
    buyback: Option<Arc<BuybackExecutor>>,

    queue: BinaryHeap<Reverse<(i64, TaskKey)>>,
    queued: HashSet<TaskKey>,
    in_flight: HashSet<TaskKey>,
    states: HashMap<TaskKey, TaskState>,
    failures: HashMap<TaskKey, u32>,
    rounds_by_key: HashMap<Pubkey, RoundId>,
    /// Highest exploration index seen per block. Older rounds are pruned.
    latest: HashMap<u8, u64>,
}

impl Scheduler {
    pub fn new(machine: Arc<RoundMachine>, program_id: Pubkey, blocks: Vec<u8>) -> Self {
        Self {
            machine,
            program_id,
            blocks,
            rescan_interval: Duration::from_secs(RESCAN_INTERVAL_SECS),
            buyback: None,
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            states: HashMap::new(),
            failures: HashMap::new(),
            rounds_by_key: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    pub fn with_buyback(mut self, executor: Arc<BuybackExecutor>) -> Self {
        self.buyback = Some(executor);
        self
    }

    pub fn task_state(&self, key: &TaskKey) -> Option<&TaskState> {
        self.states.get(key)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    // ----------------------------
    // Queue
    // ----------------------------

    /// Queues a task unless the same key is already queued, running, or failed fatally.
    pub fn schedule(&mut self, task: PlannedTask) -> bool {
        let key = TaskKey {
            round: task.round,
            kind: task.kind,
        };
        if matches!(self.states.get(&key), Some(TaskState::FailedFatal(_)))
            || self.queued.contains(&key)
            || self.in_flight.contains(&key)
        {
            return false;
        }
        self.remember(task.round);
        self.queued.insert(key);
        self.queue.push(Reverse((task.due_ts, key)));
        debug!(%key, due_ts = task.due_ts, "task queued");
        true
    }

    fn remember(&mut self, round: RoundId) {
        self.rounds_by_key
            .entry(round.address(&self.program_id))
            .or_insert(round);
        let latest = self.latest.entry(round.block_id).or_insert(0);
        *latest = (*latest).max(round.exploration_index);
    }

    /// Forgets bookkeeping for rounds before the block's previous one.
    /// Fatal failures and running tasks are kept.
    fn prune(&mut self, block_id: u8) {
        let Some(&latest) = self.latest.get(&block_id) else {
            return;
        };
        let floor = latest.saturating_sub(1);
        let stale = |r: &RoundId| r.block_id == block_id && r.exploration_index < floor;

        let in_flight = &self.in_flight;
        self.states.retain(|k, s| {
            !stale(&k.round) || in_flight.contains(k) || matches!(s, TaskState::FailedFatal(_))
        });
        self.failures.retain(|k, _| !stale(&k.round));
        self.rounds_by_key.retain(|_, r| !stale(r));
    }

    async fn rescan(&mut self) {
        for block_id in self.blocks.clone() {
            match self.machine.plan(block_id).await {
                Ok(Some(task)) => {
                    if let Some(prev) = task.round.exploration_index.checked_sub(1) {
                        self.remember(RoundId::new(block_id, prev));
                    }
                    self.schedule(task);
                }
                Ok(None) => debug!(block_id, "nothing to schedule"),
                Err(e) => warn!(block_id, error = %e, "rescan failed"),
            }
            self.prune(block_id);
        }
    }

    async fn seconds_until_next_due(&self) -> Duration {
        let Some(Reverse((due_ts, _))) = self.queue.peek() else {
            return self.rescan_interval;
        };
        match self.machine.store().unix_timestamp().await {
            Ok(now) => Duration::from_secs((*due_ts - now).max(0) as u64),
            Err(e) => {
                warn!(error = %e, "cannot read ledger clock, waiting for rescan");
                self.rescan_interval
            }
        }
    }

    async fn dispatch_due(&mut self, tasks: &mut JoinSet<TaskResult>) {
        let now = match self.machine.store().unix_timestamp().await {
            Ok(now) => now,
            Err(e) => {
                warn!(queued = self.queue.len(), error = %e, "cannot read ledger clock, dispatch skipped");
                return;
            }
        };
        while let Some(Reverse((due_ts, key))) = self.queue.peek().copied() {
            if due_ts > now {
                break;
            }
            self.queue.pop();
            self.queued.remove(&key);
            if !self.in_flight.insert(key) {
                continue;
            }
            self.states.insert(key, TaskState::Attempted);
            info!(
                block_id = key.round.block_id,
                exploration_index = key.round.exploration_index,
                task = key.kind.as_str(),
                "task started"
            );
            tasks.spawn(run_task(self.machine.clone(), key));
        }
    }

    // ----------------------------
    // Results + events
    // ----------------------------

    async fn on_task_done(&mut self, joined: Result<TaskResult, JoinError>) {
        let (key, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(fatal = true, error = %e, "task aborted");
                return;
            }
        };
        self.in_flight.remove(&key);

        match result {
            Ok(report) => {
                info!(
                    block_id = key.round.block_id,
                    exploration_index = key.round.exploration_index,
                    task = key.kind.as_str(),
                    ?report,
                    "task confirmed"
                );
                self.states.insert(key, TaskState::Confirmed);
                self.failures.remove(&key);
                self.replan(key.round.block_id).await;
            }
            Err(e) => {
                let state = self.record_failure(key, &e);
                self.states.insert(key, state);
            }
        }
    }

    /// Transient failures are re-derived from the ledger on the next rescan.
    /// A ledger rejection that keeps coming back means the step is stalled.
    fn record_failure(&mut self, key: TaskKey, e: &OrchestratorError) -> TaskState {
        let failures = self.failures.entry(key).or_insert(0);
        *failures += 1;
        let attempt = *failures;

        let stalled = match e.class() {
            ErrorClass::ProtocolViolation | ErrorClass::Fatal => true,
            ErrorClass::Contract => attempt >= MAX_CONTRACT_FAILURES,
            ErrorClass::Transient => false,
        };
        if stalled {
            error!(
                block_id = key.round.block_id,
                exploration_index = key.round.exploration_index,
                task = key.kind.as_str(),
                attempt,
                class = ?e.class(),
                fatal = true,
                error = %e,
                "task failed, operator action needed"
            );
            TaskState::FailedFatal(e.to_string())
        } else {
            warn!(
                block_id = key.round.block_id,
                exploration_index = key.round.exploration_index,
                task = key.kind.as_str(),
                attempt,
                class = ?e.class(),
                error = %e,
                "task failed, will re-derive on rescan"
            );
            TaskState::FailedRetryable(e.to_string())
        }
    }

    async fn replan(&mut self, block_id: u8) {
        match self.machine.plan(block_id).await {
            Ok(Some(task)) => {
                self.schedule(task);
            }
            Ok(None) => {}
            Err(e) => warn!(block_id, error = %e, "replan failed"),
        }
        self.prune(block_id);
    }

    async fn on_event(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::ExplorationStarted(e) => {
                let round = RoundId::new(e.block_id, e.exploration_index);
                self.remember(round);
                if self.blocks.contains(&e.block_id) {
                    self.schedule(PlannedTask {
                        round,
                        kind: TaskKind::Finalize,
                        due_ts: e.active_end_ts + FINALIZE_BUFFER_SECS,
                    });
                }
            }
            // settled or rolled over, possibly by another actor: next timers come from the ledger
            LedgerEvent::ExplorationSettled(e) => {
                self.remember(RoundId::new(e.block_id, e.exploration_index));
                if self.blocks.contains(&e.block_id) {
                    self.replan(e.block_id).await;
                }
            }
            LedgerEvent::ExplorationRolledOver(e) => {
                self.remember(RoundId::new(e.block_id, e.exploration_index));
                if self.blocks.contains(&e.block_id) {
                    self.replan(e.block_id).await;
                }
            }
            LedgerEvent::BuybackBudgetAllocated(b) => {
                self.route_buyback(b.exploration_key, b.burn_amount, b.lp_amount)
                    .await
            }
            other => debug!(event = other.name(), "ledger event"),
        }
    }

    async fn route_buyback(&mut self, round_key: Pubkey, burn_amount: u64, lp_amount: u64) {
        let Some(executor) = self.buyback.clone() else {
            return;
        };
        let Some(round) = self.rounds_by_key.get(&round_key).copied() else {
            warn!(%round_key, "buyback allocated for unknown exploration");
            return;
        };
        let asset_mint = match self.machine.store().block(round.block_id).await {
            Ok(block) => block.asset_mint,
            Err(e) => {
                warn!(block_id = round.block_id, error = %e, "cannot read block for buyback");
                return;
            }
        };
        executor.enqueue(BuybackJob {
            round_key,
            round,
            asset_mint,
            burn_amount,
            lp_amount,
        });
    }

    // ----------------------------
    // Main loop
    // ----------------------------

    /// Runs until `shutdown` flips, then waits for in-flight tasks before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> OrchestratorResult<()> {
        let mut events = self.machine.store().subscribe();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut rescan = tokio::time::interval(self.rescan_interval);
        info!(blocks = ?self.blocks, "scheduler running");

        loop {
            let wait = self.seconds_until_next_due().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = rescan.tick() => self.rescan().await,
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream lagged, rescanning");
                        self.rescan().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("event stream closed");
                        break;
                    }
                },
                Some(joined) = tasks.join_next() => self.on_task_done(joined).await,
                _ = tokio::time::sleep(wait) => self.dispatch_due(&mut tasks).await,
            }
        }

        info!(in_flight = tasks.len(), "shutting down, draining tasks");
        while let Some(joined) = tasks.join_next().await {
            self.on_task_done(joined).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buyback::{BuybackConfig, BuybackStatus, SwapVenue};
    use crate::constants::{PUMP_BLOCK_ID, SOL_BLOCK_ID};
    use crate::errors::OrchestratorResult as Res;
    use crate::errors::RigItError;
    use crate::machine::MachineConfig;
    use crate::secrets::SecretVault;
    use crate::settlement::FeeSplit;
    use crate::state::ExplorationStatus;
    use crate::store::{MemoryLedger, StateStore};
    use crate::utils::TimingParams;
    use async_trait::async_trait;

    struct NullVenue;

    #[async_trait]
    impl SwapVenue for NullVenue {
        fn name(&self) -> &str {
            "null"
        }
        async fn health_check(&self) -> bool {
            true
        }
        async fn swap(&self, _i: Pubkey, _o: Pubkey, amount: u64, _s: u16) -> Res<u64> {
            Ok(amount)
        }
        async fn burn(&self, _mint: Pubkey, _amount: u64) -> Res<()> {
            Ok(())
        }
        async fn add_liquidity_locked(&self, _p: Pubkey, _pa: u64, _r: Pubkey, _ra: u64, _m: u32) -> Res<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<MemoryLedger>, Arc<RoundMachine>) {
        let timing = TimingParams::new(600, 300, 60).unwrap();
        let ledger = Arc::new(MemoryLedger::new(timing, FeeSplit::default()));
        ledger.add_block(SOL_BLOCK_ID, Pubkey::new_unique(), 9, 1_000_000_000);
        ledger.add_block(PUMP_BLOCK_ID, Pubkey::new_unique(), 6, 1_000_000_000);
        let machine = Arc::new(RoundMachine::new(
            ledger.clone(),
            Arc::new(SecretVault::new()),
            MachineConfig {
                timing,
                ..MachineConfig::default()
            },
        ));
        (ledger, machine)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_tasks_are_not_queued() {
        let (_ledger, machine) = setup();
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let task = PlannedTask {
            round: RoundId::new(SOL_BLOCK_ID, 0),
            kind: TaskKind::Finalize,
            due_ts: 10,
        };
        assert!(scheduler.schedule(task));
        assert!(!scheduler.schedule(PlannedTask { due_ts: 5, ..task }));
        assert_eq!(scheduler.queued_len(), 1);

        let key = TaskKey {
            round: task.round,
            kind: task.kind,
        };
        scheduler
            .states
            .insert(key, TaskState::FailedFatal("secret lost".into()));
        scheduler.queue.clear();
        scheduler.queued.clear();
        assert!(!scheduler.schedule(task));
    }

    #[tokio::test(start_paused = true)]
    async fn drives_blocks_through_rounds_and_routes_buybacks() {
        let (ledger, machine) = setup();
        ledger.set_block_paused(PUMP_BLOCK_ID, true).unwrap();
        // a flaky store must not stall the first start
        ledger.fail_next_submissions(2);

        let executor = Arc::new(BuybackExecutor::new(
            BuybackConfig::default(),
            None,
            Arc::new(NullVenue),
        ));
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID, PUMP_BLOCK_ID])
            .with_buyback(executor.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(stop_rx).await.unwrap();
            scheduler
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        let round0 = RoundId::new(SOL_BLOCK_ID, 0);
        assert_eq!(
            ledger.exploration(round0).await.unwrap().unwrap().status,
            ExplorationStatus::Active
        );
        assert!(ledger.exploration(RoundId::new(PUMP_BLOCK_ID, 0)).await.unwrap().is_none());

        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 3, 1_200_000_000, 0, 1).unwrap();
        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 30, 800_000_000, 0, 1).unwrap();

        // active window + buffer + commit/reveal slots
        tokio::time::sleep(Duration::from_secs(660)).await;
        let e = ledger.exploration(round0).await.unwrap().unwrap();
        assert_eq!(e.status, ExplorationStatus::Settled);
        assert!(e.buyback_allocated);
        assert_eq!(
            executor.status(&round0.address(&crate::ID)),
            Some(BuybackStatus::Scheduled)
        );

        // cooldown
        tokio::time::sleep(Duration::from_secs(300)).await;
        let block = ledger.block(SOL_BLOCK_ID).await.unwrap();
        assert_eq!(block.current_exploration_index, 2);

        stop_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();
        assert_eq!(
            scheduler.task_state(&TaskKey {
                round: round0,
                kind: TaskKind::Finalize,
            }),
            Some(&TaskState::Confirmed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_recorded_and_not_retried() {
        let (ledger, machine) = setup();
        ledger.set_timeout_fallback(false);
        let round0 = RoundId::new(SOL_BLOCK_ID, 0);
        ledger.submit(crate::store::Transition::StartExploration { round: round0 }).await.unwrap();
        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 1, 2_000_000_000, 0, 1).unwrap();
        ledger.warp(600);
        // committed by a process whose secret is gone
        let target = ledger.current_slot().await.unwrap() + 20;
        ledger
            .submit(crate::store::Transition::CommitRandomness {
                round: round0,
                target_slot: target,
                commit_hash: [7u8; 32],
            })
            .await
            .unwrap();

        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(stop_rx).await.unwrap();
            scheduler
        });
        tokio::time::sleep(Duration::from_secs(200)).await;
        stop_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();

        let key = TaskKey {
            round: round0,
            kind: TaskKind::Finalize,
        };
        assert!(matches!(
            scheduler.task_state(&key),
            Some(TaskState::FailedFatal(_))
        ));
        assert_eq!(
            ledger.exploration(round0).await.unwrap().unwrap().status,
            ExplorationStatus::Finalizing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn aged_out_fallback_is_fatal_not_retried_forever() {
        let (ledger, machine) = setup();
        let round0 = RoundId::new(SOL_BLOCK_ID, 0);
        ledger.submit(crate::store::Transition::StartExploration { round: round0 }).await.unwrap();
        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 1, 2_000_000_000, 0, 1).unwrap();
        ledger.warp(600);
        let target = ledger.current_slot().await.unwrap() + 20;
        ledger
            .submit(crate::store::Transition::CommitRandomness {
                round: round0,
                target_slot: target,
                commit_hash: [7u8; 32],
            })
            .await
            .unwrap();
        // the deadline slot is now older than the slot hash history
        ledger.warp(400);
        let e = ledger.exploration(round0).await.unwrap().unwrap();
        assert!(ledger.slot_hash(e.reveal_deadline_slot).is_none());

        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(stop_rx).await.unwrap();
            scheduler
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        stop_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();

        let key = TaskKey {
            round: round0,
            kind: TaskKind::Finalize,
        };
        assert!(matches!(
            scheduler.task_state(&key),
            Some(TaskState::FailedFatal(_))
        ));
        // attempted once, never re-run by later rescans
        assert_eq!(scheduler.failures.get(&key), Some(&1));
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(
            ledger.exploration(round0).await.unwrap().unwrap().status,
            ExplorationStatus::Finalizing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ledger_rejections_escalate() {
        let (_ledger, machine) = setup();
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let key = TaskKey {
            round: RoundId::new(SOL_BLOCK_ID, 0),
            kind: TaskKind::Finalize,
        };

        let rejected: OrchestratorError = RigItError::ExplorationNotActive.into();
        assert_eq!(rejected.class(), ErrorClass::Contract);
        for _ in 1..MAX_CONTRACT_FAILURES {
            assert!(matches!(
                scheduler.record_failure(key, &rejected),
                TaskState::FailedRetryable(_)
            ));
        }
        assert!(matches!(
            scheduler.record_failure(key, &rejected),
            TaskState::FailedFatal(_)
        ));

        // transient trouble never stalls a task
        let other = TaskKey {
            kind: TaskKind::StartNext,
            ..key
        };
        let flaky = OrchestratorError::Transient("rpc timeout".into());
        for _ in 0..10 {
            assert!(matches!(
                scheduler.record_failure(other, &flaky),
                TaskState::FailedRetryable(_)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bookkeeping_stays_bounded_across_rounds() {
        let (ledger, machine) = setup();
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(stop_rx).await.unwrap();
            scheduler
        });

        // no deposits: every round rolls over after active window + buffer + cooldown
        tokio::time::sleep(Duration::from_secs(6 * 905 + 60)).await;
        stop_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();

        let block = ledger.block(SOL_BLOCK_ID).await.unwrap();
        assert!(block.current_exploration_index >= 6);
        assert!(scheduler.states.len() <= 6, "{:?}", scheduler.states);
        assert!(scheduler.rounds_by_key.len() <= 3, "{:?}", scheduler.rounds_by_key);
        assert!(scheduler.failures.is_empty());
        let floor = block.current_exploration_index.saturating_sub(2);
        assert!(scheduler
            .states
            .keys()
            .all(|k| k.round.exploration_index >= floor));
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_keeps_fatal_failures() {
        let (_ledger, machine) = setup();
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let old = TaskKey {
            round: RoundId::new(SOL_BLOCK_ID, 0),
            kind: TaskKind::Finalize,
        };
        let done = TaskKey {
            round: RoundId::new(SOL_BLOCK_ID, 1),
            kind: TaskKind::Finalize,
        };
        scheduler.remember(old.round);
        scheduler.states.insert(old, TaskState::FailedFatal("secret lost".into()));
        scheduler.states.insert(done, TaskState::Confirmed);
        scheduler.remember(RoundId::new(SOL_BLOCK_ID, 5));
        scheduler.prune(SOL_BLOCK_ID);

        assert!(matches!(scheduler.task_state(&old), Some(TaskState::FailedFatal(_))));
        assert_eq!(scheduler.task_state(&done), None);
        assert!(!scheduler.schedule(PlannedTask {
            round: old.round,
            kind: old.kind,
            due_ts: 0,
        }));
        assert_eq!(scheduler.rounds_by_key.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_by_another_actor_queues_next_start() {
        let (ledger, machine) = setup();
        let mut events = ledger.subscribe();
        let round0 = RoundId::new(SOL_BLOCK_ID, 0);
        ledger.submit(crate::store::Transition::StartExploration { round: round0 }).await.unwrap();
        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 1, 2_000_000_000, 0, 1).unwrap();
        ledger.warp(600);
        let target = ledger.current_slot().await.unwrap() + 20;
        ledger
            .submit(crate::store::Transition::CommitRandomness {
                round: round0,
                target_slot: target,
                commit_hash: [7u8; 32],
            })
            .await
            .unwrap();
        ledger.warp(70);
        ledger
            .submit(crate::store::Transition::RevealTimeoutFallback { round: round0 })
            .await
            .unwrap();
        ledger
            .submit(crate::store::Transition::AllocateBuyback { round: round0 })
            .await
            .unwrap();

        // no rescan tick: only the event stream drives the scheduler
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        while let Ok(event) = events.try_recv() {
            scheduler.on_event(event).await;
        }

        assert!(scheduler.queued.contains(&TaskKey {
            round: RoundId::new(SOL_BLOCK_ID, 1),
            kind: TaskKind::StartNext,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_an_in_flight_finalize() {
        let (ledger, machine) = setup();
        let mut scheduler = Scheduler::new(machine, crate::ID, vec![SOL_BLOCK_ID]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(stop_rx).await.unwrap();
            scheduler
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        ledger.deposit(Pubkey::new_unique(), SOL_BLOCK_ID, 4, 2_000_000_000, 0, 1).unwrap();

        // committed at the finalize buffer, reveal target slot still ahead
        tokio::time::sleep(Duration::from_secs(608)).await;
        let round0 = RoundId::new(SOL_BLOCK_ID, 0);
        assert_eq!(
            ledger.exploration(round0).await.unwrap().unwrap().status,
            ExplorationStatus::Finalizing
        );

        stop_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();

        let e = ledger.exploration(round0).await.unwrap().unwrap();
        assert_eq!(e.status, ExplorationStatus::Settled);
        assert!(e.buyback_allocated);
        assert_eq!(
            scheduler.task_state(&TaskKey {
                round: round0,
                kind: TaskKind::Finalize,
            }),
            Some(&TaskState::Confirmed)
        );
    }
}
