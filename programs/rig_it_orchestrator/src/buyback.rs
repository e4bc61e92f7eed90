use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anchor_lang::prelude::Pubkey;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::constants::{
    BUYBACK_RETENTION_SECS, BUYBACK_TOMBSTONE_CAPACITY, DEFAULT_BUYBACK_MAX_DELAY_HOURS,
    DEFAULT_BUYBACK_MIN_DELAY_HOURS, LP_LOCK_MONTHS, MAX_SLIPPAGE_BPS,
};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::state::RoundId;

// ----------------------------
// Venue
// ----------------------------

/// Where buyback swaps, burns and liquidity adds are executed.
#[async_trait]
pub trait SwapVenue: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> bool;

    /// Swaps `amount` of `input_mint` into `output_mint`. Returns the amount received.
    async fn swap(
        &self,
        input_mint: Pubkey,
        output_mint: Pubkey,
        amount: u64,
        max_slippage_bps: u16,
    ) -> OrchestratorResult<u64>;

    async fn burn(&self, mint: Pubkey, amount: u64) -> OrchestratorResult<()>;

    /// Adds a pair_mint/rig_mint position and locks the LP tokens.
    async fn add_liquidity_locked(
        &self,
        pair_mint: Pubkey,
        pair_amount: u64,
        rig_mint: Pubkey,
        rig_amount: u64,
        lock_months: u32,
    ) -> OrchestratorResult<()>;
}

// ----------------------------
// Config + jobs
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuybackConfig {
    pub rig_mint: Pubkey,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_slippage_bps: u16,
    pub lp_lock_months: u32,
    /// Per step (burn, LP). Reaching it marks the step failed for good.
    pub max_attempts: u32,
    pub retention: Duration,
    pub poll_interval: Duration,
}

impl Default for BuybackConfig {
    fn default() -> Self {
        Self {
            rig_mint: Pubkey::default(),
            min_delay: Duration::from_secs(DEFAULT_BUYBACK_MIN_DELAY_HOURS * 3600),
            max_delay: Duration::from_secs(DEFAULT_BUYBACK_MAX_DELAY_HOURS * 3600),
            max_slippage_bps: MAX_SLIPPAGE_BPS,
            lp_lock_months: LP_LOCK_MONTHS,
            max_attempts: 5,
            retention: Duration::from_secs(BUYBACK_RETENTION_SECS),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// One allocated buyback budget, keyed by the exploration's ledger address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuybackJob {
    pub round_key: Pubkey,
    pub round: RoundId,
    /// Asset the budget is denominated in (the block's deposit mint).
    pub asset_mint: Pubkey,
    pub burn_amount: u64,
    pub lp_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Done,
    /// Nothing to do (zero budget).
    Skipped,
    Failed { error: String },
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    pub status: StepStatus,
    pub attempts: u32,
    /// RIG bought by this step's swap. Once set the swap is never repeated.
    pub rig_acquired: Option<u64>,
}

impl StepProgress {
    fn for_amount(amount: u64) -> Self {
        Self {
            status: if amount == 0 {
                StepStatus::Skipped
            } else {
                StepStatus::Pending
            },
            attempts: 0,
            rig_acquired: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuybackStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BuybackEntry {
    pub job: BuybackJob,
    pub enqueued_at: Instant,
    pub execute_at: Instant,
    pub burn: StepProgress,
    pub lp: StepProgress,
    pub finished_at: Option<Instant>,
}

impl BuybackEntry {
    pub fn status(&self) -> BuybackStatus {
        let failed = |s: &StepStatus| matches!(s, StepStatus::Failed { .. });
        if failed(&self.burn.status) || failed(&self.lp.status) {
            BuybackStatus::Failed
        } else if self.burn.status.is_terminal() && self.lp.status.is_terminal() {
            BuybackStatus::Completed
        } else if self.burn.attempts > 0 || self.lp.attempts > 0 {
            BuybackStatus::InProgress
        } else {
            BuybackStatus::Scheduled
        }
    }

    fn is_settled(&self) -> bool {
        self.burn.status.is_terminal() && self.lp.status.is_terminal()
    }
}

// ----------------------------
// Executor
// ----------------------------

/// Bounded memory of purged round keys, oldest evicted first.
#[derive(Debug, Default)]
struct Tombstones {
    keys: HashSet<Pubkey>,
    order: VecDeque<Pubkey>,
}

impl Tombstones {
    fn insert(&mut self, key: Pubkey) {
        if !self.keys.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > BUYBACK_TOMBSTONE_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }

    fn contains(&self, key: &Pubkey) -> bool {
        self.keys.contains(key)
    }
}

/// Turns allocated budgets into RIG buys after a random delay:
/// the burn share is swapped and burned, the LP share is half swapped and added as locked liquidity.
pub struct BuybackExecutor {
    config: BuybackConfig,
    privacy: Option<Arc<dyn SwapVenue>>,
    public: Arc<dyn SwapVenue>,
    entries: Mutex<HashMap<Pubkey, BuybackEntry>>,
    purged: Mutex<Tombstones>,
}

impl BuybackExecutor {
    pub fn new(
        config: BuybackConfig,
        privacy: Option<Arc<dyn SwapVenue>>,
        public: Arc<dyn SwapVenue>,
    ) -> Self {
        Self {
            config,
            privacy,
            public,
            entries: Mutex::new(HashMap::new()),
            purged: Mutex::new(Tombstones::default()),
        }
    }

    fn random_delay(&self) -> Duration {
        let min = self.config.min_delay.as_millis() as u64;
        let max = (self.config.max_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Schedules a job. Returns false if this round was already queued or already executed.
    pub fn enqueue(&self, job: BuybackJob) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&job.round_key) {
            debug!(round_key = %job.round_key, "buyback already queued");
            return false;
        }
        if self.purged.lock().contains(&job.round_key) {
            warn!(
                block_id = job.round.block_id,
                exploration_index = job.round.exploration_index,
                round_key = %job.round_key,
                "replayed allocation for an executed buyback ignored"
            );
            return false;
        }
        let now = Instant::now();
        let delay = self.random_delay();
        entries.insert(
            job.round_key,
            BuybackEntry {
                job,
                enqueued_at: now,
                execute_at: now + delay,
                burn: StepProgress::for_amount(job.burn_amount),
                lp: StepProgress::for_amount(job.lp_amount),
                finished_at: None,
            },
        );
        info!(
            block_id = job.round.block_id,
            exploration_index = job.round.exploration_index,
            burn_amount = job.burn_amount,
            lp_amount = job.lp_amount,
            delay_secs = delay.as_secs(),
            "buyback scheduled"
        );
        true
    }

    pub fn status(&self, round_key: &Pubkey) -> Option<BuybackStatus> {
        self.entries.lock().get(round_key).map(BuybackEntry::status)
    }

    pub fn entry(&self, round_key: &Pubkey) -> Option<BuybackEntry> {
        self.entries.lock().get(round_key).cloned()
    }

    /// Entries not yet finished, soonest first.
    pub fn pending(&self) -> Vec<BuybackEntry> {
        let mut pending: Vec<BuybackEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| !e.is_settled())
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.execute_at);
        pending
    }

    /// Runs every due entry once. Returns how many were attempted.
    pub async fn process_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<BuybackEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| !e.is_settled() && e.execute_at <= now)
            .cloned()
            .collect();

        for mut entry in due.iter().cloned() {
            self.execute(&mut entry).await;
            if entry.is_settled() && entry.finished_at.is_none() {
                entry.finished_at = Some(Instant::now());
            }
            self.entries.lock().insert(entry.job.round_key, entry);
        }
        due.len()
    }

    /// Drops completed entries older than the retention window. Failed ones stay for inspection.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let mut entries = self.entries.lock();
        let mut purged = self.purged.lock();
        let before = entries.len();
        entries.retain(|key, e| {
            let expired = e.status() == BuybackStatus::Completed
                && e.finished_at.is_some_and(|t| now.duration_since(t) >= retention);
            if expired {
                purged.insert(*key);
            }
            !expired
        });
        before - entries.len()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.process_due().await;
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, "purged finished buybacks");
                    }
                }
            }
        }
        info!(pending = self.pending().len(), "buyback executor stopped");
    }

    // ----------------------------
    // Steps
    // ----------------------------

    async fn execute(&self, entry: &mut BuybackEntry) {
        let job = entry.job;
        // burn and LP are independent; one failing never holds up the other
        if !entry.burn.status.is_terminal() {
            let result = self.burn_step(&job, &mut entry.burn).await;
            self.record(&job, "burn", &mut entry.burn, result);
        }
        if !entry.lp.status.is_terminal() {
            let result = self.lp_step(&job, &mut entry.lp).await;
            self.record(&job, "lp", &mut entry.lp, result);
        }
    }

    fn record(
        &self,
        job: &BuybackJob,
        step: &'static str,
        progress: &mut StepProgress,
        result: OrchestratorResult<()>,
    ) {
        progress.attempts += 1;
        match result {
            Ok(()) => {
                progress.status = StepStatus::Done;
                info!(
                    block_id = job.round.block_id,
                    exploration_index = job.round.exploration_index,
                    step,
                    attempt = progress.attempts,
                    rig_acquired = progress.rig_acquired,
                    "buyback step done"
                );
            }
            Err(e) if progress.attempts >= self.config.max_attempts => {
                error!(
                    block_id = job.round.block_id,
                    exploration_index = job.round.exploration_index,
                    step,
                    attempt = progress.attempts,
                    fatal = true,
                    error = %e,
                    "buyback step failed permanently"
                );
                progress.status = StepStatus::Failed {
                    error: e.to_string(),
                };
            }
            Err(e) => {
                warn!(
                    block_id = job.round.block_id,
                    exploration_index = job.round.exploration_index,
                    step,
                    attempt = progress.attempts,
                    error = %e,
                    "buyback step failed, will retry"
                );
            }
        }
    }

    async fn burn_step(&self, job: &BuybackJob, progress: &mut StepProgress) -> OrchestratorResult<()> {
        let rig = match progress.rig_acquired {
            Some(rig) => rig,
            None => {
                let rig = self
                    .swap(job.asset_mint, self.config.rig_mint, job.burn_amount)
                    .await?;
                progress.rig_acquired = Some(rig);
                rig
            }
        };
        self.public.burn(self.config.rig_mint, rig).await
    }

    async fn lp_step(&self, job: &BuybackJob, progress: &mut StepProgress) -> OrchestratorResult<()> {
        let half = job.lp_amount / 2;
        let pair_amount = job.lp_amount - half;
        let rig = match progress.rig_acquired {
            Some(rig) => rig,
            None => {
                let rig = self.swap(job.asset_mint, self.config.rig_mint, half).await?;
                progress.rig_acquired = Some(rig);
                rig
            }
        };
        self.public
            .add_liquidity_locked(
                job.asset_mint,
                pair_amount,
                self.config.rig_mint,
                rig,
                self.config.lp_lock_months,
            )
            .await
    }

    /// Privacy route first when it is up, public venue otherwise.
    async fn swap(&self, input: Pubkey, output: Pubkey, amount: u64) -> OrchestratorResult<u64> {
        if amount == 0 {
            return Err(OrchestratorError::Venue("zero-amount swap".into()));
        }
        let slippage = self.config.max_slippage_bps;
        if let Some(privacy) = &self.privacy {
            if privacy.health_check().await {
                match privacy.swap(input, output, amount, slippage).await {
                    Ok(out) => return Ok(out),
                    Err(e) => warn!(
                        venue = privacy.name(),
                        error = %e,
                        "privacy swap failed, using public venue"
                    ),
                }
            } else {
                warn!(venue = privacy.name(), "privacy venue unhealthy, using public venue");
            }
        }
        self.public.swap(input, output, amount, slippage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedVenue {
        name: String,
        unhealthy: AtomicBool,
        fail_swaps: AtomicU32,
        fail_burns: AtomicU32,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedVenue {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl SwapVenue for ScriptedVenue {
        fn name(&self) -> &str {
            &self.name
        }

        async fn health_check(&self) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }

        async fn swap(&self, _input: Pubkey, _output: Pubkey, amount: u64, _slippage: u16) -> OrchestratorResult<u64> {
            if Self::take_failure(&self.fail_swaps) {
                return Err(OrchestratorError::Venue(format!("{} swap rejected", self.name)));
            }
            self.calls.lock().push(format!("swap {amount}"));
            Ok(amount * 2)
        }

        async fn burn(&self, _mint: Pubkey, amount: u64) -> OrchestratorResult<()> {
            if Self::take_failure(&self.fail_burns) {
                return Err(OrchestratorError::Venue("burn rejected".into()));
            }
            self.calls.lock().push(format!("burn {amount}"));
            Ok(())
        }

        async fn add_liquidity_locked(
            &self,
            _pair_mint: Pubkey,
            pair_amount: u64,
            _rig_mint: Pubkey,
            rig_amount: u64,
            lock_months: u32,
        ) -> OrchestratorResult<()> {
            self.calls
                .lock()
                .push(format!("lp {pair_amount}/{rig_amount} lock {lock_months}"));
            Ok(())
        }
    }

    fn job(burn_amount: u64, lp_amount: u64) -> BuybackJob {
        BuybackJob {
            round_key: Pubkey::new_unique(),
            round: RoundId::new(0, 1),
            asset_mint: Pubkey::new_unique(),
            burn_amount,
            lp_amount,
        }
    }

    fn executor(privacy: Option<Arc<ScriptedVenue>>, public: Arc<ScriptedVenue>) -> BuybackExecutor {
        BuybackExecutor::new(
            BuybackConfig {
                max_attempts: 3,
                ..BuybackConfig::default()
            },
            privacy.map(|p| p as Arc<dyn SwapVenue>),
            public,
        )
    }

    async fn after_max_delay() {
        tokio::time::advance(Duration::from_secs(DEFAULT_BUYBACK_MAX_DELAY_HOURS * 3600 + 1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_jobs_are_ignored_and_delay_is_bounded() {
        let exec = executor(None, ScriptedVenue::named("public"));
        let j = job(100, 100);
        assert!(exec.enqueue(j));
        assert!(!exec.enqueue(j));
        assert_eq!(exec.pending().len(), 1);

        let e = exec.entry(&j.round_key).unwrap();
        let delay = e.execute_at - e.enqueued_at;
        assert!(delay >= Duration::from_secs(DEFAULT_BUYBACK_MIN_DELAY_HOURS * 3600));
        assert!(delay <= Duration::from_secs(DEFAULT_BUYBACK_MAX_DELAY_HOURS * 3600));
        assert_eq!(exec.status(&j.round_key), Some(BuybackStatus::Scheduled));
    }

    #[tokio::test(start_paused = true)]
    async fn executes_burn_and_lp_after_delay() {
        let public = ScriptedVenue::named("public");
        let exec = executor(None, public.clone());
        let j = job(450, 451);
        exec.enqueue(j);

        assert_eq!(exec.process_due().await, 0);
        after_max_delay().await;
        assert_eq!(exec.process_due().await, 1);

        assert_eq!(exec.status(&j.round_key), Some(BuybackStatus::Completed));
        assert_eq!(
            public.calls(),
            vec![
                "swap 450".to_string(),
                "burn 900".to_string(),
                "swap 225".to_string(),
                "lp 226/450 lock 6".to_string(),
            ]
        );
        assert!(exec.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn privacy_route_first_with_public_fallback() {
        let privacy = ScriptedVenue::named("privacy");
        let public = ScriptedVenue::named("public");
        privacy.fail_swaps.store(1, Ordering::SeqCst);
        let exec = executor(Some(privacy.clone()), public.clone());
        exec.enqueue(job(100, 0));
        after_max_delay().await;
        exec.process_due().await;

        // privacy failed once: the burn swap went public
        assert_eq!(public.calls(), vec!["swap 100".to_string(), "burn 200".to_string()]);
        assert!(privacy.calls().is_empty());

        let j = job(10, 0);
        exec.enqueue(j);
        after_max_delay().await;
        exec.process_due().await;
        assert_eq!(privacy.calls(), vec!["swap 10".to_string()]);

        privacy.unhealthy.store(true, Ordering::SeqCst);
        exec.enqueue(job(7, 0));
        after_max_delay().await;
        exec.process_due().await;
        assert!(public.calls().contains(&"swap 7".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_burn_keeps_its_swap_and_does_not_block_lp() {
        let public = ScriptedVenue::named("public");
        public.fail_burns.store(1, Ordering::SeqCst);
        let exec = executor(None, public.clone());
        let j = job(50, 40);
        exec.enqueue(j);
        after_max_delay().await;

        exec.process_due().await;
        let e = exec.entry(&j.round_key).unwrap();
        assert_eq!(e.burn.status, StepStatus::Pending);
        assert_eq!(e.burn.rig_acquired, Some(100));
        assert_eq!(e.lp.status, StepStatus::Done);
        assert_eq!(exec.status(&j.round_key), Some(BuybackStatus::InProgress));

        exec.process_due().await;
        let swaps_of_50 = public.calls().iter().filter(|c| *c == "swap 50").count();
        assert_eq!(swaps_of_50, 1);
        assert_eq!(exec.status(&j.round_key), Some(BuybackStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn step_fails_after_max_attempts_and_is_kept() {
        let public = ScriptedVenue::named("public");
        public.fail_swaps.store(u32::MAX, Ordering::SeqCst);
        let exec = executor(None, public);
        let j = job(0, 40);
        exec.enqueue(j);
        after_max_delay().await;
        for _ in 0..3 {
            exec.process_due().await;
        }
        let e = exec.entry(&j.round_key).unwrap();
        assert_eq!(e.burn.status, StepStatus::Skipped);
        assert!(matches!(e.lp.status, StepStatus::Failed { .. }));
        assert_eq!(e.lp.attempts, 3);

        // no further attempts, and failures survive purging
        assert_eq!(exec.process_due().await, 0);
        tokio::time::advance(Duration::from_secs(BUYBACK_RETENTION_SECS + 1)).await;
        assert_eq!(exec.purge_expired(), 0);
        assert_eq!(exec.status(&j.round_key), Some(BuybackStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_entries_are_purged_after_retention() {
        let exec = executor(None, ScriptedVenue::named("public"));
        let j = job(10, 10);
        exec.enqueue(j);
        after_max_delay().await;
        exec.process_due().await;
        assert_eq!(exec.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(BUYBACK_RETENTION_SECS)).await;
        assert_eq!(exec.purge_expired(), 1);
        assert_eq!(exec.status(&j.round_key), None);

        // a late replay of the same allocation must not buy twice
        assert!(!exec.enqueue(j));
        assert_eq!(exec.status(&j.round_key), None);
        assert!(exec.pending().is_empty());
    }

    #[test]
    fn tombstones_stay_bounded() {
        let mut t = Tombstones::default();
        let first = Pubkey::new_unique();
        t.insert(first);
        for _ in 0..BUYBACK_TOMBSTONE_CAPACITY {
            t.insert(Pubkey::new_unique());
        }
        assert_eq!(t.keys.len(), BUYBACK_TOMBSTONE_CAPACITY);
        assert!(!t.contains(&first));
    }
}
