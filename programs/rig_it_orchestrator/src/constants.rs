// Centralized Orchestrator Constants

// Ticket Math
// ===========

/// Fixed-point scale shared by tickets and multipliers (1.0x == SCALE).
pub const SCALE: u64 = 1_000_000;

/// One whole RIG token in base units (9 decimals).
pub const ONE_TOKEN: u64 = 1_000_000_000;

/// Upper bound of the holding bonus, scaled. SCALE + MAX_BONUS == 3.0x.
pub const MAX_BONUS: u64 = 2_000_000;

/// Smallest deposit the ledger accepts (base units).
pub const MIN_DEPOSIT_AMOUNT: u64 = 1_000_000;

/// Number of rigs (buckets) in every exploration.
pub const RIGS_PER_EXPLORATION: usize = 36;

// Settlement split (basis points)
// ===============================

pub const BPS_DENOMINATOR: u64 = 10_000;

pub const DEFAULT_WINNER_SHARE_BPS: u16 = 5000;
pub const DEFAULT_BUYBACK_BURN_BPS: u16 = 1500;
pub const DEFAULT_BUYBACK_LP_BPS: u16 = 1500;
pub const DEFAULT_TEAM_OPS_BPS: u16 = 1000;
pub const DEFAULT_ECOSYSTEM_BPS: u16 = 1000;

// Timing (seconds)
// ================

/// Length of the deposit window, anti-snipe tail included. 2 hours.
pub const DEFAULT_ACTIVE_DURATION_SECS: i64 = 7200;

/// Gap between active end and the next exploration. 40 minutes.
pub const DEFAULT_COOLDOWN_DURATION_SECS: i64 = 2400;

/// Trailing part of the active window where deposits roll to the next round.
pub const DEFAULT_ANTI_SNIPE_WINDOW_SECS: i64 = 300;

/// Finalize fires this long after active end to avoid racing the boundary.
pub const FINALIZE_BUFFER_SECS: i64 = 5;

// Commit-reveal (slots)
// =====================

/// Commit target is placed this many slots after the slot observed at commit time.
/// 20 slots ~ 8 seconds (@ 0.4s/slot).
pub const COMMIT_TARGET_OFFSET_SLOTS: u64 = 20;

/// The ledger rejects a target closer than this to the current slot.
pub const MIN_COMMIT_LEAD_SLOTS: u64 = 10;

/// Reveal deadline = target slot + this timeout. After it, only the fallback path applies.
/// 150 slots ~ 1 minute (@ 0.4s/slot).
pub const COMMIT_REVEAL_TIMEOUT_SLOTS: u64 = 150;

/// Poll interval while waiting for the target slot.
pub const SLOT_POLL_INTERVAL_MS: u64 = 400;

// Scheduler
// =========

/// Safety-net rescan of every block's current exploration.
pub const RESCAN_INTERVAL_SECS: u64 = 60;

/// Default ceiling on total time spent retrying one submission.
pub const DEFAULT_RETRY_MAX_ELAPSED_SECS: u64 = 120;

pub const RETRY_INITIAL_INTERVAL_MS: u64 = 500;
pub const RETRY_MAX_INTERVAL_SECS: u64 = 15;

// Buyback
// =======

pub const DEFAULT_BUYBACK_MIN_DELAY_HOURS: u64 = 2;
pub const DEFAULT_BUYBACK_MAX_DELAY_HOURS: u64 = 5;

/// 1% max slippage on buyback swaps.
pub const MAX_SLIPPAGE_BPS: u16 = 100;

/// Liquidity added by buybacks stays locked this many months.
pub const LP_LOCK_MONTHS: u32 = 6;

/// Executed buybacks are forgotten after 24h.
pub const BUYBACK_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Round keys of purged buybacks remembered so a replayed allocation is not run again.
pub const BUYBACK_TOMBSTONE_CAPACITY: usize = 4096;

// Seeds
// =====

pub const EXPLORATION_SEED: &[u8] = b"exploration";
pub const BLOCK_SEED: &[u8] = b"block";
pub const RECEIPT_SEED: &[u8] = b"receipt";

// Blocks
// ======

pub const SOL_BLOCK_ID: u8 = 0;
pub const PUMP_BLOCK_ID: u8 = 1;
pub const SKR_BLOCK_ID: u8 = 2;

/// 1 SOL.
pub const DEFAULT_SOL_MIN_THRESHOLD: u64 = 1_000_000_000;
/// 100 PUMP (9 decimals).
pub const DEFAULT_PUMP_MIN_THRESHOLD: u64 = 100_000_000_000;
/// 50 SKR (9 decimals).
pub const DEFAULT_SKR_MIN_THRESHOLD: u64 = 50_000_000_000;
