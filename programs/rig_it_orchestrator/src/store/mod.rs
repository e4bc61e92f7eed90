use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::OrchestratorResult;
use crate::events::LedgerEvent;
use crate::secrets::CommitSecret;
use crate::state::{BlockState, ExplorationState, RoundId};

pub mod memory;

pub use memory::MemoryLedger;

// ----------------------------
// Transitions
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Start,
    Commit,
    RollOver,
    Reveal,
    TimeoutFallback,
    AllocateBuyback,
    CarryForward,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::Commit => "commit",
            Step::RollOver => "rollover",
            Step::Reveal => "reveal",
            Step::TimeoutFallback => "timeout-fallback",
            Step::AllocateBuyback => "allocate-buyback",
            Step::CarryForward => "carry-forward",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (block, exploration index, step). The same key always names the same ledger effect,
/// so a restarted orchestrator can ask the ledger whether it already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub round: RoundId,
    pub step: Step,
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.round, self.step)
    }
}

/// A state change the orchestrator asks the ledger to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    StartExploration {
        round: RoundId,
    },
    CommitRandomness {
        round: RoundId,
        target_slot: u64,
        commit_hash: [u8; 32],
    },
    RollOver {
        round: RoundId,
    },
    RevealRandomness {
        round: RoundId,
        secret: CommitSecret,
    },
    RevealTimeoutFallback {
        round: RoundId,
    },
    AllocateBuyback {
        round: RoundId,
    },
    CarryForward {
        from: RoundId,
        to_index: u64,
    },
}

impl Transition {
    pub fn round(&self) -> RoundId {
        match self {
            Transition::StartExploration { round }
            | Transition::CommitRandomness { round, .. }
            | Transition::RollOver { round }
            | Transition::RevealRandomness { round, .. }
            | Transition::RevealTimeoutFallback { round }
            | Transition::AllocateBuyback { round } => *round,
            Transition::CarryForward { from, .. } => *from,
        }
    }

    pub fn step(&self) -> Step {
        match self {
            Transition::StartExploration { .. } => Step::Start,
            Transition::CommitRandomness { .. } => Step::Commit,
            Transition::RollOver { .. } => Step::RollOver,
            Transition::RevealRandomness { .. } => Step::Reveal,
            Transition::RevealTimeoutFallback { .. } => Step::TimeoutFallback,
            Transition::AllocateBuyback { .. } => Step::AllocateBuyback,
            Transition::CarryForward { .. } => Step::CarryForward,
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey {
            round: self.round(),
            step: self.step(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// This submission changed ledger state.
    Applied,
    /// The ledger already reflected this step; nothing changed.
    AlreadyApplied,
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub outcome: SubmitOutcome,
    pub events: Vec<LedgerEvent>,
}

// ----------------------------
// Ledger of record
// ----------------------------

/// Everything the orchestrator needs from the ledger of record.
/// Implementations map transport failures to `OrchestratorError::Transient`
/// and program errors to `OrchestratorError::Ledger`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn block(&self, block_id: u8) -> OrchestratorResult<BlockState>;

    async fn exploration(&self, round: RoundId) -> OrchestratorResult<Option<ExplorationState>>;

    async fn current_slot(&self) -> OrchestratorResult<u64>;

    /// Ledger clock (unix seconds). Phase decisions use this, not the host clock.
    async fn unix_timestamp(&self) -> OrchestratorResult<i64>;

    async fn submit(&self, transition: Transition) -> OrchestratorResult<SubmitReceipt>;

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;

    /// Whether the ledger offers a permissionless settle path once the reveal deadline passes.
    fn supports_timeout_fallback(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_name_round_and_step() {
        let t = Transition::CommitRandomness {
            round: RoundId::new(2, 17),
            target_slot: 1,
            commit_hash: [0; 32],
        };
        assert_eq!(t.key().to_string(), "2-17-commit");

        let carry = Transition::CarryForward {
            from: RoundId::new(0, 4),
            to_index: 5,
        };
        assert_eq!(carry.key().to_string(), "0-4-carry-forward");
    }

    #[test]
    fn reveal_transition_debug_hides_secret() {
        let t = Transition::RevealRandomness {
            round: RoundId::new(0, 1),
            secret: CommitSecret::from_bytes([0x5A; 32]),
        };
        let printed = format!("{t:?}");
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("90, 90"));
    }
}
