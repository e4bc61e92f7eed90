use anchor_lang::error::ERROR_CODE_OFFSET;
use anchor_lang::prelude::error_code;
use thiserror::Error;

/// Error catalogue of the Rig It ledger program. Order fixes the on-chain codes
/// (6000 + index), so new variants only ever go at the end.
#[error_code]
#[derive(PartialEq, Eq)]
pub enum RigItError {
    #[msg("Protocol is paused")]
    ProtocolPaused,
    #[msg("Block is paused")]
    BlockPaused,
    #[msg("Exploration not active")]
    ExplorationNotActive,
    #[msg("Exploration not settled")]
    ExplorationNotSettled,
    #[msg("Exploration not in finalizing state")]
    ExplorationNotFinalizing,
    #[msg("Exploration already finalized")]
    ExplorationAlreadyFinalized,
    #[msg("Invalid rig index (must be 0-35)")]
    InvalidRigIndex,
    #[msg("Deposit amount too small")]
    DepositTooSmall,
    #[msg("Randomness already committed")]
    RandomnessAlreadyCommitted,
    #[msg("Commit slot must be in future")]
    CommitSlotNotFuture,
    #[msg("Reveal deadline passed")]
    RevealDeadlinePassed,
    #[msg("Reveal deadline not yet passed")]
    RevealDeadlineNotPassed,
    #[msg("Reveal too early - target slot not reached")]
    RevealTooEarly,
    #[msg("Invalid reveal secret - hash mismatch")]
    InvalidRevealSecret,
    #[msg("Refund already claimed")]
    RefundAlreadyClaimed,
    #[msg("Winnings already claimed")]
    WinningsAlreadyClaimed,
    #[msg("Not a winner - cannot claim winnings")]
    NotAWinner,
    #[msg("Not a loser - cannot claim refund")]
    NotALoser,
    #[msg("Threshold not met for draw")]
    ThresholdNotMet,
    #[msg("Arithmetic overflow")]
    ArithmeticOverflow,
    #[msg("Unauthorized - invalid signer")]
    Unauthorized,
    #[msg("Previous exploration not finalized")]
    PreviousNotFinalized,
    #[msg("Buyback already allocated")]
    BuybackAlreadyAllocated,
    #[msg("Invalid fee split configuration - must sum to 10000 bps")]
    InvalidFeeSplit,
    #[msg("Block ID already exists")]
    BlockIdExists,
    #[msg("Invalid block ID")]
    InvalidBlockId,
    #[msg("Deposit is not anti-sniped")]
    DepositNotAntiSniped,
    #[msg("Deposit already rolled over")]
    DepositAlreadyRolledOver,
    #[msg("Active phase not ended")]
    ActivePhaseNotEnded,
    #[msg("Cooldown not ended")]
    CooldownNotEnded,
    #[msg("Carry forward already done")]
    CarryForwardAlreadyDone,
    #[msg("Invalid exploration status for this operation")]
    InvalidExplorationStatus,
    #[msg("No randomness revealed")]
    NoRandomnessRevealed,
    #[msg("Slot hash not available")]
    SlotHashNotAvailable,
}

const ALL_LEDGER_ERRORS: [RigItError; 34] = [
    RigItError::ProtocolPaused,
    RigItError::BlockPaused,
    RigItError::ExplorationNotActive,
    RigItError::ExplorationNotSettled,
    RigItError::ExplorationNotFinalizing,
    RigItError::ExplorationAlreadyFinalized,
    RigItError::InvalidRigIndex,
    RigItError::DepositTooSmall,
    RigItError::RandomnessAlreadyCommitted,
    RigItError::CommitSlotNotFuture,
    RigItError::RevealDeadlinePassed,
    RigItError::RevealDeadlineNotPassed,
    RigItError::RevealTooEarly,
    RigItError::InvalidRevealSecret,
    RigItError::RefundAlreadyClaimed,
    RigItError::WinningsAlreadyClaimed,
    RigItError::NotAWinner,
    RigItError::NotALoser,
    RigItError::ThresholdNotMet,
    RigItError::ArithmeticOverflow,
    RigItError::Unauthorized,
    RigItError::PreviousNotFinalized,
    RigItError::BuybackAlreadyAllocated,
    RigItError::InvalidFeeSplit,
    RigItError::BlockIdExists,
    RigItError::InvalidBlockId,
    RigItError::DepositNotAntiSniped,
    RigItError::DepositAlreadyRolledOver,
    RigItError::ActivePhaseNotEnded,
    RigItError::CooldownNotEnded,
    RigItError::CarryForwardAlreadyDone,
    RigItError::InvalidExplorationStatus,
    RigItError::NoRandomnessRevealed,
    RigItError::SlotHashNotAvailable,
];

impl RigItError {
    /// Maps a custom program error code (as found in a failed transaction) back to the variant.
    pub fn from_code(code: u32) -> Option<Self> {
        let idx = code.checked_sub(ERROR_CODE_OFFSET)? as usize;
        ALL_LEDGER_ERRORS.get(idx).copied()
    }

    pub fn code(self) -> u32 {
        self.into()
    }

    /// The ledger refused because this exact step already happened.
    /// For orchestrator submissions that means "confirmed", not "failed".
    pub fn is_already_applied(self) -> bool {
        matches!(
            self,
            RigItError::RandomnessAlreadyCommitted
                | RigItError::ExplorationAlreadyFinalized
                | RigItError::BuybackAlreadyAllocated
                | RigItError::CarryForwardAlreadyDone
        )
    }

    pub fn class(self) -> ErrorClass {
        use RigItError::*;
        match self {
            RevealTooEarly
            | InvalidRevealSecret
            | RevealDeadlinePassed
            | RefundAlreadyClaimed
            | WinningsAlreadyClaimed
            | NotAWinner
            | NotALoser
            | RandomnessAlreadyCommitted
            | ExplorationAlreadyFinalized
            | BuybackAlreadyAllocated
            | CarryForwardAlreadyDone
            | DepositNotAntiSniped
            | DepositAlreadyRolledOver => ErrorClass::ProtocolViolation,
            // the slot hash aged out of history: no later submission can succeed
            SlotHashNotAvailable => ErrorClass::Fatal,
            _ => ErrorClass::Contract,
        }
    }
}

/// How a failure must be handled. Only `Transient` is ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Contract,
    ProtocolViolation,
    Fatal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("ledger rejected transition ({}): {0}", .0.code())]
    Ledger(RigItError),

    #[error("commit secret lost for block {block_id} exploration {exploration_index}")]
    SecretLost { block_id: u8, exploration_index: u64 },

    #[error("{step} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        step: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("reveal deadline passed and no fallback path for block {block_id} exploration {exploration_index}")]
    NoFallback { block_id: u8, exploration_index: u64 },

    #[error("ledger settlement disagrees with local calculation: {0}")]
    SettlementMismatch(String),

    #[error("swap venue: {0}")]
    Venue(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("math overflow")]
    MathOverflow,

    #[error("cannot decode ledger event: {0}")]
    Decode(String),

    #[error("orchestrator is shutting down")]
    Shutdown,
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Transient(_) | OrchestratorError::Venue(_) => ErrorClass::Transient,
            OrchestratorError::Ledger(e) => e.class(),
            OrchestratorError::SettlementMismatch(_) => ErrorClass::ProtocolViolation,
            OrchestratorError::Config(_) | OrchestratorError::Decode(_) => ErrorClass::Contract,
            OrchestratorError::SecretLost { .. }
            | OrchestratorError::RetriesExhausted { .. }
            | OrchestratorError::NoFallback { .. }
            | OrchestratorError::MathOverflow
            | OrchestratorError::Shutdown => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<RigItError> for OrchestratorError {
    fn from(e: RigItError) -> Self {
        OrchestratorError::Ledger(e)
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_catalogue() {
        for (i, e) in ALL_LEDGER_ERRORS.iter().enumerate() {
            assert_eq!(e.code(), ERROR_CODE_OFFSET + i as u32);
            assert_eq!(RigItError::from_code(e.code()), Some(*e));
        }
        assert_eq!(RigItError::from_code(6000), Some(RigItError::ProtocolPaused));
        assert_eq!(RigItError::from_code(6013), Some(RigItError::InvalidRevealSecret));
        assert_eq!(RigItError::from_code(5999), None);
        assert_eq!(RigItError::from_code(6034), None);
    }

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(RigItError::InvalidRigIndex.class(), ErrorClass::Contract);
        assert_eq!(RigItError::DepositTooSmall.class(), ErrorClass::Contract);
        assert_eq!(RigItError::Unauthorized.class(), ErrorClass::Contract);
        assert_eq!(RigItError::InvalidRevealSecret.class(), ErrorClass::ProtocolViolation);
        assert_eq!(RigItError::RevealTooEarly.class(), ErrorClass::ProtocolViolation);
        assert_eq!(RigItError::RefundAlreadyClaimed.class(), ErrorClass::ProtocolViolation);
        assert_eq!(RigItError::SlotHashNotAvailable.class(), ErrorClass::Fatal);

        assert!(OrchestratorError::Transient("timeout".into()).is_retryable());
        assert!(!OrchestratorError::Ledger(RigItError::InvalidRevealSecret).is_retryable());
        assert_eq!(
            OrchestratorError::SecretLost { block_id: 0, exploration_index: 3 }.class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn already_applied_is_limited_to_orchestrator_steps() {
        assert!(RigItError::BuybackAlreadyAllocated.is_already_applied());
        assert!(RigItError::CarryForwardAlreadyDone.is_already_applied());
        assert!(!RigItError::RefundAlreadyClaimed.is_already_applied());
    }

    #[test]
    fn ledger_error_display_carries_code_and_message() {
        let e = OrchestratorError::Ledger(RigItError::InvalidRevealSecret);
        assert_eq!(
            e.to_string(),
            "ledger rejected transition (6013): Invalid reveal secret - hash mismatch"
        );
    }
}
