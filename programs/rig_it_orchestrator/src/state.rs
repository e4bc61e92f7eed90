use anchor_lang::prelude::*;

use crate::constants::{BLOCK_SEED, EXPLORATION_SEED, RECEIPT_SEED, RIGS_PER_EXPLORATION};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::utils::{ExplorationTiming, TimingParams};

// -----------------
// Addresses
// -----------------

pub fn block_address(program_id: &Pubkey, block_id: u8) -> Pubkey {
    Pubkey::find_program_address(&[BLOCK_SEED, &[block_id]], program_id).0
}

/// Exploration PDA. Doubles as the round key handed to the buyback executor.
pub fn exploration_address(program_id: &Pubkey, block_id: u8, exploration_index: u64) -> Pubkey {
    Pubkey::find_program_address(
        &[
            EXPLORATION_SEED,
            &[block_id],
            &exploration_index.to_le_bytes(),
        ],
        program_id,
    )
    .0
}

pub fn receipt_address(program_id: &Pubkey, exploration: &Pubkey, rig_index: u8, user: &Pubkey, nonce: u64) -> Pubkey {
    Pubkey::find_program_address(
        &[
            RECEIPT_SEED,
            exploration.as_ref(),
            &[rig_index],
            user.as_ref(),
            &nonce.to_le_bytes(),
        ],
        program_id,
    )
    .0
}

// -----------------
// Round identity
// -----------------

/// (block, exploration index). Every log line and task about a round carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoundId {
    pub block_id: u8,
    pub exploration_index: u64,
}

impl RoundId {
    pub fn new(block_id: u8, exploration_index: u64) -> Self {
        Self {
            block_id,
            exploration_index,
        }
    }

    pub fn address(&self, program_id: &Pubkey) -> Pubkey {
        exploration_address(program_id, self.block_id, self.exploration_index)
    }
}

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.block_id, self.exploration_index)
    }
}

// -----------------
// Block
// -----------------

#[account]
#[derive(Debug, PartialEq, Eq)]
pub struct BlockState {
    pub block_id: u8,
    pub asset_mint: Pubkey,
    pub asset_decimals: u8,
    pub min_threshold: u64,
    /// Index the NEXT exploration will get. Incremented at every start.
    pub current_exploration_index: u64,
    pub paused: bool,
    pub total_volume: u128,
    pub total_explorations_completed: u64,
}

impl BlockState {
    /// Index of the most recently started exploration, if any.
    pub fn latest_exploration_index(&self) -> Option<u64> {
        self.current_exploration_index.checked_sub(1)
    }
}

// -----------------
// Exploration
// -----------------

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExplorationStatus {
    #[default]
    Pending,
    Active,
    Finalizing,
    Settled,
    RolledOver,
}

impl ExplorationStatus {
    pub fn is_final(self) -> bool {
        matches!(self, ExplorationStatus::Settled | ExplorationStatus::RolledOver)
    }
}

#[account]
#[derive(Debug, PartialEq, Eq)]
pub struct ExplorationState {
    pub block_id: u8,
    pub exploration_index: u64,
    pub status: ExplorationStatus,

    pub start_slot: u64,
    pub start_ts: i64,
    pub active_end_ts: i64,
    pub cooldown_end_ts: i64,

    // Deposits (anti-sniped ones excluded)
    pub total_deposits: u64,
    pub rig_deposits: [u64; RIGS_PER_EXPLORATION],
    pub rig_tickets: [u128; RIGS_PER_EXPLORATION],
    pub rollover_amount: u64,

    // Commit-reveal
    pub commit_slot: u64,
    pub commit_hash: [u8; 32],
    pub reveal_deadline_slot: u64,
    pub revealed_random: Option<[u8; 32]>,

    pub winning_rig: Option<u8>,

    // Idempotency flags, false -> true once
    pub loser_refunds_processed: bool,
    pub winner_distribution_processed: bool,
    pub buyback_allocated: bool,
    pub carry_forward_done: bool,

    // Set at settlement: W, L, R
    pub total_winner_deposits: u64,
    pub total_loser_deposits: u64,
    pub remaining_pool: u64,
}

impl Default for ExplorationState {
    fn default() -> Self {
        Self {
            block_id: 0,
            exploration_index: 0,
            status: ExplorationStatus::default(),
            start_slot: 0,
            start_ts: 0,
            active_end_ts: 0,
            cooldown_end_ts: 0,
            total_deposits: 0,
            rig_deposits: [0u64; RIGS_PER_EXPLORATION],
            rig_tickets: [0u128; RIGS_PER_EXPLORATION],
            rollover_amount: 0,
            commit_slot: 0,
            commit_hash: [0u8; 32],
            reveal_deadline_slot: 0,
            revealed_random: None,
            winning_rig: None,
            loser_refunds_processed: false,
            winner_distribution_processed: false,
            buyback_allocated: false,
            carry_forward_done: false,
            total_winner_deposits: 0,
            total_loser_deposits: 0,
            remaining_pool: 0,
        }
    }
}

impl ExplorationState {
    pub fn timing(&self, params: &TimingParams) -> ExplorationTiming {
        ExplorationTiming::from_ledger(self.start_ts, self.active_end_ts, self.cooldown_end_ts, params)
    }

    /// Deposits plus rollover.
    pub fn total_pool(&self) -> u64 {
        self.total_deposits.saturating_add(self.rollover_amount)
    }

    pub fn is_committed(&self) -> bool {
        self.commit_hash != [0u8; 32]
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_final()
    }

    /// Nothing the orchestrator owns is left to do for this exploration.
    pub fn is_fully_processed(&self) -> bool {
        match self.status {
            ExplorationStatus::Settled => self.buyback_allocated,
            ExplorationStatus::RolledOver => self.carry_forward_done,
            _ => false,
        }
    }

    /// Structural invariants every snapshot read from the ledger must satisfy.
    pub fn check_invariants(&self) -> OrchestratorResult<()> {
        let sum = self
            .rig_deposits
            .iter()
            .try_fold(0u64, |acc, d| acc.checked_add(*d))
            .ok_or(OrchestratorError::MathOverflow)?;
        if sum != self.total_deposits {
            return Err(OrchestratorError::SettlementMismatch(format!(
                "rig deposits sum {sum} != total {}",
                self.total_deposits
            )));
        }

        let consistent = match self.status {
            ExplorationStatus::Settled => self.winning_rig.is_some(),
            ExplorationStatus::RolledOver => self.winning_rig.is_none(),
            _ => self.winning_rig.is_none(),
        };
        if !consistent {
            return Err(OrchestratorError::SettlementMismatch(format!(
                "status {:?} with winning rig {:?}",
                self.status, self.winning_rig
            )));
        }
        if let Some(rig) = self.winning_rig {
            if rig as usize >= RIGS_PER_EXPLORATION {
                return Err(OrchestratorError::SettlementMismatch(format!(
                    "winning rig {rig} out of range"
                )));
            }
        }
        Ok(())
    }
}

// -----------------
// Rig + receipts
// -----------------

#[account]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RigState {
    pub exploration: Pubkey,
    pub rig_index: u8,
    pub total_deposits: u64,
    pub total_tickets: u128,
    pub deposit_count: u32,
}

#[account]
#[derive(Debug, PartialEq, Eq)]
pub struct DepositReceipt {
    pub user: Pubkey,
    pub rig_index: u8,
    pub exploration: Pubkey,
    pub amount: u64,
    pub effective_tickets: u128,
    pub deposited_at: i64,
    pub deposit_nonce: u64,
    pub is_anti_sniped: bool,
    pub rolled_to_exploration: Option<Pubkey>,
    pub refund_claimed: bool,
    pub winnings_claimed: bool,
}

impl DepositReceipt {
    pub fn is_claimed(&self) -> bool {
        self.refund_claimed || self.winnings_claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_lang::{AccountDeserialize, AccountSerialize};

    fn settled_exploration() -> ExplorationState {
        let mut e = ExplorationState {
            block_id: 1,
            exploration_index: 7,
            status: ExplorationStatus::Settled,
            total_deposits: 100,
            winning_rig: Some(3),
            ..Default::default()
        };
        e.rig_deposits[3] = 30;
        e.rig_deposits[7] = 70;
        e
    }

    #[test]
    fn invariants_accept_consistent_settlement() {
        assert!(settled_exploration().check_invariants().is_ok());
    }

    #[test]
    fn invariants_reject_deposit_sum_drift() {
        let mut e = settled_exploration();
        e.total_deposits = 101;
        assert!(e.check_invariants().is_err());
    }

    #[test]
    fn invariants_reject_winner_on_rollover() {
        let mut e = settled_exploration();
        e.status = ExplorationStatus::RolledOver;
        assert!(e.check_invariants().is_err());
        e.winning_rig = None;
        assert!(e.check_invariants().is_ok());
    }

    #[test]
    fn fully_processed_depends_on_outcome_flag() {
        let mut e = settled_exploration();
        assert!(!e.is_fully_processed());
        e.buyback_allocated = true;
        assert!(e.is_fully_processed());

        e.status = ExplorationStatus::RolledOver;
        e.winning_rig = None;
        assert!(!e.is_fully_processed());
        e.carry_forward_done = true;
        assert!(e.is_fully_processed());
    }

    #[test]
    fn account_data_round_trips_with_discriminator() {
        let e = settled_exploration();
        let mut data = Vec::new();
        e.try_serialize(&mut data).unwrap();
        assert_eq!(&data[..8], ExplorationState::DISCRIMINATOR);

        let mut slice: &[u8] = &data;
        let back = ExplorationState::try_deserialize(&mut slice).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn exploration_addresses_are_distinct_per_block_and_index() {
        let program = crate::ID;
        let a = exploration_address(&program, 0, 1);
        assert_eq!(a, exploration_address(&program, 0, 1));
        assert_ne!(a, exploration_address(&program, 0, 2));
        assert_ne!(a, exploration_address(&program, 1, 1));
        assert_ne!(block_address(&program, 0), block_address(&program, 1));
    }

    #[test]
    fn latest_index_lags_next_index() {
        let mut b = BlockState {
            block_id: 0,
            asset_mint: Pubkey::default(),
            asset_decimals: 9,
            min_threshold: 1,
            current_exploration_index: 0,
            paused: false,
            total_volume: 0,
            total_explorations_completed: 0,
        };
        assert_eq!(b.latest_exploration_index(), None);
        b.current_exploration_index = 4;
        assert_eq!(b.latest_exploration_index(), Some(3));
    }
}
