use serde::{Deserialize, Serialize};

use crate::constants::{
    BPS_DENOMINATOR, DEFAULT_BUYBACK_BURN_BPS, DEFAULT_BUYBACK_LP_BPS, DEFAULT_ECOSYSTEM_BPS,
    DEFAULT_TEAM_OPS_BPS, DEFAULT_WINNER_SHARE_BPS, RIGS_PER_EXPLORATION,
};
use crate::errors::{OrchestratorError, OrchestratorResult, RigItError};

// ----------------------------
// Fee split
// ----------------------------

/// Basis-point split of the remaining pool R. Validated once, at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub winner_share_bps: u16,
    pub buyback_burn_bps: u16,
    pub buyback_lp_bps: u16,
    pub team_ops_bps: u16,
    pub ecosystem_bps: u16,
}

impl Default for FeeSplit {
    fn default() -> Self {
        Self {
            winner_share_bps: DEFAULT_WINNER_SHARE_BPS,
            buyback_burn_bps: DEFAULT_BUYBACK_BURN_BPS,
            buyback_lp_bps: DEFAULT_BUYBACK_LP_BPS,
            team_ops_bps: DEFAULT_TEAM_OPS_BPS,
            ecosystem_bps: DEFAULT_ECOSYSTEM_BPS,
        }
    }
}

impl FeeSplit {
    pub fn validate(&self) -> OrchestratorResult<()> {
        let sum = self.winner_share_bps as u64
            + self.buyback_burn_bps as u64
            + self.buyback_lp_bps as u64
            + self.team_ops_bps as u64
            + self.ecosystem_bps as u64;
        if sum != BPS_DENOMINATOR {
            return Err(RigItError::InvalidFeeSplit.into());
        }
        Ok(())
    }
}

fn bps_of(amount: u64, bps: u16) -> u64 {
    // amount * 10_000 fits in u128, result <= amount
    (amount as u128 * bps as u128 / BPS_DENOMINATOR as u128) as u64
}

// ----------------------------
// Outputs
// ----------------------------

/// Downstream shares of R. Burn and LP go to the buyback executor;
/// ecosystem becomes the next exploration's rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuybackAllocation {
    pub burn: u64,
    pub lp: u64,
    pub team: u64,
    pub ecosystem: u64,
}

impl BuybackAllocation {
    pub fn from_remaining_pool(remaining_pool: u64, split: &FeeSplit) -> Self {
        Self {
            burn: bps_of(remaining_pool, split.buyback_burn_bps),
            lp: bps_of(remaining_pool, split.buyback_lp_bps),
            team: bps_of(remaining_pool, split.team_ops_bps),
            ecosystem: bps_of(remaining_pool, split.ecosystem_bps),
        }
    }

    pub fn total(&self) -> u64 {
        self.burn + self.lp + self.team + self.ecosystem
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub winning_rig: u8,
    pub total_deposits: u64,
    pub rollover_in: u64,
    /// W
    pub winner_deposits: u64,
    /// L
    pub loser_deposits: u64,
    /// L / 2, pool accounting only. Receipts are refunded one by one.
    pub loser_refund_total: u64,
    /// R = W + L/2 + rollover_in
    pub remaining_pool: u64,
    pub winner_pool: u64,
    pub winning_rig_tickets: u128,
    pub allocation: BuybackAllocation,
}

impl Payout {
    /// One winning receipt's share of the winner pool, pro rata by effective tickets.
    pub fn winner_share(&self, effective_tickets: u128) -> u64 {
        if self.winning_rig_tickets == 0 {
            return 0;
        }
        let share = self.winner_pool as u128 * effective_tickets / self.winning_rig_tickets;
        share.min(self.winner_pool as u128) as u64
    }

    /// Part of R that no allocation claims because of floor division.
    pub fn dust(&self) -> u64 {
        self.remaining_pool
            .saturating_sub(self.winner_pool)
            .saturating_sub(self.allocation.total())
    }

    pub fn next_rollover(&self) -> u64 {
        self.allocation.ecosystem
    }

    /// Compares the ledger's recorded W/L/R against the local calculation.
    pub fn check_ledger(&self, winner: u64, loser: u64, remaining: u64) -> OrchestratorResult<()> {
        if (winner, loser, remaining)
            != (self.winner_deposits, self.loser_deposits, self.remaining_pool)
        {
            return Err(OrchestratorError::SettlementMismatch(format!(
                "ledger W={winner} L={loser} R={remaining}, local W={} L={} R={}",
                self.winner_deposits, self.loser_deposits, self.remaining_pool
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    /// Threshold not met. This exploration's deposits move to the next one.
    RolledOver { carry: u64 },
    Settled(Payout),
}

// ----------------------------
// Calculator
// ----------------------------

pub fn meets_threshold(total_deposits: u64, min_threshold: u64) -> bool {
    total_deposits >= min_threshold
}

pub fn loser_refund(amount: u64) -> u64 {
    amount / 2
}

pub fn settle(
    rig_deposits: &[u64; RIGS_PER_EXPLORATION],
    rig_tickets: &[u128; RIGS_PER_EXPLORATION],
    rollover_in: u64,
    winning_rig: Option<u8>,
    split: &FeeSplit,
) -> OrchestratorResult<Settlement> {
    let total_deposits = rig_deposits
        .iter()
        .try_fold(0u64, |acc, d| acc.checked_add(*d))
        .ok_or(OrchestratorError::MathOverflow)?;

    // 1) no winner: this round's deposits carry, exactly
    let Some(win) = winning_rig else {
        return Ok(Settlement::RolledOver {
            carry: total_deposits,
        });
    };
    let idx = win as usize;
    if idx >= RIGS_PER_EXPLORATION {
        return Err(RigItError::InvalidRigIndex.into());
    }

    // 2) W / L
    let winner_deposits = rig_deposits[idx];
    let loser_deposits = total_deposits - winner_deposits;
    let loser_refund_total = loser_deposits / 2;

    // 3) R
    let remaining_pool = winner_deposits
        .checked_add(loser_refund_total)
        .and_then(|v| v.checked_add(rollover_in))
        .ok_or(OrchestratorError::MathOverflow)?;

    // 4) shares of R
    let winner_pool = bps_of(remaining_pool, split.winner_share_bps);
    let allocation = BuybackAllocation::from_remaining_pool(remaining_pool, split);

    Ok(Settlement::Settled(Payout {
        winning_rig: win,
        total_deposits,
        rollover_in,
        winner_deposits,
        loser_deposits,
        loser_refund_total,
        remaining_pool,
        winner_pool,
        winning_rig_tickets: rig_tickets[idx],
        allocation,
    }))
}
