use anchor_lang::prelude::*;
use anchor_lang::Event;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Prefix the runtime puts in front of `sol_log_data` payloads.
pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";

// ---------------------------
// Ledger events (wire format)
// ---------------------------

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationStarted {
    pub block_id: u8,
    pub exploration_index: u64,
    pub exploration_key: Pubkey,
    pub start_ts: i64,
    pub active_end_ts: i64,
    pub cooldown_end_ts: i64,
    pub rollover_amount: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositMade {
    pub user: Pubkey,
    pub block_id: u8,
    pub exploration_index: u64,
    pub exploration_key: Pubkey,
    pub rig_index: u8,
    pub amount: u64,
    pub effective_tickets: u128,
    pub is_anti_sniped: bool,
    pub deposit_receipt: Pubkey,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessCommitted {
    pub exploration_key: Pubkey,
    pub commit_slot: u64,
    pub reveal_deadline_slot: u64,
    pub commit_hash: [u8; 32],
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationSettled {
    pub block_id: u8,
    pub exploration_index: u64,
    pub exploration_key: Pubkey,
    pub winning_rig: u8,
    pub total_pool: u64,
    pub winner_deposits: u64,
    pub loser_deposits: u64,
    pub remaining_pool: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationRolledOver {
    pub block_id: u8,
    pub exploration_index: u64,
    pub exploration_key: Pubkey,
    pub total_deposits: u64,
    pub reason: String,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoserRefunded {
    pub user: Pubkey,
    pub exploration_key: Pubkey,
    pub deposit_receipt: Pubkey,
    pub original_amount: u64,
    pub refund_amount: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinningsClaimed {
    pub user: Pubkey,
    pub exploration_key: Pubkey,
    pub deposit_receipt: Pubkey,
    pub effective_tickets: u128,
    pub winning_amount: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuybackBudgetAllocated {
    pub exploration_key: Pubkey,
    pub remaining_pool: u64,
    pub burn_amount: u64,
    pub lp_amount: u64,
    pub team_amount: u64,
    pub ecosystem_amount: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundsCarriedForward {
    pub from_exploration: Pubkey,
    pub to_exploration: Pubkey,
    pub amount: u64,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiSnipedDepositClaimed {
    pub original_deposit: Pubkey,
    pub new_deposit: Pubkey,
    pub user: Pubkey,
    pub amount: u64,
    pub new_exploration: Pubkey,
}

#[event]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessTimeoutFallback {
    pub exploration_key: Pubkey,
    pub fallback_slot: u64,
    pub winning_rig: u8,
}

// ---------------------------
// Typed event stream
// ---------------------------

/// Every ledger event the orchestrator understands. Produced only by the decoder below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    ExplorationStarted(ExplorationStarted),
    DepositMade(DepositMade),
    RandomnessCommitted(RandomnessCommitted),
    ExplorationSettled(ExplorationSettled),
    ExplorationRolledOver(ExplorationRolledOver),
    LoserRefunded(LoserRefunded),
    WinningsClaimed(WinningsClaimed),
    BuybackBudgetAllocated(BuybackBudgetAllocated),
    FundsCarriedForward(FundsCarriedForward),
    AntiSnipedDepositClaimed(AntiSnipedDepositClaimed),
    RandomnessTimeoutFallback(RandomnessTimeoutFallback),
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::ExplorationStarted(_) => "ExplorationStarted",
            LedgerEvent::DepositMade(_) => "DepositMade",
            LedgerEvent::RandomnessCommitted(_) => "RandomnessCommitted",
            LedgerEvent::ExplorationSettled(_) => "ExplorationSettled",
            LedgerEvent::ExplorationRolledOver(_) => "ExplorationRolledOver",
            LedgerEvent::LoserRefunded(_) => "LoserRefunded",
            LedgerEvent::WinningsClaimed(_) => "WinningsClaimed",
            LedgerEvent::BuybackBudgetAllocated(_) => "BuybackBudgetAllocated",
            LedgerEvent::FundsCarriedForward(_) => "FundsCarriedForward",
            LedgerEvent::AntiSnipedDepositClaimed(_) => "AntiSnipedDepositClaimed",
            LedgerEvent::RandomnessTimeoutFallback(_) => "RandomnessTimeoutFallback",
        }
    }

    /// Discriminator + borsh payload, as the program logs it.
    pub fn data(&self) -> Vec<u8> {
        match self {
            LedgerEvent::ExplorationStarted(e) => e.data(),
            LedgerEvent::DepositMade(e) => e.data(),
            LedgerEvent::RandomnessCommitted(e) => e.data(),
            LedgerEvent::ExplorationSettled(e) => e.data(),
            LedgerEvent::ExplorationRolledOver(e) => e.data(),
            LedgerEvent::LoserRefunded(e) => e.data(),
            LedgerEvent::WinningsClaimed(e) => e.data(),
            LedgerEvent::BuybackBudgetAllocated(e) => e.data(),
            LedgerEvent::FundsCarriedForward(e) => e.data(),
            LedgerEvent::AntiSnipedDepositClaimed(e) => e.data(),
            LedgerEvent::RandomnessTimeoutFallback(e) => e.data(),
        }
    }

    pub fn to_log_line(&self) -> String {
        format!("{PROGRAM_DATA_PREFIX}{}", STANDARD.encode(self.data()))
    }
}

fn parse<E: Event>(payload: &[u8]) -> OrchestratorResult<E> {
    E::try_from_slice(payload).map_err(|e| OrchestratorError::Decode(e.to_string()))
}

/// Decodes the event bytes (discriminator first). `Ok(None)` for events this crate does not track.
pub fn decode_event_data(data: &[u8]) -> OrchestratorResult<Option<LedgerEvent>> {
    if data.len() < 8 {
        return Err(OrchestratorError::Decode(format!(
            "event payload of {} bytes has no discriminator",
            data.len()
        )));
    }
    let (disc, payload) = data.split_at(8);

    let event = if disc == ExplorationStarted::DISCRIMINATOR {
        LedgerEvent::ExplorationStarted(parse(payload)?)
    } else if disc == DepositMade::DISCRIMINATOR {
        LedgerEvent::DepositMade(parse(payload)?)
    } else if disc == RandomnessCommitted::DISCRIMINATOR {
        LedgerEvent::RandomnessCommitted(parse(payload)?)
    } else if disc == ExplorationSettled::DISCRIMINATOR {
        LedgerEvent::ExplorationSettled(parse(payload)?)
    } else if disc == ExplorationRolledOver::DISCRIMINATOR {
        LedgerEvent::ExplorationRolledOver(parse(payload)?)
    } else if disc == LoserRefunded::DISCRIMINATOR {
        LedgerEvent::LoserRefunded(parse(payload)?)
    } else if disc == WinningsClaimed::DISCRIMINATOR {
        LedgerEvent::WinningsClaimed(parse(payload)?)
    } else if disc == BuybackBudgetAllocated::DISCRIMINATOR {
        LedgerEvent::BuybackBudgetAllocated(parse(payload)?)
    } else if disc == FundsCarriedForward::DISCRIMINATOR {
        LedgerEvent::FundsCarriedForward(parse(payload)?)
    } else if disc == AntiSnipedDepositClaimed::DISCRIMINATOR {
        LedgerEvent::AntiSnipedDepositClaimed(parse(payload)?)
    } else if disc == RandomnessTimeoutFallback::DISCRIMINATOR {
        LedgerEvent::RandomnessTimeoutFallback(parse(payload)?)
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

/// One transaction log line. Lines that are not `Program data:` entries are ignored.
pub fn decode_log_line(line: &str) -> OrchestratorResult<Option<LedgerEvent>> {
    let Some(encoded) = line.trim().strip_prefix(PROGRAM_DATA_PREFIX) else {
        return Ok(None);
    };
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|e| OrchestratorError::Decode(e.to_string()))?;
    decode_event_data(&data)
}

pub fn decode_logs<'a, I>(lines: I) -> OrchestratorResult<Vec<LedgerEvent>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut events = Vec::new();
    for line in lines {
        if let Some(event) = decode_log_line(line)? {
            events.push(event);
        }
    }
    Ok(events)
}
