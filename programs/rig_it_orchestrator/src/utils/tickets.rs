use crate::constants::{MAX_BONUS, ONE_TOKEN, SCALE};

/// Floor square root via Newton's method. Integer-only so results match the ledger bit-for-bit.
pub fn integer_sqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }

    let mut x = n;
    // (x + 1) / 2 without overflowing at u128::MAX
    let mut y = x / 2 + (x & 1);
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

/// Sublinear ticket weight: sqrt(amount * SCALE).
pub fn base_tickets(amount: u64) -> u128 {
    if amount == 0 {
        return 0;
    }
    integer_sqrt(amount as u128 * SCALE as u128)
}

/// Holding multiplier scaled by SCALE, from 1.0x up to 3.0x.
pub fn rig_multiplier(holding_balance: u64) -> u64 {
    if holding_balance == 0 {
        return SCALE;
    }
    let scaled = holding_balance as u128 * SCALE as u128 / ONE_TOKEN as u128;
    let bonus = integer_sqrt(scaled).min(MAX_BONUS as u128) as u64;
    SCALE + bonus
}

pub fn effective_tickets(amount: u64, holding_balance: u64) -> u128 {
    base_tickets(amount) * rig_multiplier(holding_balance) as u128 / SCALE as u128
}
