use solana_sha256_hasher::hashv;

use crate::constants::RIGS_PER_EXPLORATION;

// -------------------------
// Commit-reveal hashing
// -------------------------

/// sha256(secret || target_slot_le). Must match what the ledger recomputes at reveal.
pub fn commit_hash(secret: &[u8; 32], target_slot: u64) -> [u8; 32] {
    hashv(&[secret.as_ref(), target_slot.to_le_bytes().as_ref()]).to_bytes()
}

pub fn verify_reveal(secret: &[u8; 32], target_slot: u64, expected: &[u8; 32]) -> bool {
    commit_hash(secret, target_slot) == *expected
}

/// Final entropy: sha256(secret || slot_hash of the target slot).
/// The slot hash is unknown at commit time, so neither side can precompute the result.
pub fn derive_entropy(secret: &[u8; 32], slot_hash: &[u8; 32]) -> [u8; 32] {
    hashv(&[secret.as_ref(), slot_hash.as_ref()]).to_bytes()
}

// -------------------------
// Weighted rig selection
// -------------------------

/// Picks the rig owning ticket number `u128_le(entropy[..16]) % total`.
/// Rigs are walked in index order; `None` when no tickets exist.
pub fn select_winning_rig(
    entropy: &[u8; 32],
    rig_tickets: &[u128; RIGS_PER_EXPLORATION],
) -> Option<u8> {
    let total = rig_tickets
        .iter()
        .try_fold(0u128, |acc, t| acc.checked_add(*t))?;
    if total == 0 {
        return None;
    }

    let mut low = [0u8; 16];
    low.copy_from_slice(&entropy[..16]);
    let winning_ticket = u128::from_le_bytes(low) % total;

    let mut cumulative: u128 = 0;
    for (i, tickets) in rig_tickets.iter().enumerate() {
        cumulative += *tickets;
        if winning_ticket < cumulative {
            return Some(i as u8);
        }
    }
    None
}
