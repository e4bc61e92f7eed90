use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::state::RoundId;
use crate::utils::commit_hash;

/// 32-byte commit secret. Never printed, wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct CommitSecret([u8; 32]);

impl CommitSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn commit_hash(&self, target_slot: u64) -> [u8; 32] {
        commit_hash(&self.0, target_slot)
    }
}

impl std::fmt::Debug for CommitSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CommitSecret(<redacted>)")
    }
}

impl Drop for CommitSecret {
    fn drop(&mut self) {
        self.0.fill(0);
        std::hint::black_box(&self.0);
    }
}

/// What the orchestrator must remember between commit and reveal.
#[derive(Debug, Clone)]
pub struct PendingCommit {
    pub secret: CommitSecret,
    pub target_slot: u64,
    pub commit_hash: [u8; 32],
}

impl PendingCommit {
    pub fn new(secret: CommitSecret, target_slot: u64) -> Self {
        let commit_hash = secret.commit_hash(target_slot);
        Self {
            secret,
            target_slot,
            commit_hash,
        }
    }

    /// True if this secret is the one behind the hash recorded on the ledger.
    pub fn matches(&self, target_slot: u64, recorded_hash: &[u8; 32]) -> bool {
        self.target_slot == target_slot && self.commit_hash == *recorded_hash
    }
}

/// Process-local store of commit secrets, one per round.
/// Owned by the orchestrator instance; never shared across processes.
#[derive(Debug, Default)]
pub struct SecretVault {
    pending: Mutex<HashMap<RoundId, PendingCommit>>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the commit for `round` unless one is already held. Returns the one in force.
    pub fn insert_if_absent(&self, round: RoundId, commit: PendingCommit) -> PendingCommit {
        self.pending.lock().entry(round).or_insert(commit).clone()
    }

    pub fn get(&self, round: RoundId) -> Option<PendingCommit> {
        self.pending.lock().get(&round).cloned()
    }

    /// Removes and wipes the secret for `round`.
    pub fn discard(&self, round: RoundId) -> bool {
        self.pending.lock().remove(&round).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
