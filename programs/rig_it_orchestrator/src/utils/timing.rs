use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ACTIVE_DURATION_SECS, DEFAULT_ANTI_SNIPE_WINDOW_SECS, DEFAULT_COOLDOWN_DURATION_SECS,
    FINALIZE_BUFFER_SECS,
};
use crate::errors::{OrchestratorError, OrchestratorResult};

/// Durations shared by every exploration of a protocol deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingParams {
    active_duration_secs: i64,
    cooldown_duration_secs: i64,
    anti_snipe_window_secs: i64,
}

impl TimingParams {
    pub fn new(
        active_duration_secs: i64,
        cooldown_duration_secs: i64,
        anti_snipe_window_secs: i64,
    ) -> OrchestratorResult<Self> {
        if active_duration_secs <= 0 {
            return Err(OrchestratorError::Config(
                "active duration must be positive".into(),
            ));
        }
        if cooldown_duration_secs < 0 || anti_snipe_window_secs < 0 {
            return Err(OrchestratorError::Config(
                "cooldown and anti-snipe durations cannot be negative".into(),
            ));
        }
        if anti_snipe_window_secs > active_duration_secs {
            return Err(OrchestratorError::Config(
                "anti-snipe window longer than the active window".into(),
            ));
        }
        Ok(Self {
            active_duration_secs,
            cooldown_duration_secs,
            anti_snipe_window_secs,
        })
    }

    pub fn active_duration_secs(&self) -> i64 {
        self.active_duration_secs
    }

    pub fn cooldown_duration_secs(&self) -> i64 {
        self.cooldown_duration_secs
    }

    pub fn anti_snipe_window_secs(&self) -> i64 {
        self.anti_snipe_window_secs
    }

    /// Full cycle length from one start to the next.
    pub fn cycle_secs(&self) -> i64 {
        self.active_duration_secs + self.cooldown_duration_secs
    }

    pub fn for_start(&self, start_ts: i64) -> ExplorationTiming {
        let active_end_ts = start_ts + self.active_duration_secs;
        ExplorationTiming {
            start_ts,
            anti_snipe_start_ts: active_end_ts - self.anti_snipe_window_secs,
            active_end_ts,
            cooldown_end_ts: active_end_ts + self.cooldown_duration_secs,
        }
    }
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            active_duration_secs: DEFAULT_ACTIVE_DURATION_SECS,
            cooldown_duration_secs: DEFAULT_COOLDOWN_DURATION_SECS,
            anti_snipe_window_secs: DEFAULT_ANTI_SNIPE_WINDOW_SECS,
        }
    }
}

/// Ordered so that `a < b` means `a` comes earlier in the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Active,
    AntiSnipe,
    Cooldown,
    Ended,
}

/// Phase boundaries of one exploration (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplorationTiming {
    pub start_ts: i64,
    pub anti_snipe_start_ts: i64,
    pub active_end_ts: i64,
    pub cooldown_end_ts: i64,
}

impl ExplorationTiming {
    /// Boundaries as recorded by the ledger. The anti-snipe start is re-derived from params.
    pub fn from_ledger(
        start_ts: i64,
        active_end_ts: i64,
        cooldown_end_ts: i64,
        params: &TimingParams,
    ) -> Self {
        Self {
            start_ts,
            anti_snipe_start_ts: active_end_ts - params.anti_snipe_window_secs,
            active_end_ts,
            cooldown_end_ts,
        }
    }

    pub fn phase(&self, now: i64) -> Phase {
        if now < self.anti_snipe_start_ts {
            Phase::Active
        } else if now < self.active_end_ts {
            Phase::AntiSnipe
        } else if now < self.cooldown_end_ts {
            Phase::Cooldown
        } else {
            Phase::Ended
        }
    }

    /// Seconds until the boundary that ends the current phase, floored at 0.
    pub fn time_remaining(&self, now: i64) -> i64 {
        let boundary = match self.phase(now) {
            Phase::Active => self.anti_snipe_start_ts,
            Phase::AntiSnipe => self.active_end_ts,
            Phase::Cooldown | Phase::Ended => self.cooldown_end_ts,
        };
        (boundary - now).max(0)
    }

    pub fn is_anti_sniped(&self, deposit_ts: i64) -> bool {
        deposit_ts >= self.anti_snipe_start_ts
    }

    /// Wall-clock time the orchestrator should start finalization.
    pub fn finalize_at(&self) -> i64 {
        self.active_end_ts + FINALIZE_BUFFER_SECS
    }

    pub fn start_next_at(&self) -> i64 {
        self.cooldown_end_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_timing() -> ExplorationTiming {
        TimingParams::default().for_start(1_000)
    }

    #[test]
    fn boundaries_follow_durations() {
        let t = default_timing();
        assert_eq!(t.active_end_ts, 8_200);
        assert_eq!(t.cooldown_end_ts, 10_600);
        assert_eq!(t.anti_snipe_start_ts, 7_900);
        assert_eq!(t.finalize_at(), 8_205);
    }

    #[test]
    fn phase_at_each_boundary() {
        let t = default_timing();
        assert_eq!(t.phase(1_000), Phase::Active);
        assert_eq!(t.phase(7_899), Phase::Active);
        assert_eq!(t.phase(7_900), Phase::AntiSnipe);
        assert_eq!(t.phase(8_199), Phase::AntiSnipe);
        assert_eq!(t.phase(8_200), Phase::Cooldown);
        assert_eq!(t.phase(10_599), Phase::Cooldown);
        assert_eq!(t.phase(10_600), Phase::Ended);
    }

    #[test]
    fn phase_never_regresses() {
        let t = default_timing();
        let mut last = Phase::Active;
        for now in (0..12_000).step_by(7) {
            let p = t.phase(now);
            assert!(p >= last, "phase went from {last:?} to {p:?} at {now}");
            last = p;
        }
        assert_eq!(last, Phase::Ended);
    }

    #[test]
    fn time_remaining_counts_to_next_boundary() {
        let t = default_timing();
        assert_eq!(t.time_remaining(1_000), 6_900);
        assert_eq!(t.time_remaining(8_000), 200);
        assert_eq!(t.time_remaining(9_600), 1_000);
        assert_eq!(t.time_remaining(50_000), 0);
    }

    #[test]
    fn deposit_one_second_into_anti_snipe_is_flagged() {
        let t = default_timing();
        assert!(t.is_anti_sniped(t.anti_snipe_start_ts + 1));
        assert!(t.is_anti_sniped(t.anti_snipe_start_ts));
        assert!(!t.is_anti_sniped(t.anti_snipe_start_ts - 1));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(TimingParams::new(0, 10, 0).is_err());
        assert!(TimingParams::new(100, -1, 0).is_err());
        assert!(TimingParams::new(100, 10, -5).is_err());
        assert!(TimingParams::new(100, 10, 101).is_err());
        assert!(TimingParams::new(100, 0, 100).is_ok());
    }
}
