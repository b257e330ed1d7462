//! Process-wide token bucket guarding the generation provider.
//!
//! The bucket is global: every caller draws from the same pool regardless of
//! identity. Refill is computed lazily from elapsed wall-clock time on each
//! check, in continuous time, so fractional tokens carry over between calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LedgerError;
use crate::clock::{Clock, SystemClock};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Burst capacity `C`.
    pub capacity: u64,
    /// Tokens `R` added per interval.
    pub refill_tokens: u64,
    /// Refill interval `T`, in seconds.
    pub interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_tokens: 100,
            interval_secs: 60,
        }
    }
}

impl AdmissionConfig {
    pub fn new(capacity: u64, refill_tokens: u64, interval: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            interval_secs: interval.as_secs(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.capacity == 0 {
            return Err(LedgerError::Config(
                "admission.capacity must be positive".to_string(),
            ));
        }
        if self.refill_tokens == 0 {
            return Err(LedgerError::Config(
                "admission.refill_tokens must be positive".to_string(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(LedgerError::Config(
                "admission.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u64 },
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Admitted { .. } => None,
            Self::Rejected { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

pub struct AdmissionGate {
    capacity: f64,
    interval_ms: f64,
    refill_tokens: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("refill_tokens", &self.refill_tokens)
            .field("interval_ms", &self.interval_ms)
            .finish()
    }
}

impl AdmissionGate {
    pub fn new(config: &AdmissionConfig) -> Result<Self, LedgerError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a full bucket stamped at the clock's current time.
    pub fn with_clock(
        config: &AdmissionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let interval_ms = config.interval_secs as f64 * 1_000.0;
        let capacity = config.capacity as f64;
        let refill_tokens = config.refill_tokens as f64;
        let now = clock.now_millis();
        Ok(Self {
            capacity,
            interval_ms,
            refill_tokens,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill_ms: now,
            }),
            clock,
        })
    }

    /// Non-blocking admission check; consumes one token when admitted.
    pub fn try_admit(&self) -> Admission {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Admission::Admitted {
                remaining: state.tokens.floor() as u64,
            };
        }

        Admission::Rejected {
            retry_after: self.retry_after(state.tokens),
        }
    }

    /// Whole tokens currently available, after lazy refill.
    pub fn available(&self) -> u64 {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        self.refill(&mut state, now);
        state.tokens.floor() as u64
    }

    fn refill(&self, state: &mut BucketState, now: u64) {
        // A clock that steps backwards must not mint tokens or rewind the stamp.
        if now <= state.last_refill_ms {
            return;
        }
        let elapsed = (now - state.last_refill_ms) as f64;
        state.tokens = self
            .capacity
            .min(state.tokens + elapsed * self.refill_tokens / self.interval_ms);
        state.last_refill_ms = now;
    }

    /// `T * (1 - available) / R`, rounded up to whole seconds.
    fn retry_after(&self, available: f64) -> Duration {
        let deficit = (1.0 - available).max(0.0);
        let wait_ms = self.interval_ms * deficit / self.refill_tokens;
        let secs = (wait_ms / 1_000.0).ceil().max(1.0);
        Duration::from_secs(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn gate(capacity: u64, refill: u64, interval_secs: u64) -> (AdmissionGate, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let config = AdmissionConfig {
            capacity,
            refill_tokens: refill,
            interval_secs,
        };
        let gate = AdmissionGate::with_clock(&config, Arc::new(clock.clone())).expect("gate");
        (gate, clock)
    }

    #[test]
    fn config_rejects_zero_parameters() {
        assert!(AdmissionConfig::new(0, 1, Duration::from_secs(1)).validate().is_err());
        assert!(AdmissionConfig::new(1, 0, Duration::from_secs(1)).validate().is_err());
        assert!(AdmissionConfig::new(1, 1, Duration::from_secs(0)).validate().is_err());
        assert!(AdmissionConfig::default().validate().is_ok());
    }

    #[test]
    fn burst_of_fifteen_admits_exactly_capacity() {
        let (gate, _clock) = gate(10, 10, 60);

        let decisions: Vec<Admission> = (0..15).map(|_| gate.try_admit()).collect();
        let admitted = decisions.iter().filter(|d| d.is_admitted()).count();
        assert_eq!(admitted, 10);
        assert_eq!(decisions.len() - admitted, 5);

        for decision in decisions.iter().filter(|d| !d.is_admitted()) {
            let retry_after = decision.retry_after().expect("hint");
            assert!(retry_after <= Duration::from_secs(60));
            assert_eq!(retry_after, Duration::from_secs(6));
        }
    }

    #[test]
    fn fractional_refill_accumulates_across_checks() {
        // One token per 10s; three checks 4s apart must yield a token on the third.
        let (gate, clock) = gate(1, 6, 60);
        assert!(gate.try_admit().is_admitted());

        clock.advance_millis(4_000);
        assert!(!gate.try_admit().is_admitted());
        clock.advance_millis(4_000);
        assert!(!gate.try_admit().is_admitted());
        clock.advance_millis(4_000);
        assert!(gate.try_admit().is_admitted());
    }

    #[test]
    fn retry_hint_shrinks_as_tokens_refill() {
        let (gate, clock) = gate(1, 1, 10);
        assert!(gate.try_admit().is_admitted());

        assert_eq!(gate.try_admit().retry_after(), Some(Duration::from_secs(10)));
        clock.advance_millis(7_500);
        assert_eq!(gate.try_admit().retry_after(), Some(Duration::from_secs(3)));
        clock.advance_millis(2_500);
        assert!(gate.try_admit().is_admitted());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let (gate, clock) = gate(5, 5, 1);
        for _ in 0..5 {
            assert!(gate.try_admit().is_admitted());
        }
        clock.advance_millis(3_600_000);
        assert_eq!(gate.available(), 5);
    }

    #[test]
    fn clock_rollback_does_not_mint_tokens() {
        let (gate, clock) = gate(2, 2, 60);
        assert!(gate.try_admit().is_admitted());
        assert!(gate.try_admit().is_admitted());

        clock.set_millis(0);
        assert!(!gate.try_admit().is_admitted());
        clock.set_millis(1_000_000);
        assert!(!gate.try_admit().is_admitted());
    }

    #[test]
    fn admissions_in_any_window_stay_within_burst_plus_rate() {
        let (gate, clock) = gate(10, 10, 60);
        let mut admitted_at = Vec::new();
        // Hammer the gate every 500ms for five minutes.
        for step in 0..600u64 {
            for _ in 0..3 {
                if gate.try_admit().is_admitted() {
                    admitted_at.push(step * 500);
                }
            }
            clock.advance_millis(500);
        }

        for (idx, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[idx..]
                .iter()
                .take_while(|ts| **ts < start + 60_000)
                .count();
            assert!(in_window <= 20, "window at {start}ms admitted {in_window}");
        }
    }

    #[test]
    fn concurrent_callers_never_over_admit() {
        let (gate, _clock) = gate(50, 1, 3_600);
        let gate = Arc::new(gate);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    (0..20).filter(|_| gate.try_admit().is_admitted()).count()
                })
            })
            .collect();

        let total: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .sum();
        assert_eq!(total, 50);
    }
}
