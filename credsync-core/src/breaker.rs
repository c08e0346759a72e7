use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SyncError;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

fn system_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration_millis: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_millis: 60_000,
        }
    }
}

/// A three-state (CLOSED/OPEN/HALF_OPEN) fault isolator for one external
/// dependency. The fast path — checking whether a call is allowed — is
/// lock-free: a handful of atomic loads and, at most, one CAS to claim
/// the single HALF_OPEN probe slot.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicI64,
    probe_in_flight: AtomicBool,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(system_clock_millis))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicI64::new(0),
            probe_in_flight: AtomicBool::new(false),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the breaker's current state, transitioning OPEN ->
    /// HALF_OPEN as a side effect if the open window has elapsed. Does
    /// not claim the probe slot; call [`Self::try_acquire`] to do a call.
    pub fn state(&self) -> BreakerState {
        self.maybe_transition_to_half_open();
        match self.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn maybe_transition_to_half_open(&self) {
        if self.state.load(Ordering::Acquire) != OPEN {
            return;
        }
        let elapsed = (self.clock)() - self.opened_at_millis.load(Ordering::Acquire);
        if elapsed >= self.config.open_duration_millis {
            // Best-effort CAS: if two callers race here, both will see
            // HALF_OPEN afterwards, and `try_acquire` still only lets one
            // of them claim the probe slot.
            let _ = self.state.compare_exchange(
                OPEN,
                HALF_OPEN,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Call before invoking the dependency. `Ok(())` means proceed;
    /// `Err(SyncError::CircuitOpen)` means fail fast, in sub-millisecond
    /// time, without touching the dependency.
    pub fn try_acquire(&self) -> Result<(), SyncError> {
        self.maybe_transition_to_half_open();
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(()),
            OPEN => Err(SyncError::CircuitOpen(self.name.clone())),
            _ => {
                // HALF_OPEN: only the caller that wins the CAS on the
                // probe flag gets to make the call.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    Ok(())
                } else {
                    Err(SyncError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful call. From HALF_OPEN this closes the breaker
    /// and releases the probe slot; from CLOSED it resets the failure
    /// counter.
    pub fn record_success(&self) {
        let was_half_open = self.state.load(Ordering::Acquire) == HALF_OPEN;
        self.consecutive_failures.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
        if was_half_open {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    /// Record a failed call. From HALF_OPEN this reopens the breaker;
    /// from CLOSED it increments the failure counter and opens once the
    /// threshold is reached.
    pub fn record_failure(&self) {
        let current = self.state.load(Ordering::Acquire);
        if current == HALF_OPEN {
            self.probe_in_flight.store(false, Ordering::Release);
            self.open_now();
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.open_now();
        }
    }

    fn open_now(&self) {
        self.opened_at_millis.store((self.clock)(), Ordering::Release);
        self.state.store(OPEN, Ordering::Release);
    }

    /// Force CLOSED regardless of history. Exposed only for test
    /// maintenance hooks.
    pub fn reset_for_test(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicI64 as TestClockCell;

    fn test_clock(cell: Arc<TestClockCell>) -> Arc<dyn Fn() -> i64 + Send + Sync> {
        Arc::new(move || cell.load(Ordering::Relaxed))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new("idp", BreakerConfig::default());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn opens_on_threshold_failure() {
        let breaker = CircuitBreaker::new("idp", BreakerConfig::default());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(SyncError::CircuitOpen(_))
        ));
    }

    #[test]
    fn half_opens_after_window_and_allows_one_probe() {
        let clock_cell = Arc::new(TestClockCell::new(0));
        let breaker = CircuitBreaker::with_clock(
            "broker",
            BreakerConfig {
                failure_threshold: 1,
                open_duration_millis: 1000,
            },
            test_clock(clock_cell.clone()),
        );
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        clock_cell.store(1000, Ordering::Relaxed);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // First caller claims the single probe slot.
        assert!(breaker.try_acquire().is_ok());
        // A second concurrent caller is rejected.
        assert!(matches!(
            breaker.try_acquire(),
            Err(SyncError::CircuitOpen(_))
        ));
    }

    #[test]
    fn probe_success_closes_breaker() {
        let clock_cell = Arc::new(TestClockCell::new(0));
        let breaker = CircuitBreaker::with_clock(
            "broker",
            BreakerConfig {
                failure_threshold: 1,
                open_duration_millis: 1000,
            },
            test_clock(clock_cell.clone()),
        );
        breaker.record_failure();
        clock_cell.store(1000, Ordering::Relaxed);
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn probe_failure_reopens_breaker() {
        let clock_cell = Arc::new(TestClockCell::new(0));
        let breaker = CircuitBreaker::with_clock(
            "broker",
            BreakerConfig {
                failure_threshold: 1,
                open_duration_millis: 1000,
            },
            test_clock(clock_cell.clone()),
        );
        breaker.record_failure();
        clock_cell.store(1000, Ordering::Relaxed);
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn reset_for_test_forces_closed() {
        let breaker = CircuitBreaker::new("idp", BreakerConfig::default());
        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.reset_for_test();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
