//! Per-provider circuit breaker.
//!
//! Closed → open after a threshold of consecutive failures; open → half-open
//! once the cooldown has elapsed, admitting a single probing call; a
//! half-open success closes the breaker, a half-open failure re-opens it and
//! re-arms the cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::chain::UnixTimestamp;
use crate::store::{CircuitState, ProviderStatus};

pub const FAILURE_THRESHOLD: u32 = 3;
pub const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_success_at: Option<UnixTimestamp>,
    last_failure_at: Option<UnixTimestamp>,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

/// Snapshot of the breaker for health reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<UnixTimestamp>,
    pub last_failure_at: Option<UnixTimestamp>,
}

impl BreakerSnapshot {
    pub fn provider_status(&self) -> ProviderStatus {
        match self.state {
            CircuitState::Closed if self.consecutive_failures == 0 => ProviderStatus::Healthy,
            CircuitState::Closed | CircuitState::HalfOpen => ProviderStatus::Degraded,
            CircuitState::Open => ProviderStatus::Down,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_success_at: None,
                last_failure_at: None,
            }),
            threshold,
            cooldown,
        }
    }

    /// Whether a call may go through right now.
    ///
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// and admits exactly one probe; concurrent callers are refused until
    /// the probe resolves.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call. A single half-open success closes the
    /// breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.last_success_at = Some(UnixTimestamp::now());
    }

    /// Records a failed call; opens at the threshold, re-opens from half-open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(UnixTimestamp::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock");
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.snapshot().state == CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_only_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_one_probe_then_closes_or_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        // Cooldown of zero: next acquire is the half-open probe.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);
        // A second caller is refused while the probe is in flight.
        assert!(!breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);

        assert!(breaker.try_acquire());
        breaker.record_success();
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn open_breaker_waits_out_the_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(!breaker.try_acquire());
        assert_eq!(breaker.snapshot().provider_status(), ProviderStatus::Down);
    }
}
