//! Per-provider circuit breaker.
//!
//! Closed -> Open after `failure_threshold` consecutive failed HTTP attempts.
//! Open -> HalfOpen after `cool_down_millis`; a single probe is admitted.
//! HalfOpen: probe success closes, probe failure re-opens.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use nova_common::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cool_down_millis: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 2, cool_down_millis: 30_000 }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: u64,
    half_open_probe_taken: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: 0,
                half_open_probe_taken: false,
            }),
            clock,
        }
    }

    /// May this call proceed? Transitions Open -> HalfOpen when cooled down.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self.clock.now_millis().saturating_sub(inner.opened_at) >= self.config.cool_down_millis;
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probe_taken = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probe_taken {
                    false
                } else {
                    inner.half_open_probe_taken = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_probe_taken = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = self.clock.now_millis();
                inner.half_open_probe_taken = false;
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = self.clock.now_millis();
                    inner.half_open_probe_taken = false;
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_common::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            CircuitBreakerConfig { failure_threshold: 2, cool_down_millis: 1_000 },
            clock,
        )
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let c = Arc::new(ManualClock::new(0));
        let b = breaker(c);
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_the_failure_run() {
        let c = Arc::new(ManualClock::new(0));
        let b = breaker(c);
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn heals_through_half_open() {
        let c = Arc::new(ManualClock::new(0));
        let b = breaker(c.clone());
        b.record_failure();
        b.record_failure();
        assert!(!b.allow());

        c.advance(1_000);
        // One probe admitted, second caller still shut out.
        assert!(b.allow());
        assert!(!b.allow());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let c = Arc::new(ManualClock::new(0));
        let b = breaker(c.clone());
        b.record_failure();
        b.record_failure();
        c.advance(1_000);
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }
}
