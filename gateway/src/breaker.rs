//! Circuit breaker fronting the engine.
//!
//! Three states. Closed admits everything; N consecutive publish failures
//! open it; after the cool-down one probe goes through half-open. One
//! success closes, one failure reopens. The open state never suspends:
//! callers get an immediate refusal.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long to stay open before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Instant,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cfg: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_until: Instant::now(),
                probe_in_flight: false,
            }),
            cfg,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Should this request go through?
    pub fn try_admit(&self) -> bool {
        self.try_admit_at(Instant::now())
    }

    fn try_admit_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now >= inner.open_until {
                    // Cool-down elapsed: exactly one probe is admitted.
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.open_until = now + self.cfg.cooldown;
                    warn!(
                        "breaker opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_until = now + self.cfg.cooldown;
                inner.probe_in_flight = false;
                warn!("probe failed, breaker reopened");
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, 1_000);
        let now = Instant::now();
        assert!(cb.try_admit_at(now));
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.try_admit_at(now));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = breaker(1, 1_000);
        let now = Instant::now();
        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Open);

        let later = now + Duration::from_millis(1_001);
        assert!(cb.try_admit_at(later));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        // Second caller while the probe is in flight is refused.
        assert!(!cb.try_admit_at(later));
        assert!(!cb.try_admit_at(later + Duration::from_millis(5)));
    }

    #[test]
    fn probe_success_closes() {
        let cb = breaker(1, 100);
        let now = Instant::now();
        cb.record_failure_at(now);
        assert!(cb.try_admit_at(now + Duration::from_millis(101)));
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.try_admit_at(now + Duration::from_millis(102)));
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = breaker(1, 100);
        let now = Instant::now();
        cb.record_failure_at(now);
        let probe_time = now + Duration::from_millis(101);
        assert!(cb.try_admit_at(probe_time));
        cb.record_failure_at(probe_time);
        assert_eq!(cb.state(), BreakerState::Open);
        // Still open inside the second cool-down window.
        assert!(!cb.try_admit_at(probe_time + Duration::from_millis(50)));
        // And probing again after it.
        assert!(cb.try_admit_at(probe_time + Duration::from_millis(101)));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        let now = Instant::now();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        cb.record_success();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
