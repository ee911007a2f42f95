use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consecutive failures that open the circuit.
const FAILURE_THRESHOLD: u32 = 3;
/// How long the circuit stays open before admitting a probe.
const RESET_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-provider circuit breaker: closed → open → half-open → closed.
///
/// While open, `allow()` returns false. Once the reset timeout elapses a
/// single probe is admitted (half-open); success closes the circuit and
/// resets the failure counter, failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    reset_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, RESET_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold,
            reset_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Whether a call may proceed. Transitions open → half-open when the
    /// reset timeout has elapsed, admitting exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Open the circuit immediately, bypassing the failure counter. Used for
    /// auth failures.
    pub fn trip(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Open;
        inner.consecutive_failures = self.threshold;
        inner.opened_at = Some(Instant::now());
    }
}
