use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
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

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_outstanding: bool,
}

/// Per-provider circuit breaker.
///
/// Closed counts consecutive failures; at the threshold the breaker opens
/// and refuses traffic for `open_timeout`. Once the timeout elapses the
/// next poll moves it to half-open, where exactly one probe request is
/// admitted: probe success closes the breaker, probe failure re-opens it
/// and restarts the timer. A success in any state resets the failure
/// streak and closes.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_outstanding: false,
            }),
        }
    }

    /// Current state, advancing open -> half_open when the timer has
    /// elapsed. Does not consume the half-open probe slot.
    pub fn poll(&self) -> BreakerState {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now. In half-open this hands out
    /// the single probe slot.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        self.advance(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_outstanding {
                    false
                } else {
                    inner.probe_outstanding = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(from = inner.state.as_str(), "circuit breaker closing");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_outstanding = false;
    }

    /// Records a failure. Returns true when this failure tripped the
    /// breaker open.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    warn!(failures = inner.failure_count, "circuit breaker opening");
                    inner.state = BreakerState::Open;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker re-opening after failed probe");
                inner.state = BreakerState::Open;
                inner.probe_outstanding = false;
                true
            }
            BreakerState::Open => false,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    fn advance(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(last) = inner.last_failure {
                if last.elapsed() >= self.open_timeout {
                    info!("circuit breaker entering half-open probe window");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_outstanding = false;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert_eq!(breaker.failure_count(), 1);
        assert!(!breaker.record_failure());
        assert_eq!(breaker.failure_count(), 2);
        assert!(breaker.record_failure());
        assert_eq!(breaker.poll(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn success_resets_from_any_state() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.poll(), BreakerState::Open);

        breaker.record_success();
        assert_eq!(breaker.poll(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.poll(), BreakerState::HalfOpen);
        assert!(breaker.can_execute(), "first probe goes through");
        assert!(!breaker.can_execute(), "second caller waits for the probe");
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.poll(), BreakerState::Closed);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        assert!(breaker.record_failure());
        assert_eq!(breaker.poll(), BreakerState::Open);
        assert!(!breaker.can_execute(), "timer restarted by the failed probe");
    }

    #[test]
    fn failure_count_strictly_increases_until_reset() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(60));
        let mut previous = 0;
        for _ in 0..5 {
            breaker.record_failure();
            let count = breaker.failure_count();
            assert!(count > previous);
            previous = count;
        }
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }
}
