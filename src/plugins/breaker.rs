use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-plugin circuit breaker.
///
/// ```text
/// CLOSED ──5 fails in window──▶ OPEN
/// OPEN ──30s elapsed──▶ HALF_OPEN
/// HALF_OPEN ──success──▶ CLOSED
/// HALF_OPEN ──fail──▶ OPEN (reset timer)
/// ```
///
/// HALF_OPEN admits exactly one trial call at a time.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    failure_window: Duration,
    open_duration: Duration,
}

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
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60), Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, failure_window: Duration, open_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: None,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold,
            failure_window,
            open_duration,
        }
    }

    /// Admission check before touching the network. `Ok(())` admits the
    /// call; the caller must then report the outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<(), BreakerState> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("open breaker has a timestamp");
                if opened_at.elapsed() >= self.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(BreakerState::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BreakerState::HalfOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                inner.consecutive_failures = 0;
                inner.window_start = None;
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let now = Instant::now();
                match inner.window_start {
                    Some(start) if now.duration_since(start) <= self.failure_window => {
                        inner.consecutive_failures += 1;
                    }
                    _ => {
                        inner.window_start = Some(now);
                        inner.consecutive_failures = 1;
                    }
                }
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.consecutive_failures = 0;
                    inner.window_start = None;
                }
            }
        }
    }

    /// Release an admitted call whose outcome was discarded (cancellation).
    /// Counts neither as success nor failure.
    pub fn abandon(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.trial_in_flight = false;
    }

    /// Whether a call made right now would be rejected.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => inner.trial_in_flight,
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("open breaker has a timestamp");
                opened_at.elapsed() < self.open_duration
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_millis(40))
    }

    #[test]
    fn test_opens_after_five_failures() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(50));

        // First caller is admitted as the trial, second is rejected.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }
}
