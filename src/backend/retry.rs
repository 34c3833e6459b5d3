//! Retry/backoff manager for transient upstream failures (spec.md
//! section 4.5, "Retry policy").

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::CoreConfig;
use crate::error::CoreError;

/// Live-tunable retry parameters, reconfigurable at runtime through the
/// `.fs123_ioctl` sink (spec.md section 6, "Runtime reconfiguration").
/// Seeded from [`CoreConfig`] at mount time; [`RetryState::from_knobs`]
/// reads a fresh snapshot for every retry sequence, so an ioctl applied
/// mid-sequence only affects the *next* sequence, never one already
/// in flight.
#[derive(Debug)]
pub struct RetryKnobs {
    initial_millis: AtomicU64,
    saturate_secs: AtomicU64,
    timeout_secs: AtomicU64,
}

impl RetryKnobs {
    pub fn from_config(config: &CoreConfig) -> Self {
        RetryKnobs {
            initial_millis: AtomicU64::new(config.retry_initial_millis),
            saturate_secs: AtomicU64::new(config.retry_saturate_secs),
            timeout_secs: AtomicU64::new(config.retry_timeout_secs),
        }
    }

    pub fn set_initial_millis(&self, v: u64) {
        self.initial_millis.store(v, Ordering::Relaxed);
    }

    pub fn set_saturate_secs(&self, v: u64) {
        self.saturate_secs.store(v, Ordering::Relaxed);
    }

    pub fn set_timeout_secs(&self, v: u64) {
        self.timeout_secs.store(v, Ordering::Relaxed);
    }
}

/// Tracks one in-progress retry sequence: the delay doubles on each
/// failure up to `retry_saturate_secs`, and the whole sequence is
/// abandoned once `retry_timeout_secs` has elapsed since the first
/// attempt.
#[derive(Debug)]
pub struct RetryState {
    next_delay: Duration,
    saturate: Duration,
    started: Instant,
    timeout: Duration,
}

/// What the caller should do after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Sleep for this long, then retry.
    Delay(Duration),
    /// The retry budget is exhausted or the error isn't retryable;
    /// surface it.
    GiveUp,
}

impl RetryState {
    /// Starts a new retry sequence from `config`'s retry parameters.
    pub fn new(config: &CoreConfig) -> Self {
        RetryState {
            next_delay: Duration::from_millis(config.retry_initial_millis),
            saturate: Duration::from_secs(config.retry_saturate_secs),
            started: Instant::now(),
            timeout: Duration::from_secs(config.retry_timeout_secs),
        }
    }

    /// Starts a new retry sequence from a live [`RetryKnobs`] snapshot.
    pub fn from_knobs(knobs: &RetryKnobs) -> Self {
        RetryState {
            next_delay: Duration::from_millis(knobs.initial_millis.load(Ordering::Relaxed)),
            saturate: Duration::from_secs(knobs.saturate_secs.load(Ordering::Relaxed)),
            started: Instant::now(),
            timeout: Duration::from_secs(knobs.timeout_secs.load(Ordering::Relaxed)),
        }
    }

    /// Consumes one failed attempt, returning whether and how long to
    /// wait before the next one. `error` gates retry eligibility through
    /// [`CoreError::is_retryable`]; everything else is a `GiveUp`
    /// regardless of elapsed budget.
    pub fn on_failure(&mut self, error: &CoreError) -> RetryDecision {
        if self.timeout.is_zero() || !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if self.started.elapsed() >= self.timeout {
            return RetryDecision::GiveUp;
        }
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.saturate);
        RetryDecision::Delay(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(initial_millis: u64, saturate_secs: u64, timeout_secs: u64) -> CoreConfig {
        CoreConfig {
            retry_initial_millis: initial_millis,
            retry_saturate_secs: saturate_secs,
            retry_timeout_secs: timeout_secs,
            ..CoreConfig::default()
        }
    }

    #[test]
    fn delay_doubles_up_to_saturation() {
        let mut state = RetryState::new(&config_with(100, 1, 3600));
        let transport_err = || CoreError::Http { status: 503 };
        let RetryDecision::Delay(d1) = state.on_failure(&transport_err()) else { panic!() };
        let RetryDecision::Delay(d2) = state.on_failure(&transport_err()) else { panic!() };
        let RetryDecision::Delay(d3) = state.on_failure(&transport_err()) else { panic!() };
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(400));
    }

    #[test]
    fn saturates_at_configured_ceiling() {
        let mut state = RetryState::new(&config_with(500, 1, 3600));
        for _ in 0..5 {
            state.on_failure(&CoreError::Http { status: 503 });
        }
        let RetryDecision::Delay(d) = state.on_failure(&CoreError::Http { status: 503 }) else { panic!() };
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn zero_timeout_disables_retries() {
        let mut state = RetryState::new(&config_with(100, 1, 0));
        matches!(state.on_failure(&CoreError::Http { status: 503 }), RetryDecision::GiveUp);
    }

    #[test]
    fn non_retryable_error_gives_up_immediately() {
        let mut state = RetryState::new(&config_with(100, 1, 3600));
        matches!(state.on_failure(&CoreError::Protocol("bad".into())), RetryDecision::GiveUp);
    }

    #[test]
    fn knobs_reconfigure_the_next_sequence() {
        let knobs = RetryKnobs::from_config(&config_with(100, 1, 3600));
        knobs.set_initial_millis(250);
        let mut state = RetryState::from_knobs(&knobs);
        let RetryDecision::Delay(d) = state.on_failure(&CoreError::Http { status: 503 }) else { panic!() };
        assert_eq!(d, Duration::from_millis(250));
    }
}
