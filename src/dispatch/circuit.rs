// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Per-sink circuit breaker

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// What the breaker lets through for the next event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Cool-down over; exactly one attempt decides the next state
    Trial,
    Reject,
}

/// Opens after `threshold` consecutive terminal failures. Owned by a single worker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            failures: 0,
            state: CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open { until } if now >= until => {
                self.state = CircuitState::HalfOpen;
                Admission::Trial
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen => Admission::Reject,
        }
    }

    /// Best-effort traffic only flows through a closed circuit
    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Returns true when this failure opened the circuit
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        let open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failures >= self.threshold,
            CircuitState::Open { .. } => false,
        };
        if open {
            self.state = CircuitState::Open { until: now + self.cooldown };
        }
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        assert!(!breaker.record_failure(now));
        assert!(!breaker.record_failure(now));
        assert_eq!(breaker.admit(now), Admission::Allow);
        assert!(breaker.record_failure(now));

        assert_eq!(breaker.admit(now + Duration::from_secs(1)), Admission::Reject);
        assert!(!breaker.is_closed());
    }

    #[test]
    fn test_success_resets_count() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure(now);
        breaker.record_success();
        assert!(!breaker.record_failure(now));
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_trial_outcomes() {
        let now = Instant::now();
        let later = now + Duration::from_secs(61);
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure(now);

        assert_eq!(breaker.admit(later), Admission::Trial);
        // Only one trial while half-open
        assert_eq!(breaker.admit(later), Admission::Reject);

        // Failed trial re-opens for another cool-down
        assert!(breaker.record_failure(later));
        assert_eq!(breaker.admit(later + Duration::from_secs(30)), Admission::Reject);

        let again = later + Duration::from_secs(60);
        assert_eq!(breaker.admit(again), Admission::Trial);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(again), Admission::Allow);
    }
}
