// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Timed delivery attempts with bounded exponential backoff

use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::config::DispatchConfig;
use crate::core::Backoff;
use crate::detection::NoiseEvent;
use crate::error::SinkError;
use crate::sinks::{Delivered, Sink};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before the next attempt. A server-provided retry-after wins, capped at the ceiling.
    fn delay(&self, backoff: &mut Backoff, error: &SinkError) -> Duration {
        let delay = backoff.next_delay();
        match error {
            SinkError::RateLimited { retry_after: Some(after) } => {
                (*after).min(self.backoff_max).max(delay)
            }
            _ => delay,
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Delivered, SinkError>,
    pub attempts: u32,
}

/// Deliver `event`, retrying retryable errors up to `max_attempts`.
/// `on_retry` is called with the attempt number and error before each backoff sleep.
pub async fn deliver_with_retry<F>(
    sink: &dyn Sink,
    event: &NoiseEvent,
    policy: &RetryPolicy,
    max_attempts: u32,
    mut on_retry: F,
) -> RetryOutcome
where
    F: FnMut(u32, &SinkError, Duration),
{
    let mut backoff = Backoff::new(policy.backoff_base, policy.backoff_max);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout(policy.attempt_timeout, sink.deliver(event)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(policy.attempt_timeout)),
        };

        match result {
            Ok(delivered) => {
                return RetryOutcome {
                    result: Ok(delivered),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay(&mut backoff, &e);
                on_retry(attempt, &e, delay);
                sleep(delay).await;
            }
            Err(e) => {
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}
