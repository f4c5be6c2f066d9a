// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Exponential backoff and a bounded async retry loop.
//!
//! Transient failures (stale object locations, a directory that is briefly
//! unreachable) are retried locally through [`retry_with_backoff`] before
//! the error is surfaced to the caller.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff calculator with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier: multiplier.max(1.0),
            max_delay,
            current_delay: initial_delay.min(max_delay),
        }
    }

    /// Returns the next delay and advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        let grown = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = grown.min(self.max_delay);
        delay
    }

    /// Returns the next delay stretched by up to 50% random jitter.
    pub fn next_delay_with_jitter(&mut self) -> Duration {
        let delay = self.next_delay();
        let factor = 1.0 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
    }
}

/// Outcome of one attempt inside [`retry_with_backoff`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Worth retrying after a delay.
    Retry(E),
    /// Permanent; stop immediately.
    Fail(E),
}

/// Run `op` until it succeeds, fails permanently or `max_attempts` is used up.
///
/// The last transient error is returned when attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut backoff: ExponentialBackoff,
    max_attempts: u32,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => return Err(err),
            Attempt::Retry(err) if attempt >= max_attempts => return Err(err),
            Attempt::Retry(_) => {
                let delay = backoff.next_delay_with_jitter();
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
