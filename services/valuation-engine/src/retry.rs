//! Jittered exponential backoff for transport publishes and checkpoint writes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// Every attempt failed; carries the last error.
    Exhausted { attempts: usize, last: E },
    /// The overall deadline passed before an attempt succeeded.
    TimedOut { attempts: usize },
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let clamped_attempts = max_attempts.max(1);
        let clamped_base = base_delay_ms.max(1);
        let clamped_max_delay = max_delay_ms.max(clamped_base);
        let clamped_jitter = jitter_pct.clamp(0.0, 1.0);
        Self {
            max_attempts: clamped_attempts,
            base_delay_ms: clamped_base,
            max_delay_ms: clamped_max_delay,
            jitter_pct: clamped_jitter,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, 1, 1, 0.0)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jittered = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }

    pub async fn retry_async<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.next_delay(attempt - 1)).await;
                }
            }
        }
    }

    /// Like [`retry_async`](Self::retry_async) but bounded by an overall deadline.
    ///
    /// `on_retry` runs before each backoff sleep with the number of failed
    /// attempts so far and the error that triggered it.
    pub async fn retry_with_timeout<F, Fut, T, E, R>(
        &self,
        timeout: Duration,
        mut op: F,
        mut on_retry: R,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(usize, &E),
    {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RetryFailure::TimedOut { attempts: attempt });
            }
            match tokio::time::timeout(remaining, op(attempt)).await {
                Ok(Ok(val)) => return Ok(val),
                Ok(Err(err)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(RetryFailure::Exhausted { attempts: attempt, last: err });
                    }
                    on_retry(attempt, &err);
                    let delay = self.next_delay(attempt - 1);
                    if Instant::now() + delay >= deadline {
                        sleep_until(deadline).await;
                        return Err(RetryFailure::TimedOut { attempts: attempt });
                    }
                    sleep(delay).await;
                }
                Err(_) => return Err(RetryFailure::TimedOut { attempts: attempt + 1 }),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 100, 2_000, 0.2)
    }
}
