// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configures a retry operation.
///
/// The operation is attempted immediately, then again after each backoff
/// period until it succeeds or the retry budget is exhausted. Backoff grows
/// exponentially by `factor` from `initial_backoff`, clamped to
/// `clamp_backoff`, with up to 25% random jitter so that many failing callers
/// do not resynchronise.
#[derive(Debug, Clone)]
pub struct Retry {
    /// The backoff applied after the first failed attempt.
    pub initial_backoff: Duration,
    /// The multiplier applied to the backoff after each failed attempt.
    pub factor: f64,
    /// An upper bound on the backoff.
    pub clamp_backoff: Duration,
    /// The maximum number of attempts, including the first.
    pub max_tries: usize,
}

/// The state of an ongoing retry operation, passed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The zero-indexed number of the current attempt.
    pub i: usize,
    /// The backoff that will be applied if this attempt fails, or `None` if
    /// this is the last attempt.
    pub next_backoff: Option<Duration>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the backoff to the specified maximum.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of attempts.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max_tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to this
    /// configuration, returning the result of the last attempt.
    pub async fn retry_async<F, Fut, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff;
        for i in 0..self.max_tries {
            let last = i + 1 == self.max_tries;
            let state = RetryState {
                i,
                next_backoff: (!last).then_some(backoff),
            };
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) if last => return Err(e),
                Err(_) => {
                    tokio::time::sleep(jitter(backoff)).await;
                    backoff = Duration::from_secs_f64(backoff.as_secs_f64() * self.factor)
                        .min(self.clamp_backoff);
                }
            }
        }
        unreachable!("retry loop returns from its last iteration")
    }
}

fn jitter(d: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(d.as_secs_f64() * jitter)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::Retry;

    #[tokio::test]
    async fn test_retry_success_on_third_attempt() {
        let attempts = AtomicUsize::new(0);
        let res: Result<usize, &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(5)
            .retry_async(|_| {
                let i = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if i < 2 {
                        Err("not yet")
                    } else {
                        Ok(i)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let attempts = AtomicUsize::new(0);
        let res: Result<(), usize> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(3)
            .retry_async(|_| {
                let i = attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(i) }
            })
            .await;
        assert_eq!(res, Err(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_state_reports_last_attempt() {
        let res: Result<(), bool> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(2)
            .retry_async(|state| async move { Err(state.next_backoff.is_none()) })
            .await;
        // The final attempt sees no next backoff.
        assert_eq!(res, Err(true));
    }
}
