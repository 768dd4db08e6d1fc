// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Circuit breaking for outbound dependencies.
//!
//! A [`CircuitBreaker`] wraps calls against one logical upstream (a Kafka
//! producer, an HTTP endpoint) and fails fast once the upstream has proven
//! unhealthy, instead of letting every caller rediscover the outage at its
//! own timeout. One breaker instance protects one upstream; do not share a
//! breaker across unrelated dependencies.
//!
//! State machine:
//!
//! ```text
//!            max_failures consecutive failures
//!   Closed ────────────────────────────────────► Open
//!      ▲                                           │ reset_timeout elapsed
//!      │ successes_to_close consecutive            ▼
//!      └───────────────────────────────────── HalfOpen
//!                 (any failure, incl. probe, re-opens)
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use champ_ore::now::{EpochMillis, NowFn};

mod config;

pub use config::{BreakerArgs, Config};

/// An error returned by [`CircuitBreaker::call`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

/// The observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// The error type health probes report.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// A health probe run before admitting traffic in the half-open state.
pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ProbeError>> + Send + Sync>;

struct Inner {
    state: State,
    recent_fails: u32,
    opened_at: EpochMillis,
    half_open_successes: u32,
}

/// A circuit breaker over one logical upstream.
pub struct CircuitBreaker {
    cfg: Config,
    now: NowFn,
    probe: Option<Probe>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.cfg.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration, reading time from
    /// `now`.
    pub fn new(cfg: Config, now: NowFn) -> CircuitBreaker {
        assert!(cfg.max_failures >= 1, "max_failures must be at least 1");
        assert!(
            cfg.successes_to_close >= 1,
            "successes_to_close must be at least 1"
        );
        assert!(
            !cfg.reset_timeout.is_zero(),
            "reset_timeout must be nonzero"
        );
        CircuitBreaker {
            cfg,
            now,
            probe: None,
            inner: Mutex::new(Inner {
                state: State::Closed,
                recent_fails: 0,
                opened_at: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Installs a health probe, run (with the configured timeout) before any
    /// half-open trial. A failing probe re-opens the breaker without invoking
    /// the guarded operation.
    pub fn with_probe(mut self, probe: Probe) -> CircuitBreaker {
        self.probe = Some(probe);
        self
    }

    /// Returns the breaker's current state.
    pub fn state(&self) -> State {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Runs `op` under the breaker.
    ///
    /// Returns the operation's result, [`Error::Operation`] wrapping its
    /// error, or [`Error::Open`] without invoking it. The operation is
    /// awaited outside the state lock. If the returned future is dropped
    /// before the operation resolves, nothing is recorded: a cancelled call
    /// counts neither as success nor failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.cfg.enabled {
            return op().await.map_err(Error::Operation);
        }

        let half_open = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                State::Closed => false,
                State::HalfOpen => true,
                State::Open => {
                    let now = self.now.as_millis();
                    let reset_ms = self.cfg.reset_timeout.as_millis() as u64;
                    if now.saturating_sub(inner.opened_at) < reset_ms {
                        return Err(Error::Open);
                    }
                    info!(breaker = %self.cfg.name, "reset timeout elapsed; half-opening");
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                }
            }
        };

        if half_open {
            if let Some(probe) = &self.probe {
                let healthy = match tokio::time::timeout(self.cfg.probe_timeout, probe()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(breaker = %self.cfg.name, error = %e, "half-open probe failed");
                        false
                    }
                    Err(_) => {
                        warn!(breaker = %self.cfg.name, "half-open probe timed out");
                        false
                    }
                };
                if !healthy {
                    self.reopen();
                    return Err(Error::Open);
                }
            }
        }

        match op().await {
            Ok(t) => {
                self.record_success();
                Ok(t)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(Error::Operation(e))
            }
        }
    }

    fn reopen(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = State::Open;
        inner.opened_at = self.now.as_millis();
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => inner.recent_fails = 0,
            State::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.successes_to_close {
                    info!(breaker = %self.cfg.name, "closing after successful trial");
                    inner.state = State::Closed;
                    inner.recent_fails = 0;
                }
            }
            // Another caller re-opened while our operation was in flight; its
            // view wins.
            State::Open => {}
        }
    }

    fn record_failure(&self, error: &impl fmt::Display) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => {
                inner.recent_fails += 1;
                if inner.recent_fails >= self.cfg.max_failures {
                    warn!(
                        breaker = %self.cfg.name,
                        failures = inner.recent_fails,
                        error = %error,
                        "tripping open",
                    );
                    inner.state = State::Open;
                    inner.opened_at = self.now.as_millis();
                }
            }
            State::HalfOpen => {
                warn!(breaker = %self.cfg.name, error = %error, "half-open trial failed; re-opening");
                inner.state = State::Open;
                inner.opened_at = self.now.as_millis();
            }
            State::Open => {}
        }
    }
}
