// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Breaker configuration.

use std::time::Duration;

/// Configuration for one [`crate::CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct Config {
    /// A name for log lines; conventionally the protected upstream
    /// (`"aggregator-kafka"`, `"ledger-public"`).
    pub name: String,
    /// When false, `call` degenerates to running the operation directly.
    pub enabled: bool,
    /// Consecutive failures in the closed state that trip the breaker.
    pub max_failures: u32,
    /// How long the breaker stays open before admitting a half-open trial.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub successes_to_close: u32,
    /// Budget for the half-open health probe.
    pub probe_timeout: Duration,
}

/// The shared `CB_*` command-line/environment surface for Kafka breakers.
///
/// Both daemons flatten this into their argument structs so that one set of
/// environment variables tunes breaker behavior fleet-wide.
#[derive(Debug, Clone, clap::Parser)]
pub struct BreakerArgs {
    /// Whether circuit breaking is enabled at all.
    #[clap(long, env = "CB_ENABLED", default_value = "true", parse(try_from_str))]
    pub cb_enabled: bool,
    /// Consecutive Kafka failures that trip a breaker.
    #[clap(long, env = "CB_KAFKA_FAILURE_THRESHOLD", default_value = "5")]
    pub cb_kafka_failure_threshold: u32,
    /// Consecutive half-open successes required to close a Kafka breaker.
    #[clap(long, env = "CB_KAFKA_SUCCESS_THRESHOLD", default_value = "2")]
    pub cb_kafka_success_threshold: u32,
    /// Seconds a tripped Kafka breaker stays open.
    #[clap(long, env = "CB_KAFKA_OPEN_SECONDS", default_value = "30")]
    pub cb_kafka_open_seconds: u64,
    /// Probe budget in milliseconds.
    #[clap(long, env = "CB_KAFKA_TIMEOUT_MS", default_value = "15000")]
    pub cb_kafka_timeout_ms: u64,
    /// Base backoff in milliseconds for retries running behind the breaker.
    #[clap(long, env = "CB_KAFKA_BACKOFF_MS", default_value = "500")]
    pub cb_kafka_backoff_ms: u64,
}

impl BreakerArgs {
    /// Builds the [`Config`] for the Kafka breaker named `name`.
    pub fn kafka_config(&self, name: &str) -> Config {
        Config {
            name: name.to_string(),
            enabled: self.cb_enabled,
            max_failures: self.cb_kafka_failure_threshold.max(1),
            successes_to_close: self.cb_kafka_success_threshold.max(1),
            reset_timeout: Duration::from_secs(self.cb_kafka_open_seconds.max(1)),
            probe_timeout: Duration::from_millis(self.cb_kafka_timeout_ms.max(1)),
        }
    }

    /// The base retry backoff used by callers that retry behind the breaker.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.cb_kafka_backoff_ms.max(1))
    }
}
