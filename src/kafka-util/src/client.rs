// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Kafka client configuration.

use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::ConsumerContext;
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, warn};

/// A client context that forwards librdkafka logs and errors into `tracing`.
///
/// librdkafka is the chattiest dependency in the process; without this bridge
/// its output bypasses the log filter entirely.
#[derive(Debug, Clone, Copy)]
pub struct ChampClientContext;

impl ClientContext for ChampClientContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(target: "librdkafka", "{} {}", fac, log_message)
            }
            RDKafkaLogLevel::Warning => warn!(target: "librdkafka", "{} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", "{} {}", fac, log_message)
            }
            RDKafkaLogLevel::Debug => debug!(target: "librdkafka", "{} {}", fac, log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        // Refired on the next operation that cares; at this level it is
        // telemetry, not control flow.
        warn!(target: "librdkafka", "error: {}: {}", error, reason);
    }
}

impl ConsumerContext for ChampClientContext {}

/// Returns a new client config with NRG-CHAMP defaults applied.
pub fn create_new_client_config(brokers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", brokers);
    config.set_log_level(RDKafkaLogLevel::Warning);
    config
}

/// Returns a consumer config for manually-assigned partition reading.
///
/// Auto-commit is disabled: offsets are committed explicitly, only after the
/// derived output has been durably produced downstream. `auto.offset.reset`
/// is `earliest` so a fresh group replays history instead of silently
/// skipping it; replays are absorbed by downstream dedup.
pub fn consumer_config(brokers: &str, group_id: &str) -> ClientConfig {
    let mut config = create_new_client_config(brokers);
    config.set("group.id", group_id);
    config.set("enable.auto.commit", "false");
    config.set("auto.offset.reset", "earliest");
    config
}
