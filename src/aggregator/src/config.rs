// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Aggregator configuration.

use std::net::SocketAddr;
use std::time::Duration;

use champ_breaker::BreakerArgs;

/// The placeholder topic templates must contain.
pub const ZONE_PLACEHOLDER: &str = "{zone}";

#[derive(Debug, clap::Parser)]
#[clap(name = "aggregatord", about = "Bins device telemetry into per-zone epochs.")]
pub struct Args {
    /// Kafka bootstrap servers, comma separated.
    #[clap(long, env = "AGG_KAFKA_BROKERS", value_name = "HOST:PORT,...")]
    pub kafka_brokers: String,

    /// Zones to drain, comma separated.
    #[clap(
        long,
        env = "AGG_ZONES",
        use_value_delimiter = true,
        required = true,
        value_name = "ZONE,..."
    )]
    pub zones: Vec<String>,

    /// Template for per-zone telemetry topics; must contain `{zone}`.
    #[clap(
        long,
        env = "AGG_READINGS_TOPIC_TEMPLATE",
        default_value = "device.readings.{zone}"
    )]
    pub readings_topic_template: String,

    /// Template for per-zone ledger topics; must contain `{zone}`.
    #[clap(
        long,
        env = "AGG_LEDGER_TOPIC_TEMPLATE",
        default_value = "zone.ledger.{zone}"
    )]
    pub ledger_topic_template: String,

    /// The aggregator-side partition of the ledger topics.
    #[clap(long, env = "AGG_LEDGER_PARTITION_AGGREGATOR", default_value = "0")]
    pub ledger_partition_aggregator: i32,

    /// Epoch length (and drain tick) in milliseconds.
    #[clap(long, env = "AGG_EPOCH_MS", default_value = "300000")]
    pub epoch_ms: u64,

    /// Per-partition poll deadline during a drain pass, in milliseconds.
    #[clap(long, env = "AGG_POLL_DEADLINE_MS", default_value = "120")]
    pub poll_deadline_ms: u64,

    /// Kafka consumer group id.
    #[clap(long, env = "AGG_GROUP_ID", default_value = "nrg-champ-aggregator")]
    pub group_id: String,

    /// Address to serve Prometheus metrics on, if any.
    #[clap(long, env = "AGG_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,

    #[clap(flatten)]
    pub breaker: BreakerArgs,
}

impl Args {
    /// Validates cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for (name, template) in [
            ("--readings-topic-template", &self.readings_topic_template),
            ("--ledger-topic-template", &self.ledger_topic_template),
        ] {
            if !template.contains(ZONE_PLACEHOLDER) {
                anyhow::bail!("{name} must contain the {ZONE_PLACEHOLDER} placeholder");
            }
        }
        if self.epoch_ms == 0 {
            anyhow::bail!("--epoch-ms must be positive");
        }
        if self.zones.iter().any(|z| z.trim().is_empty()) {
            anyhow::bail!("--zones must not contain empty zone ids");
        }
        Ok(())
    }

    pub fn epoch_length(&self) -> Duration {
        Duration::from_millis(self.epoch_ms)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_millis(self.poll_deadline_ms.max(1))
    }

    pub fn readings_topic(&self, zone: &str) -> String {
        self.readings_topic_template.replace(ZONE_PLACEHOLDER, zone)
    }

    pub fn ledger_topic(&self, zone: &str) -> String {
        self.ledger_topic_template.replace(ZONE_PLACEHOLDER, zone)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Args;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(
            std::iter::once("aggregatord").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn test_topic_templates_expand() {
        let args = parse(&["--kafka-brokers", "k:9092", "--zones", "a,b"]);
        assert_eq!(args.zones, vec!["a", "b"]);
        assert_eq!(args.readings_topic("a"), "device.readings.a");
        assert_eq!(args.ledger_topic("b"), "zone.ledger.b");
        args.validate().unwrap();
    }

    #[test]
    fn test_template_without_placeholder_rejected() {
        let args = parse(&[
            "--kafka-brokers",
            "k:9092",
            "--zones",
            "a",
            "--readings-topic-template",
            "static-topic",
        ]);
        assert!(args.validate().is_err());
    }
}
