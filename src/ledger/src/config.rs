// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ledgerd configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use champ_breaker::BreakerArgs;

use crate::publish::{KeyMode, Partitioner, PublisherConfig};

/// The placeholder the topic template must contain.
pub const ZONE_PLACEHOLDER: &str = "{zone}";

#[derive(Debug, clap::Parser)]
#[clap(name = "ledgerd", about = "The tamper-evident epoch ledger.")]
pub struct Args {
    /// Kafka bootstrap servers for ingest, comma separated.
    #[clap(long, env = "LEDGER_KAFKA_BROKERS", value_name = "HOST:PORT,...")]
    pub kafka_brokers: String,

    /// Template for per-zone ledger topics; must contain `{zone}`.
    #[clap(long, env = "LEDGER_TOPIC_TEMPLATE", default_value = "zone.ledger.{zone}")]
    pub topic_template: String,

    /// Zones to ingest, comma separated.
    #[clap(
        long,
        env = "LEDGER_ZONES",
        use_value_delimiter = true,
        required = true,
        value_name = "ZONE,..."
    )]
    pub zones: Vec<String>,

    /// Kafka consumer group id.
    #[clap(long, env = "LEDGER_GROUP_ID", default_value = "nrg-champ-ledger")]
    pub group_id: String,

    /// Grace period before a one-sided epoch is imputed, in milliseconds.
    #[clap(long, env = "LEDGER_EPOCH_GRACE_MS", default_value = "2000")]
    pub epoch_grace_ms: u64,

    /// Pending-buffer capacity, in epochs.
    #[clap(long, env = "LEDGER_BUFFER_MAX_EPOCHS", default_value = "200")]
    pub buffer_max_epochs: usize,

    /// Partition carrying the aggregator side.
    #[clap(long, env = "LEDGER_PARTITION_AGGREGATOR", default_value = "0")]
    pub partition_aggregator: i32,

    /// Partition carrying the MAPE side.
    #[clap(long, env = "LEDGER_PARTITION_MAPE", default_value = "1")]
    pub partition_mape: i32,

    /// Epoch length in milliseconds; must match the aggregator's.
    #[clap(long, env = "LEDGER_EPOCH_MS", default_value = "300000")]
    pub epoch_ms: u64,

    /// Per-fetch poll deadline for the ingest readers, in milliseconds.
    #[clap(long, env = "LEDGER_POLL_DEADLINE_MS", default_value = "120")]
    pub poll_deadline_ms: u64,

    /// Imputed MAPE target before any real event has been seen, in °C.
    #[clap(long, env = "LEDGER_DEFAULT_TARGET_C", default_value = "21.0")]
    pub default_target_c: f64,

    /// Directory holding the ledger file.
    #[clap(long, env = "LEDGER_DATA_DIRECTORY", default_value = "data")]
    pub data_directory: PathBuf,

    /// Address to serve Prometheus metrics on, if any.
    #[clap(long, env = "LEDGER_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,

    // === Public stream options. ===
    /// Whether to publish public epoch envelopes at all.
    #[clap(long, env = "LEDGER_PUBLIC_ENABLE", default_value = "false", parse(try_from_str))]
    pub public_enable: bool,

    /// The public epoch topic.
    #[clap(long, env = "LEDGER_PUBLIC_TOPIC", default_value = "ledger.public.epochs")]
    pub public_topic: String,

    /// Brokers for the public stream; defaults to the ingest brokers.
    #[clap(long, env = "LEDGER_PUBLIC_BROKERS")]
    pub public_brokers: Option<String>,

    /// Producer acks for the public stream: -1 (all ISRs), 0, or 1.
    #[clap(long, env = "LEDGER_PUBLIC_ACKS", default_value = "-1", allow_hyphen_values = true)]
    pub public_acks: i16,

    /// Partitioning policy for the public stream.
    #[clap(long, env = "LEDGER_PUBLIC_PARTITIONER", arg_enum, default_value = "hash")]
    pub public_partitioner: Partitioner,

    /// Message key derivation for the public stream.
    #[clap(long, env = "LEDGER_PUBLIC_KEY_MODE", arg_enum, default_value = "zone")]
    pub public_key_mode: KeyMode,

    /// Schema version stamped into every public envelope; must be non-empty.
    #[clap(long, env = "LEDGER_PUBLIC_SCHEMA_VERSION", default_value = "v1")]
    pub public_schema_version: String,

    /// Public publish queue capacity.
    #[clap(long, env = "LEDGER_PUBLIC_QUEUE_CAPACITY", default_value = "1024")]
    pub public_queue_capacity: usize,

    /// Publish retry attempts before an envelope is dropped.
    #[clap(long, env = "LEDGER_PUBLIC_MAX_RETRIES", default_value = "5")]
    pub public_max_retries: usize,

    #[clap(flatten)]
    pub breaker: BreakerArgs,
}

impl Args {
    /// Validates cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.topic_template.contains(ZONE_PLACEHOLDER) {
            anyhow::bail!("--topic-template must contain the {ZONE_PLACEHOLDER} placeholder");
        }
        if self.zones.iter().any(|z| z.trim().is_empty()) {
            anyhow::bail!("--zones must not contain empty zone ids");
        }
        if self.partition_aggregator == self.partition_mape {
            anyhow::bail!("--partition-aggregator and --partition-mape must differ");
        }
        if self.epoch_ms == 0 {
            anyhow::bail!("--epoch-ms must be positive");
        }
        if !matches!(self.public_acks, -1 | 0 | 1) {
            anyhow::bail!("--public-acks must be -1, 0, or 1");
        }
        if self.public_enable && self.public_schema_version.is_empty() {
            anyhow::bail!("--public-schema-version must be non-empty");
        }
        Ok(())
    }

    pub fn topic(&self, zone: &str) -> String {
        self.topic_template.replace(ZONE_PLACEHOLDER, zone)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.epoch_grace_ms)
    }

    pub fn epoch_length(&self) -> Duration {
        Duration::from_millis(self.epoch_ms)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_millis(self.poll_deadline_ms.max(1))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_directory.join(crate::store::LEDGER_FILE_NAME)
    }

    pub fn public_brokers(&self) -> &str {
        self.public_brokers.as_deref().unwrap_or(&self.kafka_brokers)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            topic: self.public_topic.clone(),
            schema_version: self.public_schema_version.clone(),
            key_mode: self.public_key_mode,
            partitioner: self.public_partitioner,
            queue_capacity: self.public_queue_capacity,
            retry_backoff: self.breaker.retry_backoff(),
            max_retries: self.public_max_retries,
        }
    }
}
