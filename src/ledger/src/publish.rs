// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The public epoch stream.
//!
//! After every successful append the writer enqueues a redacted projection of
//! the transaction; a worker drains the queue and produces onto the public
//! topic behind the `ledger-public` breaker. The stream is best-effort by
//! contract: the queue is bounded and drops oldest (with a metric) under
//! backpressure, and a failed publish never touches the committed ledger.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use champ_breaker::CircuitBreaker;
use champ_kafka_util::bus::BusProducer;
use champ_ore::now::NowFn;
use champ_ore::retry::Retry;
use champ_repr::PlannedAction;

use crate::block::BlockMeta;
use crate::metrics::LedgerMetrics;
use crate::transaction::Transaction;

/// The `type` field of every public envelope.
pub const PUBLIC_EPOCH_TYPE: &str = "epoch.public";

/// How the Kafka message key is derived from the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum KeyMode {
    /// Key by zone id: one partition per zone's stream.
    Zone,
    /// Key by `zone:epoch`.
    Epoch,
    /// No key.
    None,
}

/// How messages are spread across the public topic's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum Partitioner {
    /// Leave partitioning to the client's key hash.
    Hash,
    /// Explicit round-robin over the topic's partitions.
    #[clap(name = "roundrobin")]
    RoundRobin,
}

/// The redacted aggregator view: summary floats only, never device arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAggregator {
    pub summary: BTreeMap<String, f64>,
}

/// The redacted MAPE view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMape {
    pub planned: PlannedAction,
    pub target_c: f64,
    pub hysteresis_c: f64,
    pub delta_c: f64,
    pub fan: u8,
}

/// The block coordinates that anchor an envelope to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicBlockRef {
    pub height: u64,
    pub header_hash: String,
    pub data_hash: String,
}

/// One finalized epoch as seen by downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicEpoch {
    #[serde(rename = "type")]
    pub kind: String,
    pub schema_version: String,
    pub zone_id: String,
    pub epoch_index: u64,
    pub matched_at: DateTime<Utc>,
    pub aggregator: PublicAggregator,
    pub mape: PublicMape,
    #[serde(rename = "energyKWh_total")]
    pub energy_kwh_total: f64,
    /// The epoch window's start, RFC 3339.
    pub epoch: String,
    pub block: PublicBlockRef,
}

/// Projects a committed transaction into its public envelope.
pub fn project(tx: &Transaction, meta: &BlockMeta, schema_version: &str) -> PublicEpoch {
    PublicEpoch {
        kind: PUBLIC_EPOCH_TYPE.to_string(),
        schema_version: schema_version.to_string(),
        zone_id: tx.zone_id.clone(),
        epoch_index: tx.epoch_index,
        matched_at: tx.matched_at,
        aggregator: PublicAggregator {
            summary: tx.aggregator.summary.clone(),
        },
        mape: PublicMape {
            planned: tx.mape.planned,
            target_c: tx.mape.target_c,
            hysteresis_c: tx.mape.hysteresis_c,
            delta_c: tx.mape.delta_c,
            fan: tx.mape.fan,
        },
        energy_kwh_total: tx.aggregator.energy_kwh_total(),
        epoch: tx
            .aggregator
            .epoch
            .start
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        block: PublicBlockRef {
            height: meta.height,
            header_hash: meta.header_hash.clone(),
            data_hash: meta.data_hash.clone(),
        },
    }
}

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    /// Required non-empty; stamped into every envelope.
    pub schema_version: String,
    pub key_mode: KeyMode,
    pub partitioner: Partitioner,
    /// Bounded queue depth; overflow drops oldest.
    pub queue_capacity: usize,
    pub retry_backoff: Duration,
    pub max_retries: usize,
}

struct PublisherInner {
    cfg: PublisherConfig,
    queue: Mutex<VecDeque<PublicEpoch>>,
    notify: Notify,
    round_robin: AtomicUsize,
    metrics: LedgerMetrics,
    now: NowFn,
}

/// The bounded hand-off between the ledger writer and the publish worker.
///
/// `enqueue` never blocks the append path beyond a queue push.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(cfg: PublisherConfig, now: NowFn, metrics: LedgerMetrics) -> Publisher {
        assert!(
            !cfg.schema_version.is_empty(),
            "public schema version must be non-empty"
        );
        assert!(cfg.queue_capacity > 0, "publish queue must hold at least one envelope");
        Publisher {
            inner: Arc::new(PublisherInner {
                cfg,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                round_robin: AtomicUsize::new(0),
                metrics,
                now,
            }),
        }
    }

    /// Projects and enqueues one committed transaction. Called from the
    /// writer's append hook.
    pub fn enqueue(&self, tx: &Transaction, meta: &BlockMeta) {
        let envelope = project(tx, meta, &self.inner.cfg.schema_version);
        let depth = {
            let mut queue = self.inner.queue.lock().expect("publisher lock poisoned");
            if queue.len() >= self.inner.cfg.queue_capacity {
                let dropped = queue.pop_front();
                if let Some(dropped) = dropped {
                    warn!(
                        zone = %dropped.zone_id,
                        epoch = dropped.epoch_index,
                        "public queue full; dropping oldest envelope",
                    );
                    self.inner
                        .metrics
                        .public_publish_total
                        .with_label_values(&["dropped"])
                        .inc();
                }
            }
            queue.push_back(envelope);
            queue.len()
        };
        self.inner.metrics.public_queue_depth.set(depth as i64);
        self.inner.notify.notify_one();
    }

    fn pop(&self) -> Option<PublicEpoch> {
        let mut queue = self.inner.queue.lock().expect("publisher lock poisoned");
        let envelope = queue.pop_front();
        self.inner.metrics.public_queue_depth.set(queue.len() as i64);
        envelope
    }

    /// Drains the queue until shutdown, producing through `breaker`.
    pub async fn run_worker(
        self,
        producer: Arc<dyn BusProducer>,
        breaker: Arc<CircuitBreaker>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Round-robin needs the partition count once; hash mode leaves
        // placement to the client.
        let partitions = match self.inner.cfg.partitioner {
            Partitioner::RoundRobin => match producer.partition_count(&self.inner.cfg.topic) {
                Ok(n) => n.max(1),
                Err(e) => {
                    warn!(
                        topic = %self.inner.cfg.topic,
                        error = %e,
                        "could not resolve public topic partitions; falling back to a single partition",
                    );
                    1
                }
            },
            Partitioner::Hash => 1,
        };
        info!(topic = %self.inner.cfg.topic, "public publisher running");
        loop {
            let envelope = match self.pop() {
                Some(envelope) => envelope,
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => continue,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };
            self.publish_one(&*producer, &breaker, partitions, envelope).await;
        }
        info!(topic = %self.inner.cfg.topic, "public publisher stopped");
    }

    async fn publish_one(
        &self,
        producer: &dyn BusProducer,
        breaker: &CircuitBreaker,
        partitions: usize,
        envelope: PublicEpoch,
    ) {
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "public envelope failed to encode; dropping");
                self.record_failure();
                return;
            }
        };
        let key = match self.inner.cfg.key_mode {
            KeyMode::Zone => Some(envelope.zone_id.clone().into_bytes()),
            KeyMode::Epoch => {
                Some(format!("{}:{}", envelope.zone_id, envelope.epoch_index).into_bytes())
            }
            KeyMode::None => None,
        };
        let partition = match self.inner.cfg.partitioner {
            Partitioner::RoundRobin => Some(
                (self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % partitions) as i32,
            ),
            Partitioner::Hash => None,
        };

        let result = Retry::default()
            .initial_backoff(self.inner.cfg.retry_backoff)
            .clamp_backoff(Duration::from_secs(30))
            .max_tries(self.inner.cfg.max_retries.max(1))
            .retry_async(|_| {
                breaker.call(|| {
                    producer.produce(
                        &self.inner.cfg.topic,
                        key.as_deref(),
                        &payload,
                        partition,
                    )
                })
            })
            .await;

        match result {
            Ok(()) => {
                self.inner
                    .metrics
                    .public_publish_total
                    .with_label_values(&["ok"])
                    .inc();
            }
            Err(e) => {
                warn!(
                    zone = %envelope.zone_id,
                    epoch = envelope.epoch_index,
                    error = %e,
                    "public publish failed; envelope lost (ledger unaffected)",
                );
                self.record_failure();
            }
        }
    }

    fn record_failure(&self) {
        self.inner
            .metrics
            .public_publish_total
            .with_label_values(&["error"])
            .inc();
        self.inner
            .metrics
            .public_last_error_ts
            .set((self.inner.now.as_millis() / 1000) as i64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use champ_breaker::CircuitBreaker;
    use champ_kafka_util::bus::BusProducer;
    use champ_kafka_util::mem::InMemoryBus;
    use champ_ore::now::{system_time_now, NowFn};
    use champ_repr::PlannedAction;

    use crate::block::BlockMeta;
    use crate::metrics::LedgerMetrics;
    use crate::testutil::test_match;
    use crate::transaction::Transaction;

    use super::{project, KeyMode, Partitioner, Publisher, PublisherConfig, PublicEpoch};

    fn test_meta() -> BlockMeta {
        BlockMeta {
            height: 3,
            header_hash: "hh".into(),
            data_hash: "dh".into(),
        }
    }

    fn test_tx() -> Transaction {
        let mut m = test_match("A", 7);
        m.aggregator
            .summary
            .insert("zoneEnergyKWhEpoch".into(), 1.25);
        m.aggregator.by_device.insert("secret-device".into(), vec![]);
        Transaction::assemble(m, 1, String::new()).unwrap()
    }

    fn test_config(topic: &str) -> PublisherConfig {
        PublisherConfig {
            topic: topic.into(),
            schema_version: "v1".into(),
            key_mode: KeyMode::Zone,
            partitioner: Partitioner::Hash,
            queue_capacity: 4,
            retry_backoff: Duration::from_millis(1),
            max_retries: 2,
        }
    }

    fn test_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            champ_breaker::Config {
                name: "ledger-public".into(),
                enabled: true,
                max_failures: 5,
                reset_timeout: Duration::from_secs(1),
                successes_to_close: 1,
                probe_timeout: Duration::from_secs(1),
            },
            system_time_now(),
        ))
    }

    #[test]
    fn test_projection_redacts_device_data() {
        let tx = test_tx();
        let envelope = project(&tx, &test_meta(), "v1");

        assert_eq!(envelope.kind, "epoch.public");
        assert_eq!(envelope.energy_kwh_total, 1.25);
        assert_eq!(envelope.mape.planned, PlannedAction::Hold);
        assert_eq!(envelope.block.height, 3);
        assert_eq!(envelope.epoch, "1970-01-01T00:35:00Z");

        // Nothing device-level survives serialization.
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("secret-device"));
        assert!(!json.contains("byDevice"));
        assert!(json.contains("\"energyKWh_total\":1.25"));
    }

    #[test]
    fn test_projection_defaults_energy_to_zero() {
        let mut tx = test_tx();
        tx.aggregator.summary = BTreeMap::new();
        let envelope = project(&tx, &test_meta(), "v1");
        assert_eq!(envelope.energy_kwh_total, 0.0);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let metrics = LedgerMetrics::unregistered();
        let publisher = Publisher::new(
            test_config("ledger.public.epochs"),
            NowFn::from(|| 0),
            metrics.clone(),
        );
        let meta = test_meta();
        for epoch in 1..=6u64 {
            let tx = Transaction::assemble(test_match("A", epoch), 1, String::new()).unwrap();
            publisher.enqueue(&tx, &meta);
        }
        assert_eq!(metrics.public_queue_depth.get(), 4);
        assert_eq!(
            metrics.public_publish_total.with_label_values(&["dropped"]).get(),
            2
        );
        // The survivors are the newest four.
        assert_eq!(publisher.pop().unwrap().epoch_index, 3);
    }

    #[tokio::test]
    async fn test_worker_publishes_with_zone_key() {
        let bus = InMemoryBus::new();
        bus.create_topic("ledger.public.epochs", 2);
        let metrics = LedgerMetrics::unregistered();
        let publisher = Publisher::new(
            test_config("ledger.public.epochs"),
            system_time_now(),
            metrics.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let producer: Arc<dyn BusProducer> = Arc::new(bus.clone());
        let worker = tokio::spawn(publisher.clone().run_worker(
            producer,
            test_breaker(),
            shutdown_rx,
        ));

        publisher.enqueue(&test_tx(), &test_meta());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records: Vec<_> = (0..2).flat_map(|p| bus.records("ledger.public.epochs", p)).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some(b"A".as_slice()));
        let envelope: PublicEpoch = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(envelope.epoch_index, 7);
        assert_eq!(metrics.public_publish_total.with_label_values(&["ok"]).get(), 1);
        assert_eq!(metrics.public_queue_depth.get(), 0);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_roundrobin_spreads_partitions() {
        let bus = InMemoryBus::new();
        bus.create_topic("ledger.public.epochs", 3);
        let metrics = LedgerMetrics::unregistered();
        let mut cfg = test_config("ledger.public.epochs");
        cfg.partitioner = Partitioner::RoundRobin;
        cfg.key_mode = KeyMode::None;
        cfg.queue_capacity = 16;
        let publisher = Publisher::new(cfg, system_time_now(), metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let producer: Arc<dyn BusProducer> = Arc::new(bus.clone());
        let worker = tokio::spawn(publisher.clone().run_worker(
            producer,
            test_breaker(),
            shutdown_rx,
        ));

        let meta = test_meta();
        for epoch in 1..=6u64 {
            let tx = Transaction::assemble(test_match("A", epoch), 1, String::new()).unwrap();
            publisher.enqueue(&tx, &meta);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        for p in 0..3 {
            assert_eq!(bus.records("ledger.public.epochs", p).len(), 2);
        }
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_and_nonfatal() {
        let bus = InMemoryBus::new();
        // Topic never created: every produce fails.
        let metrics = LedgerMetrics::unregistered();
        let publisher = Publisher::new(
            test_config("ledger.public.epochs"),
            system_time_now(),
            metrics.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let producer: Arc<dyn BusProducer> = Arc::new(bus);
        let worker = tokio::spawn(publisher.clone().run_worker(
            producer,
            test_breaker(),
            shutdown_rx,
        ));

        publisher.enqueue(&test_tx(), &test_meta());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            metrics.public_publish_total.with_label_values(&["error"]).get(),
            1
        );
        assert!(metrics.public_last_error_ts.get() > 0);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
