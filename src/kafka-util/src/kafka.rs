// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! rdkafka-backed bus implementations.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::Message;
use tracing::info;

use crate::bus::{BusError, BusProducer, BusRecord, PartitionReader};
use crate::client::{consumer_config, create_new_client_config, ChampClientContext};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A producer that waits for broker acknowledgement on every message.
pub struct KafkaProducer {
    producer: FutureProducer<ChampClientContext>,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// Creates a producer against `brokers` with the requested ack level
    /// (`-1` = all in-sync replicas, `0` = none, `1` = leader only).
    pub fn new(brokers: &str, acks: i16) -> Result<KafkaProducer, BusError> {
        let mut config = create_new_client_config(brokers);
        config.set("request.required.acks", acks.to_string());
        // Bound how long a message may sit in the client before we call the
        // produce failed; retries happen above us, behind the breaker.
        config.set("message.timeout.ms", "30000");
        let producer = config.create_with_context(ChampClientContext)?;
        Ok(KafkaProducer {
            producer,
            send_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl BusProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        partition: Option<i32>,
    ) -> Result<(), BusError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _msg)| BusError::Kafka(e))?;
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<usize, BusError> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
        let topic_meta = metadata
            .topics()
            .first()
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        if topic_meta.partitions().is_empty() {
            return Err(BusError::UnknownTopic(topic.to_string()));
        }
        Ok(topic_meta.partitions().len())
    }
}

/// A reader over a single manually-assigned partition.
///
/// Each reader owns its own `BaseConsumer`: partitions are drained by
/// dedicated threads and never rebalance, so there is no consumer-group
/// coordination to share.
pub struct KafkaPartitionReader {
    topic: String,
    partition: i32,
    consumer: BaseConsumer<ChampClientContext>,
}

impl KafkaPartitionReader {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<KafkaPartitionReader, BusError> {
        let consumer: BaseConsumer<_> =
            consumer_config(brokers, group_id).create_with_context(ChampClientContext)?;
        let mut assignment = TopicPartitionList::new();
        // `Offset::Stored` resumes from the group's committed position, or
        // falls back to `auto.offset.reset`.
        assignment
            .add_partition_offset(topic, partition, Offset::Stored)
            .expect("offset known to be valid");
        consumer.assign(&assignment)?;
        info!(topic, partition, group_id, "assigned kafka partition reader");
        Ok(KafkaPartitionReader {
            topic: topic.to_string(),
            partition,
            consumer,
        })
    }
}

impl PartitionReader for KafkaPartitionReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn fetch(&mut self, deadline: Duration) -> Result<Option<BusRecord>, BusError> {
        match self.consumer.poll(deadline) {
            None => Ok(None),
            Some(Err(e)) => Err(BusError::Kafka(e)),
            Some(Ok(msg)) => Ok(Some(BusRecord {
                key: msg.key().map(|k| k.to_vec()),
                payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
                partition: msg.partition(),
                offset: msg.offset(),
                timestamp_ms: msg.timestamp().to_millis(),
            })),
        }
    }

    fn seek(&mut self, offset: i64) -> Result<(), BusError> {
        self.consumer.seek(
            &self.topic,
            self.partition,
            Offset::Offset(offset),
            Duration::from_secs(1),
        )?;
        Ok(())
    }

    fn commit(&mut self, next_offset: i64) -> Result<(), BusError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(next_offset))
            .expect("offset known to be valid");
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }
}
