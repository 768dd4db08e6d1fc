// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The message-bus abstraction.

use std::time::Duration;

use async_trait::async_trait;

/// An error from a bus operation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("unknown partition {partition} of topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },
    #[error("bus error: {0}")]
    Other(String),
}

/// A message as read from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub partition: i32,
    /// The record's position within its partition.
    pub offset: i64,
    /// Broker-assigned timestamp in epoch milliseconds, when known.
    pub timestamp_ms: Option<i64>,
}

/// Produces messages onto a topic.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Produces one message and waits for the configured acknowledgement
    /// level.
    ///
    /// When `partition` is `None`, the implementation's partitioner chooses
    /// based on `key` (keyless messages round-robin).
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        partition: Option<i32>,
    ) -> Result<(), BusError>;

    /// Returns the number of partitions of `topic`.
    ///
    /// Resolved once at startup by callers that do their own partitioning;
    /// implementations may block.
    fn partition_count(&self, topic: &str) -> Result<usize, BusError>;
}

/// Reads one partition of one topic, with explicit offset control.
///
/// Readers are deliberately synchronous: each one is owned by a dedicated
/// thread (one drain loop per zone, one consumer thread per ledger-ingest
/// partition), which is also how the underlying `BaseConsumer` wants to be
/// driven.
pub trait PartitionReader: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Fetches the next record, waiting at most `deadline`. `Ok(None)` means
    /// the partition yielded nothing within the deadline.
    fn fetch(&mut self, deadline: Duration) -> Result<Option<BusRecord>, BusError>;

    /// Repositions the reader so the next fetch returns the record at
    /// `offset`. Used to leave a record unread after peeking past an epoch
    /// boundary.
    fn seek(&mut self, offset: i64) -> Result<(), BusError>;

    /// Durably marks `next_offset` as the resume position for this reader's
    /// group: all records below it are consumed.
    fn commit(&mut self, next_offset: i64) -> Result<(), BusError>;
}
