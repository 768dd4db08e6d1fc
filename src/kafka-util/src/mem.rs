// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory bus for tests.
//!
//! Topics are created explicitly with a fixed partition count; readers have
//! their own cursors and committed offsets, so seek/commit semantics mirror
//! the Kafka implementation closely enough for the epoch machinery's tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::bus::{BusError, BusProducer, BusRecord, PartitionReader};

#[derive(Debug, Default)]
struct Partition {
    records: Vec<(Option<Vec<u8>>, Vec<u8>, i64)>,
    committed: i64,
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Vec<Partition>>,
}

/// A process-local bus.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
    round_robin: Arc<AtomicUsize>,
}

impl InMemoryBus {
    pub fn new() -> InMemoryBus {
        InMemoryBus::default()
    }

    /// Creates `topic` with `partitions` partitions. Recreating a topic
    /// resets it.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        assert!(partitions > 0, "topics must have at least one partition");
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let parts = (0..partitions).map(|_| Partition::default()).collect();
        inner.topics.insert(topic.to_string(), parts);
    }

    /// Returns a reader over one partition, starting from its committed
    /// offset.
    pub fn reader(&self, topic: &str, partition: i32) -> Result<InMemoryReader, BusError> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        let parts = inner
            .topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let part = parts
            .get(partition as usize)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        Ok(InMemoryReader {
            bus: self.clone(),
            topic: topic.to_string(),
            partition,
            cursor: part.committed,
        })
    }

    /// Returns all records currently in a partition, for assertions.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<BusRecord> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        let parts = match inner.topics.get(topic) {
            Some(parts) => parts,
            None => return Vec::new(),
        };
        let part = match parts.get(partition as usize) {
            Some(part) => part,
            None => return Vec::new(),
        };
        part.records
            .iter()
            .enumerate()
            .map(|(offset, (key, payload, ts))| BusRecord {
                key: key.clone(),
                payload: payload.clone(),
                partition,
                offset: offset as i64,
                timestamp_ms: Some(*ts),
            })
            .collect()
    }

    /// Returns the committed offset of a partition.
    pub fn committed(&self, topic: &str, partition: i32) -> i64 {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|part| part.committed)
            .unwrap_or(0)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait]
impl BusProducer for InMemoryBus {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        partition: Option<i32>,
    ) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let parts = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let n = parts.len();
        let pid = match partition {
            Some(p) => p as usize,
            None => match key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % n as u64) as usize
                }
                None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
            },
        };
        let part = parts.get_mut(pid).ok_or_else(|| BusError::UnknownPartition {
            topic: topic.to_string(),
            partition: pid as i32,
        })?;
        part.records
            .push((key.map(|k| k.to_vec()), payload.to_vec(), now_ms()));
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<usize, BusError> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner
            .topics
            .get(topic)
            .map(|parts| parts.len())
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }
}

/// A [`PartitionReader`] over an [`InMemoryBus`] partition.
#[derive(Debug)]
pub struct InMemoryReader {
    bus: InMemoryBus,
    topic: String,
    partition: i32,
    cursor: i64,
}

impl PartitionReader for InMemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn fetch(&mut self, _deadline: Duration) -> Result<Option<BusRecord>, BusError> {
        let inner = self.bus.inner.lock().expect("bus lock poisoned");
        let parts = inner
            .topics
            .get(&self.topic)
            .ok_or_else(|| BusError::UnknownTopic(self.topic.clone()))?;
        let part = parts
            .get(self.partition as usize)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: self.topic.clone(),
                partition: self.partition,
            })?;
        match part.records.get(self.cursor as usize) {
            None => Ok(None),
            Some((key, payload, ts)) => {
                let record = BusRecord {
                    key: key.clone(),
                    payload: payload.clone(),
                    partition: self.partition,
                    offset: self.cursor,
                    timestamp_ms: Some(*ts),
                };
                self.cursor += 1;
                Ok(Some(record))
            }
        }
    }

    fn seek(&mut self, offset: i64) -> Result<(), BusError> {
        self.cursor = offset;
        Ok(())
    }

    fn commit(&mut self, next_offset: i64) -> Result<(), BusError> {
        let mut inner = self.bus.inner.lock().expect("bus lock poisoned");
        let parts = inner
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::UnknownTopic(self.topic.clone()))?;
        let part = parts
            .get_mut(self.partition as usize)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: self.topic.clone(),
                partition: self.partition,
            })?;
        part.committed = next_offset;
        Ok(())
    }
}
