// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-zone epoch draining.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use champ_kafka_util::bus::{BusError, BusRecord, PartitionReader};
use champ_repr::aggregate::{
    SUMMARY_READING_COUNT, SUMMARY_ZONE_AVG_TEMP, SUMMARY_ZONE_ENERGY_KWH,
};
use champ_repr::{AggregatedEpoch, AggregatedReading, DeviceReading, EpochWindow, SCHEMA_VERSION};

use crate::metrics::AggregatorMetrics;

/// Why a reading was dropped during a drain pass.
const REASON_MALFORMED: &str = "malformed";
const REASON_LATE: &str = "late";
const REASON_WRONG_ZONE: &str = "wrong_zone";

/// The offsets a drain pass consumed on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    pub partition: i32,
    /// The first offset read in this pass; the rollback point if the emitted
    /// epoch fails to produce.
    pub first_offset: i64,
    /// One past the last consumed offset; the commit point once the emitted
    /// epoch is durable downstream.
    pub next_offset: i64,
}

/// The result of draining one epoch on one zone.
#[derive(Debug)]
pub struct DrainOutcome {
    pub epoch: AggregatedEpoch,
    pub progress: Vec<PartitionProgress>,
}

/// Drains one zone topic's partitions epoch by epoch.
pub struct EpochDrainer {
    zone_id: String,
    epoch_length: Duration,
    poll_deadline: Duration,
    partitions: Vec<Box<dyn PartitionReader>>,
    metrics: AggregatorMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionStatus {
    /// Still yielding messages for the target epoch.
    Draining,
    /// Hit the first message of a later epoch, or ran dry.
    Finished,
}

impl EpochDrainer {
    pub fn new(
        zone_id: String,
        epoch_length: Duration,
        poll_deadline: Duration,
        partitions: Vec<Box<dyn PartitionReader>>,
        metrics: AggregatorMetrics,
    ) -> EpochDrainer {
        assert!(!partitions.is_empty(), "zone must have at least one partition");
        EpochDrainer {
            zone_id,
            epoch_length,
            poll_deadline,
            partitions,
            metrics,
        }
    }

    /// Drains every partition up to the boundary of epoch `target` and
    /// returns the bucketed [`AggregatedEpoch`].
    ///
    /// Visits partitions round-robin, one fetch per visit, until each has
    /// either yielded a message of a later epoch (which is seeked back and
    /// left unread) or yielded nothing within the poll deadline. Offsets are
    /// *not* committed here; the caller commits [`DrainOutcome::progress`]
    /// after the emitted epoch is durable.
    pub fn drain_epoch(
        &mut self,
        target: u64,
        produced_at: DateTime<Utc>,
    ) -> Result<DrainOutcome, BusError> {
        let window = EpochWindow::at(target, self.epoch_length);
        let mut status = vec![PartitionStatus::Draining; self.partitions.len()];
        let mut progress: Vec<Option<PartitionProgress>> = vec![None; self.partitions.len()];
        // Buffered as (reading, offset) so ties on equal timestamps break by
        // arrival order within the partition.
        let mut by_device: BTreeMap<String, Vec<(AggregatedReading, i64)>> = BTreeMap::new();

        while status.contains(&PartitionStatus::Draining) {
            for idx in 0..self.partitions.len() {
                if status[idx] == PartitionStatus::Finished {
                    continue;
                }
                let partition = self.partitions[idx].partition();
                let record = match self.partitions[idx].fetch(self.poll_deadline)? {
                    Some(record) => record,
                    None => {
                        status[idx] = PartitionStatus::Finished;
                        continue;
                    }
                };
                let offset = record.offset;
                match self.bucket(&window, target, record, &mut by_device) {
                    Bucketed::Consumed => {
                        let entry = progress[idx].get_or_insert(PartitionProgress {
                            partition,
                            first_offset: offset,
                            next_offset: offset,
                        });
                        entry.next_offset = offset + 1;
                    }
                    Bucketed::NextEpoch => {
                        // Leave the boundary message unread for the next pass.
                        self.partitions[idx].seek(offset)?;
                        status[idx] = PartitionStatus::Finished;
                    }
                }
            }
        }

        let epoch = self.assemble(window, by_device, produced_at);
        Ok(DrainOutcome {
            epoch,
            progress: progress.into_iter().flatten().collect(),
        })
    }

    fn bucket(
        &self,
        window: &EpochWindow,
        target: u64,
        record: BusRecord,
        by_device: &mut BTreeMap<String, Vec<(AggregatedReading, i64)>>,
    ) -> Bucketed {
        let reading: DeviceReading = match serde_json::from_slice(&record.payload) {
            Ok(reading) => reading,
            Err(e) => {
                debug!(zone = %self.zone_id, offset = record.offset, error = %e, "undecodable telemetry");
                self.metrics.decode_errors.with_label_values(&[&self.zone_id]).inc();
                return Bucketed::Consumed;
            }
        };

        let index = EpochWindow::index_for(reading.timestamp, self.epoch_length);
        if index > target {
            return Bucketed::NextEpoch;
        }
        if index < target {
            // A straggler from an epoch that has already been emitted; the
            // ledger has moved on (or will impute), so it can only be dropped.
            self.metrics
                .discarded_readings
                .with_label_values(&[&self.zone_id, REASON_LATE])
                .inc();
            return Bucketed::Consumed;
        }
        if reading.zone_id != self.zone_id {
            warn!(
                zone = %self.zone_id,
                found = %reading.zone_id,
                device = %reading.device_id,
                "telemetry for foreign zone on this topic",
            );
            self.metrics
                .discarded_readings
                .with_label_values(&[&self.zone_id, REASON_WRONG_ZONE])
                .inc();
            return Bucketed::Consumed;
        }
        if !reading.is_well_formed() {
            self.metrics
                .discarded_readings
                .with_label_values(&[&self.zone_id, REASON_MALFORMED])
                .inc();
            return Bucketed::Consumed;
        }
        debug_assert!(window.contains(reading.timestamp));

        by_device
            .entry(reading.device_id.clone())
            .or_default()
            .push((AggregatedReading::from(reading), record.offset));
        Bucketed::Consumed
    }

    fn assemble(
        &self,
        window: EpochWindow,
        by_device: BTreeMap<String, Vec<(AggregatedReading, i64)>>,
        produced_at: DateTime<Utc>,
    ) -> AggregatedEpoch {
        let mut out: BTreeMap<String, Vec<AggregatedReading>> = BTreeMap::new();
        let mut temp_sum = 0.0;
        let mut temp_count = 0u64;
        let mut energy_kwh = 0.0;
        let mut reading_count = 0u64;
        for (device, mut readings) in by_device {
            readings.sort_by(|(a, ao), (b, bo)| a.timestamp.cmp(&b.timestamp).then(ao.cmp(bo)));
            for (reading, _) in &readings {
                reading_count += 1;
                if let Some(t) = reading.temperature {
                    temp_sum += t;
                    temp_count += 1;
                }
                if let Some(e) = reading.energy_kwh {
                    energy_kwh += e;
                }
            }
            out.insert(device, readings.into_iter().map(|(r, _)| r).collect());
        }

        let mut summary = BTreeMap::new();
        summary.insert(SUMMARY_ZONE_ENERGY_KWH.to_string(), energy_kwh);
        let avg = if temp_count > 0 {
            temp_sum / temp_count as f64
        } else {
            0.0
        };
        summary.insert(SUMMARY_ZONE_AVG_TEMP.to_string(), avg);
        summary.insert(SUMMARY_READING_COUNT.to_string(), reading_count as f64);

        AggregatedEpoch {
            schema_version: SCHEMA_VERSION.to_string(),
            zone_id: self.zone_id.clone(),
            epoch: window,
            by_device: out,
            summary,
            produced_at,
        }
    }

    /// Rolls every partition that made progress in a failed pass back to its
    /// first consumed offset, so the next pass re-reads it.
    pub fn rollback(&mut self, progress: &[PartitionProgress]) -> Result<(), BusError> {
        for p in progress {
            let reader = self
                .partitions
                .iter_mut()
                .find(|r| r.partition() == p.partition)
                .expect("progress refers to a drained partition");
            reader.seek(p.first_offset)?;
        }
        Ok(())
    }

    /// Commits the consumed offsets of a successfully emitted pass.
    pub fn commit(&mut self, progress: &[PartitionProgress]) -> Result<(), BusError> {
        for p in progress {
            let reader = self
                .partitions
                .iter_mut()
                .find(|r| r.partition() == p.partition)
                .expect("progress refers to a drained partition");
            reader.commit(p.next_offset)?;
        }
        Ok(())
    }
}

enum Bucketed {
    Consumed,
    NextEpoch,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use prometheus::Registry;

    use champ_kafka_util::bus::{BusProducer, PartitionReader};
    use champ_kafka_util::mem::InMemoryBus;
    use champ_repr::reading::ReadingBody;
    use champ_repr::{DeviceReading, DeviceType, EpochWindow};

    use crate::metrics::AggregatorMetrics;

    use super::EpochDrainer;

    const EPOCH_LEN: Duration = Duration::from_secs(300);
    const POLL: Duration = Duration::from_millis(1);

    fn reading(device: &str, epoch: u64, secs_into: i64, temp: f64) -> Vec<u8> {
        let start = EpochWindow::at(epoch, EPOCH_LEN).start;
        let r = DeviceReading {
            device_id: device.into(),
            device_type: DeviceType::TempSensor,
            zone_id: "A".into(),
            timestamp: start + chrono::Duration::seconds(secs_into),
            reading: ReadingBody {
                temperature: Some(temp),
                ..Default::default()
            },
        };
        serde_json::to_vec(&r).unwrap()
    }

    async fn drainer_with(
        bus: &InMemoryBus,
        topic: &str,
        partitions: usize,
    ) -> (EpochDrainer, AggregatorMetrics) {
        let metrics = AggregatorMetrics::register_into(&Registry::new());
        let readers: Vec<Box<dyn PartitionReader>> = (0..partitions)
            .map(|p| Box::new(bus.reader(topic, p as i32).unwrap()) as Box<dyn PartitionReader>)
            .collect();
        let drainer = EpochDrainer::new(
            "A".into(),
            EPOCH_LEN,
            POLL,
            readers,
            metrics.clone(),
        );
        (drainer, metrics)
    }

    // Messages with epoch indices [4, 4, 5] and drain target 4: the first two
    // are consumed, the third stops the partition and stays unread.
    #[tokio::test]
    async fn test_epoch_boundary_stop_leaves_message_unread() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 1);
        bus.produce("t", None, &reading("d1", 4, 10, 20.0), Some(0)).await.unwrap();
        bus.produce("t", None, &reading("d1", 4, 250, 21.0), Some(0)).await.unwrap();
        bus.produce("t", None, &reading("d1", 5, 10, 22.0), Some(0)).await.unwrap();

        let (mut drainer, _) = drainer_with(&bus, "t", 1).await;
        let out = drainer.drain_epoch(4, Utc::now()).unwrap();

        assert_eq!(out.epoch.by_device["d1"].len(), 2);
        assert_eq!(out.progress.len(), 1);
        assert_eq!(out.progress[0].first_offset, 0);
        assert_eq!(out.progress[0].next_offset, 2);

        // The next pass begins at the boundary message.
        let next = drainer.drain_epoch(5, Utc::now()).unwrap();
        assert_eq!(next.epoch.by_device["d1"].len(), 1);
        assert_eq!(next.epoch.by_device["d1"][0].temperature, Some(22.0));
        assert_eq!(next.progress[0].first_offset, 2);
    }

    #[tokio::test]
    async fn test_round_robin_drains_all_partitions() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 3);
        for p in 0..3 {
            for i in 0..4 {
                bus.produce("t", None, &reading(&format!("d{p}"), 7, 10 + i, 20.0), Some(p as i32))
                    .await
                    .unwrap();
            }
        }

        let (mut drainer, _) = drainer_with(&bus, "t", 3).await;
        let out = drainer.drain_epoch(7, Utc::now()).unwrap();
        assert_eq!(out.epoch.by_device.len(), 3);
        assert!(out.epoch.by_device.values().all(|rs| rs.len() == 4));
        assert_eq!(out.progress.len(), 3);
    }

    #[tokio::test]
    async fn test_outliers_are_discarded_and_counted() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 1);
        bus.produce("t", None, b"not json at all", Some(0)).await.unwrap();
        // Role mismatch: a heating actuator reporting a bare temperature and
        // no state bit.
        let start = EpochWindow::at(4, EPOCH_LEN).start;
        let bad_role = DeviceReading {
            device_id: "h1".into(),
            device_type: DeviceType::ActHeating,
            zone_id: "A".into(),
            timestamp: start + chrono::Duration::seconds(5),
            reading: ReadingBody {
                temperature: Some(19.0),
                ..Default::default()
            },
        };
        bus.produce("t", None, &serde_json::to_vec(&bad_role).unwrap(), Some(0))
            .await
            .unwrap();
        bus.produce("t", None, &reading("d1", 4, 20, 21.0), Some(0)).await.unwrap();

        let (mut drainer, metrics) = drainer_with(&bus, "t", 1).await;
        let out = drainer.drain_epoch(4, Utc::now()).unwrap();

        assert_eq!(out.epoch.by_device.len(), 1);
        assert_eq!(out.epoch.by_device["d1"].len(), 1);
        assert_eq!(
            metrics.discarded_readings.with_label_values(&["A", "malformed"]).get(),
            1
        );
        assert_eq!(metrics.decode_errors.with_label_values(&["A"]).get(), 1);
        // All three offsets consumed; only good data bucketed.
        assert_eq!(out.progress[0].next_offset, 3);
    }

    #[tokio::test]
    async fn test_summary_and_ordering() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 1);
        // Same timestamp on both: order must fall back to offset.
        let ts = EpochWindow::at(9, EPOCH_LEN).start + chrono::Duration::seconds(30);
        for temp in [20.0, 24.0] {
            let r = DeviceReading {
                device_id: "d1".into(),
                device_type: DeviceType::TempSensor,
                zone_id: "A".into(),
                timestamp: ts,
                reading: ReadingBody {
                    temperature: Some(temp),
                    ..Default::default()
                },
            };
            bus.produce("t", None, &serde_json::to_vec(&r).unwrap(), Some(0))
                .await
                .unwrap();
        }
        let energy = DeviceReading {
            device_id: "vent".into(),
            device_type: DeviceType::ActVentilation,
            zone_id: "A".into(),
            timestamp: ts,
            reading: ReadingBody {
                actuator_state: Some(true),
                power_w: Some(50.0),
                energy_kwh: Some(0.25),
                ..Default::default()
            },
        };
        bus.produce("t", None, &serde_json::to_vec(&energy).unwrap(), Some(0))
            .await
            .unwrap();

        let (mut drainer, _) = drainer_with(&bus, "t", 1).await;
        let out = drainer.drain_epoch(9, Utc::now()).unwrap();

        assert_eq!(out.epoch.by_device["d1"][0].temperature, Some(20.0));
        assert_eq!(out.epoch.by_device["d1"][1].temperature, Some(24.0));
        assert_eq!(out.epoch.summary["zoneAvgTempC"], 22.0);
        assert_eq!(out.epoch.summary["zoneEnergyKWhEpoch"], 0.25);
        assert_eq!(out.epoch.summary["readingCount"], 3.0);
    }

    #[tokio::test]
    async fn test_rollback_rewinds_to_pass_start() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 1);
        bus.produce("t", None, &reading("d1", 4, 10, 20.0), Some(0)).await.unwrap();
        bus.produce("t", None, &reading("d1", 4, 20, 21.0), Some(0)).await.unwrap();

        let (mut drainer, _) = drainer_with(&bus, "t", 1).await;
        let out = drainer.drain_epoch(4, Utc::now()).unwrap();
        assert_eq!(out.epoch.by_device["d1"].len(), 2);

        // Downstream produce failed: rewind, then the same pass repeats.
        drainer.rollback(&out.progress).unwrap();
        let again = drainer.drain_epoch(4, Utc::now()).unwrap();
        assert_eq!(again.epoch.by_device["d1"].len(), 2);
        assert_eq!(again.progress, out.progress);
    }

    #[tokio::test]
    async fn test_empty_pass_emits_empty_epoch() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 2);
        let (mut drainer, _) = drainer_with(&bus, "t", 2).await;
        let out = drainer.drain_epoch(4, Utc::now()).unwrap();
        assert!(out.epoch.by_device.is_empty());
        assert!(out.progress.is_empty());
        let ts = Utc.timestamp_opt(4 * 300, 0).unwrap();
        assert_eq!(out.epoch.epoch.start, ts);
    }
}
