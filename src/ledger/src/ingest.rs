// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Two-sided epoch matching.
//!
//! Each zone runs one [`Matcher`] fed from the two partitions of its
//! `zone.ledger.<zone>` topic. An epoch's record is created when its first
//! side arrives, mutated only by the arrival of the second side (or by
//! imputation when the grace timer fires), and destroyed at finalization.
//!
//! Finalization within a zone is strictly increasing by epoch index: a
//! completed epoch waits for every older pending epoch to resolve first,
//! which the grace timer bounds. Anything arriving behind the finalized
//! frontier is dropped and counted, never re-finalized.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use champ_kafka_util::bus::BusRecord;
use champ_ore::now::{EpochMillis, NowFn};
use champ_repr::{AggregatedEpoch, EpochWindow, MapeLedgerEvent};

use crate::metrics::LedgerMetrics;
use crate::transaction::EpochMatch;

/// Which partition a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Aggregator,
    Mape,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Aggregator => "aggregator",
            Side::Mape => "mape",
        }
    }
}

/// Matcher configuration for one zone.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub zone_id: String,
    /// How long a one-sided epoch may wait before the missing side is
    /// imputed.
    pub grace: Duration,
    /// Pending-buffer capacity; the oldest entry is evicted (loudly) when
    /// exceeded.
    pub buffer_max_epochs: usize,
    /// Imputed MAPE target before any real event has been seen.
    pub default_target_c: f64,
    pub epoch_length: Duration,
}

#[derive(Debug)]
struct Pending {
    aggregator: Option<(AggregatedEpoch, DateTime<Utc>)>,
    aggregator_offset: Option<i64>,
    mape: Option<(MapeLedgerEvent, DateTime<Utc>)>,
    mape_offset: Option<i64>,
    first_seen: EpochMillis,
}

impl Pending {
    fn new(first_seen: EpochMillis) -> Pending {
        Pending {
            aggregator: None,
            aggregator_offset: None,
            mape: None,
            mape_offset: None,
            first_seen,
        }
    }

    fn complete(&self) -> bool {
        self.aggregator.is_some() && self.mape.is_some()
    }
}

/// A successfully decoded ingest payload.
enum Decoded {
    Aggregator(AggregatedEpoch),
    Mape(MapeLedgerEvent),
}

impl Decoded {
    fn epoch_index(&self) -> u64 {
        match self {
            Decoded::Aggregator(agg) => agg.epoch.index,
            Decoded::Mape(ev) => ev.epoch_index,
        }
    }

    fn zone_id(&self) -> &str {
        match self {
            Decoded::Aggregator(agg) => &agg.zone_id,
            Decoded::Mape(ev) => &ev.zone_id,
        }
    }
}

/// A finalized epoch, ready for the ledger writer. Carries the highest
/// contributing offset per side so consumption can be committed once the
/// append lands.
#[derive(Debug)]
pub struct Finalized {
    pub matched: EpochMatch,
    /// The side that was synthesized, if any.
    pub imputed: Option<Side>,
    pub aggregator_offset: Option<i64>,
    pub mape_offset: Option<i64>,
}

/// The per-zone pairing state machine.
///
/// Purely synchronous: callers feed records and fire the grace timer; the
/// surrounding service owns channels and clocks, which keeps every pairing
/// rule unit-testable.
pub struct Matcher {
    cfg: MatcherConfig,
    now: NowFn,
    metrics: LedgerMetrics,
    pending: BTreeMap<u64, Pending>,
    /// Arrival order, for eviction; holds keys only, never back-pointers.
    arrivals: VecDeque<u64>,
    /// Recently finalized keys, bounded by `buffer_max_epochs`.
    finalized_ring: VecDeque<u64>,
    finalized_keys: HashSet<u64>,
    last_finalized: Option<u64>,
    last_target_c: Option<f64>,
}

impl Matcher {
    pub fn new(cfg: MatcherConfig, now: NowFn, metrics: LedgerMetrics) -> Matcher {
        assert!(cfg.buffer_max_epochs > 0, "buffer must hold at least one epoch");
        Matcher {
            cfg,
            now,
            metrics,
            pending: BTreeMap::new(),
            arrivals: VecDeque::new(),
            finalized_ring: VecDeque::new(),
            finalized_keys: HashSet::new(),
            last_finalized: None,
            last_target_c: None,
        }
    }

    /// Ingests one record from the given side and returns any finalizations
    /// it unlocked, in epoch order.
    pub fn handle_record(&mut self, side: Side, record: &BusRecord) -> Vec<Finalized> {
        let received_at = self.now.as_datetime();
        let decoded = match self.decode(side, record) {
            Some(decoded) => decoded,
            None => return Vec::new(),
        };
        let epoch_index = decoded.epoch_index();
        if self.is_stale(epoch_index) {
            debug!(
                zone = %self.cfg.zone_id,
                epoch = epoch_index,
                side = side.as_str(),
                "record behind the finalized frontier; dropping",
            );
            self.metrics
                .decode_errors_total
                .with_label_values(&[side.as_str()])
                .inc();
            return Vec::new();
        }

        let first_seen = self.now.as_millis();
        if let Decoded::Mape(ev) = &decoded {
            self.last_target_c = Some(ev.target_c);
        }
        let entry = self
            .pending
            .entry(epoch_index)
            .or_insert_with(|| Pending::new(first_seen));
        let was_new = entry.aggregator.is_none() && entry.mape.is_none();
        // A replaced duplicate is an upstream re-run; the latest emission
        // wins.
        match decoded {
            Decoded::Aggregator(agg) => {
                entry.aggregator = Some((agg, received_at));
                entry.aggregator_offset = Some(
                    entry
                        .aggregator_offset
                        .map_or(record.offset, |o| o.max(record.offset)),
                );
            }
            Decoded::Mape(ev) => {
                entry.mape = Some((ev, received_at));
                entry.mape_offset =
                    Some(entry.mape_offset.map_or(record.offset, |o| o.max(record.offset)));
            }
        }
        if was_new {
            self.arrivals.push_back(epoch_index);
            self.evict_overflow();
        }
        self.drain_ready(false)
    }

    /// Fires the grace timer: imputes and finalizes every pending epoch whose
    /// grace has expired (oldest first), plus any newer epochs that become
    /// unblocked.
    pub fn expire(&mut self) -> Vec<Finalized> {
        self.drain_ready(true)
    }

    /// When the next grace deadline falls due, in epoch milliseconds, or
    /// `None` when nothing is pending.
    ///
    /// Only the oldest pending epoch gates finalization, so only its deadline
    /// matters.
    pub fn next_deadline_ms(&self) -> Option<EpochMillis> {
        let grace_ms = self.cfg.grace.as_millis() as u64;
        self.pending
            .first_key_value()
            .map(|(_, entry)| entry.first_seen + grace_ms)
    }

    /// The number of epochs currently buffered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn decode(&self, side: Side, record: &BusRecord) -> Option<Decoded> {
        let decoded = match side {
            Side::Aggregator => serde_json::from_slice::<AggregatedEpoch>(&record.payload)
                .map(Decoded::Aggregator),
            Side::Mape => {
                serde_json::from_slice::<MapeLedgerEvent>(&record.payload).map(Decoded::Mape)
            }
        };
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    zone = %self.cfg.zone_id,
                    side = side.as_str(),
                    error = %e,
                    "undecodable ingest record",
                );
                self.metrics
                    .decode_errors_total
                    .with_label_values(&[side.as_str()])
                    .inc();
                return None;
            }
        };
        if decoded.zone_id() != self.cfg.zone_id {
            warn!(
                zone = %self.cfg.zone_id,
                found = %decoded.zone_id(),
                side = side.as_str(),
                "ingest record for foreign zone",
            );
            self.metrics
                .decode_errors_total
                .with_label_values(&[side.as_str()])
                .inc();
            return None;
        }
        Some(decoded)
    }

    fn is_stale(&self, epoch_index: u64) -> bool {
        self.finalized_keys.contains(&epoch_index)
            || self.last_finalized.map_or(false, |last| epoch_index <= last)
    }

    /// Finalizes from the oldest pending epoch upward: an epoch leaves the
    /// buffer when both sides are present, or (if `impute_overdue`) when its
    /// grace has expired. Stops at the first epoch that is neither, which
    /// preserves strictly increasing finalization order.
    fn drain_ready(&mut self, impute_overdue: bool) -> Vec<Finalized> {
        let grace_ms = self.cfg.grace.as_millis() as u64;
        let mut finalized = Vec::new();
        loop {
            let Some((&epoch_index, entry)) = self.pending.first_key_value() else {
                break;
            };
            let overdue =
                impute_overdue && self.now.as_millis() >= entry.first_seen + grace_ms;
            if !entry.complete() && !overdue {
                break;
            }
            let entry = self.pending.remove(&epoch_index).expect("key just observed");
            finalized.push(self.finalize(epoch_index, entry));
        }
        if !finalized.is_empty() {
            self.arrivals.retain(|idx| self.pending.contains_key(idx));
        }
        finalized
    }

    fn finalize(&mut self, epoch_index: u64, entry: Pending) -> Finalized {
        let now_dt = self.now.as_datetime();
        let window = EpochWindow::at(epoch_index, self.cfg.epoch_length);
        let mut imputed = None;

        let (aggregator, aggregator_received_at) = match entry.aggregator {
            Some((agg, at)) => (agg, at),
            None => {
                imputed = Some(Side::Aggregator);
                (
                    AggregatedEpoch::empty(self.cfg.zone_id.clone(), window.clone(), now_dt),
                    now_dt,
                )
            }
        };
        let (mape, mape_received_at) = match entry.mape {
            Some((ev, at)) => (ev, at),
            None => {
                imputed = Some(Side::Mape);
                (
                    MapeLedgerEvent::imputed_hold(
                        self.cfg.zone_id.clone(),
                        epoch_index,
                        window.start,
                        window.end,
                        self.last_target_c.unwrap_or(self.cfg.default_target_c),
                        self.now.as_millis(),
                    ),
                    now_dt,
                )
            }
        };
        if let Some(side) = imputed {
            debug!(
                zone = %self.cfg.zone_id,
                epoch = epoch_index,
                side = side.as_str(),
                "grace expired; imputing missing side",
            );
            self.metrics
                .imputed_total
                .with_label_values(&[&self.cfg.zone_id])
                .inc();
        }
        let waited = self.now.as_millis().saturating_sub(entry.first_seen);
        self.metrics
            .match_latency_seconds
            .observe(waited as f64 / 1000.0);

        self.last_finalized = Some(epoch_index);
        self.finalized_ring.push_back(epoch_index);
        self.finalized_keys.insert(epoch_index);
        while self.finalized_ring.len() > self.cfg.buffer_max_epochs {
            if let Some(evicted) = self.finalized_ring.pop_front() {
                self.finalized_keys.remove(&evicted);
            }
        }

        Finalized {
            matched: EpochMatch {
                zone_id: self.cfg.zone_id.clone(),
                epoch_index,
                aggregator,
                aggregator_received_at,
                mape,
                mape_received_at,
                matched_at: now_dt,
            },
            imputed,
            aggregator_offset: entry.aggregator_offset,
            mape_offset: entry.mape_offset,
        }
    }

    fn evict_overflow(&mut self) {
        while self.pending.len() > self.cfg.buffer_max_epochs {
            // Oldest by first arrival, per the FIFO queue.
            let Some(oldest) = self.arrivals.pop_front() else {
                break;
            };
            if self.pending.remove(&oldest).is_some() {
                warn!(
                    zone = %self.cfg.zone_id,
                    epoch = oldest,
                    capacity = self.cfg.buffer_max_epochs,
                    "pending buffer full; evicting oldest epoch unmatched",
                );
                self.metrics
                    .evicted_total
                    .with_label_values(&[&self.cfg.zone_id])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use champ_kafka_util::bus::BusRecord;
    use champ_ore::now::NowFn;
    use champ_repr::{
        AggregatedEpoch, EpochWindow, MapeLedgerEvent, PlannedAction,
    };

    use crate::metrics::LedgerMetrics;

    use super::{Matcher, MatcherConfig, Side};

    const EPOCH_LEN: Duration = Duration::from_secs(300);

    fn config() -> MatcherConfig {
        MatcherConfig {
            zone_id: "A".into(),
            grace: Duration::from_millis(2000),
            buffer_max_epochs: 3,
            default_target_c: 21.0,
            epoch_length: EPOCH_LEN,
        }
    }

    fn matcher() -> (Matcher, Arc<AtomicU64>, LedgerMetrics) {
        let clock = Arc::new(AtomicU64::new(1_000_000));
        let now = {
            let clock = Arc::clone(&clock);
            NowFn::from(move || clock.load(Ordering::SeqCst))
        };
        let metrics = LedgerMetrics::unregistered();
        (Matcher::new(config(), now, metrics.clone()), clock, metrics)
    }

    fn agg_record(zone: &str, epoch: u64, offset: i64) -> BusRecord {
        let window = EpochWindow::at(epoch, EPOCH_LEN);
        let agg = AggregatedEpoch::empty(zone.into(), window, Utc::now());
        BusRecord {
            key: None,
            payload: serde_json::to_vec(&agg).unwrap(),
            partition: 0,
            offset,
            timestamp_ms: None,
        }
    }

    fn mape_record(zone: &str, epoch: u64, offset: i64, target_c: f64) -> BusRecord {
        let window = EpochWindow::at(epoch, EPOCH_LEN);
        let ev = MapeLedgerEvent {
            target_c,
            ..MapeLedgerEvent::imputed_hold(
                zone.into(),
                epoch,
                window.start,
                window.end,
                target_c,
                0,
            )
        };
        BusRecord {
            key: None,
            payload: serde_json::to_vec(&ev).unwrap(),
            partition: 1,
            offset,
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_both_sides_finalize_without_imputation() {
        let (mut m, _, metrics) = matcher();
        assert!(m.handle_record(Side::Aggregator, &agg_record("A", 5, 0)).is_empty());
        let out = m.handle_record(Side::Mape, &mape_record("A", 5, 0, 22.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].matched.epoch_index, 5);
        assert!(out[0].imputed.is_none());
        assert_eq!(out[0].aggregator_offset, Some(0));
        assert_eq!(out[0].mape_offset, Some(0));
        assert_eq!(metrics.imputed_total.with_label_values(&["A"]).get(), 0);
        assert_eq!(m.pending_len(), 0);
    }

    #[test]
    fn test_one_sided_epoch_imputes_mape_after_grace() {
        let (mut m, clock, metrics) = matcher();
        assert!(m.handle_record(Side::Aggregator, &agg_record("A", 7, 3)).is_empty());

        // Before the deadline nothing happens.
        clock.fetch_add(1999, Ordering::SeqCst);
        assert!(m.expire().is_empty());

        clock.fetch_add(1, Ordering::SeqCst);
        let out = m.expire();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].imputed, Some(Side::Mape));
        assert_eq!(out[0].matched.mape.planned, PlannedAction::Hold);
        assert_eq!(out[0].matched.mape.target_c, 21.0);
        assert_eq!(out[0].matched.mape.fan, 0);
        assert_eq!(metrics.imputed_total.with_label_values(&["A"]).get(), 1);
    }

    #[test]
    fn test_imputed_mape_uses_last_known_target() {
        let (mut m, clock, _) = matcher();
        // A real MAPE event for epoch 1 teaches the target.
        m.handle_record(Side::Aggregator, &agg_record("A", 1, 0));
        m.handle_record(Side::Mape, &mape_record("A", 1, 0, 23.5));
        // Epoch 2 arrives aggregator-only.
        m.handle_record(Side::Aggregator, &agg_record("A", 2, 1));
        clock.fetch_add(2000, Ordering::SeqCst);
        let out = m.expire();
        assert_eq!(out[0].matched.mape.target_c, 23.5);
    }

    #[test]
    fn test_missing_aggregator_imputes_empty_epoch() {
        let (mut m, clock, _) = matcher();
        m.handle_record(Side::Mape, &mape_record("A", 4, 0, 20.0));
        clock.fetch_add(2000, Ordering::SeqCst);
        let out = m.expire();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].imputed, Some(Side::Aggregator));
        assert!(out[0].matched.aggregator.by_device.is_empty());
        assert_eq!(out[0].matched.aggregator.epoch.index, 4);
        assert_eq!(out[0].aggregator_offset, None);
    }

    #[test]
    fn test_finalization_is_ordered_within_zone() {
        let (mut m, clock, _) = matcher();
        // Epoch 6 completes while epoch 5 is still one-sided: 6 must wait.
        m.handle_record(Side::Aggregator, &agg_record("A", 5, 0));
        m.handle_record(Side::Aggregator, &agg_record("A", 6, 1));
        let out = m.handle_record(Side::Mape, &mape_record("A", 6, 0, 22.0));
        assert!(out.is_empty());

        // Grace expiry imputes 5, then releases 6.
        clock.fetch_add(2000, Ordering::SeqCst);
        let out = m.expire();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].matched.epoch_index, 5);
        assert_eq!(out[0].imputed, Some(Side::Mape));
        assert_eq!(out[1].matched.epoch_index, 6);
        assert!(out[1].imputed.is_none());
    }

    #[test]
    fn test_stale_and_duplicate_records_dropped() {
        let (mut m, _, metrics) = matcher();
        m.handle_record(Side::Aggregator, &agg_record("A", 5, 0));
        let out = m.handle_record(Side::Mape, &mape_record("A", 5, 0, 22.0));
        assert_eq!(out.len(), 1);

        // Redelivery of a finalized epoch cannot re-finalize.
        assert!(m.handle_record(Side::Aggregator, &agg_record("A", 5, 1)).is_empty());
        // Nor can anything older than the frontier.
        assert!(m.handle_record(Side::Mape, &mape_record("A", 4, 2, 22.0)).is_empty());
        assert_eq!(m.pending_len(), 0);
        assert_eq!(
            metrics.decode_errors_total.with_label_values(&["aggregator"]).get(),
            1
        );
        assert_eq!(metrics.decode_errors_total.with_label_values(&["mape"]).get(), 1);
    }

    #[test]
    fn test_duplicate_pending_side_latest_wins() {
        let (mut m, _, _) = matcher();
        m.handle_record(Side::Mape, &mape_record("A", 5, 0, 20.0));
        // The re-run supersedes the first event.
        m.handle_record(Side::Mape, &mape_record("A", 5, 1, 24.0));
        let out = m.handle_record(Side::Aggregator, &agg_record("A", 5, 0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].matched.mape.target_c, 24.0);
        assert_eq!(out[0].mape_offset, Some(1));
    }

    #[test]
    fn test_undecodable_payload_counted_not_fatal() {
        let (mut m, _, metrics) = matcher();
        let garbage = BusRecord {
            key: None,
            payload: b"{not json".to_vec(),
            partition: 0,
            offset: 0,
            timestamp_ms: None,
        };
        assert!(m.handle_record(Side::Aggregator, &garbage).is_empty());
        assert_eq!(
            metrics.decode_errors_total.with_label_values(&["aggregator"]).get(),
            1
        );
    }

    #[test]
    fn test_buffer_overflow_evicts_oldest() {
        let (mut m, _, metrics) = matcher();
        for epoch in 1..=4 {
            m.handle_record(Side::Aggregator, &agg_record("A", epoch, epoch as i64));
        }
        // Capacity 3: epoch 1 was evicted.
        assert_eq!(m.pending_len(), 3);
        assert_eq!(metrics.evicted_total.with_label_values(&["A"]).get(), 1);
        assert_eq!(m.next_deadline_ms().is_some(), true);
    }

    #[test]
    fn test_match_latency_observed() {
        let (mut m, clock, metrics) = matcher();
        m.handle_record(Side::Aggregator, &agg_record("A", 1, 0));
        clock.fetch_add(500, Ordering::SeqCst);
        m.handle_record(Side::Mape, &mape_record("A", 1, 0, 22.0));
        assert_eq!(metrics.match_latency_seconds.get_sample_count(), 1);
        assert!(metrics.match_latency_seconds.get_sample_sum() >= 0.5);
    }
}
