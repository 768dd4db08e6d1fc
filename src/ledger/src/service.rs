// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ledgerd's moving parts.
//!
//! Per zone: two partition-reader threads feed one matcher task over a
//! bounded channel. All matcher tasks share the single writer task, which
//! owns every file append; a finalized epoch's offsets are committed back on
//! the reader threads only after the writer acknowledges the append. The
//! happens-before chain per `(zone, epoch)` is therefore: aggregator emission
//! → ledger finalize → fsync'd append → offset commit → public publish
//! (async, best-effort).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use champ_breaker::CircuitBreaker;
use champ_kafka_util::bus::{BusRecord, PartitionReader};
use champ_ore::now::NowFn;

use crate::ingest::{Finalized, Matcher, Side};
use crate::publish::Publisher;
use crate::store::{Ledger, LedgerError};
use crate::transaction::EpochMatch;

/// Backpressure bound between a zone's readers and its matcher.
pub const INGEST_CHANNEL_CAPACITY: usize = 256;

/// Backpressure bound between matchers and the writer.
pub const WRITER_CHANNEL_CAPACITY: usize = 64;

/// One record on its way from a reader thread to the matcher.
#[derive(Debug)]
pub struct IngestItem {
    pub side: Side,
    pub record: BusRecord,
}

/// An append request to the writer task. The ack closes the loop back to the
/// matcher so offsets commit only after the fsync.
#[derive(Debug)]
pub struct WriteRequest {
    pub matched: EpochMatch,
    pub ack: oneshot::Sender<Result<(), String>>,
}

/// Runs the single ledger writer until its channel closes.
///
/// A storage error is fatal by contract (writes stall only if the file cannot
/// be fsynced); the error is returned so the daemon can exit nonzero.
pub async fn run_writer(
    ledger: Arc<Ledger>,
    publisher: Option<Publisher>,
    mut rx: mpsc::Receiver<WriteRequest>,
) -> Result<(), LedgerError> {
    info!(path = %ledger.path().display(), "ledger writer running");
    while let Some(req) = rx.recv().await {
        let ledger = Arc::clone(&ledger);
        let matched = req.matched;
        let appended = champ_ore::task::spawn_blocking(
            || "ledger-append",
            move || ledger.append_match(matched),
        )
        .await
        .expect("append task does not panic");
        match appended {
            Ok((tx, meta)) => {
                if let Some(publisher) = &publisher {
                    publisher.enqueue(&tx, &meta);
                }
                let _ = req.ack.send(Ok(()));
            }
            Err(e) => {
                error!(error = %e, "ledger append failed; refusing further writes");
                let _ = req.ack.send(Err(e.to_string()));
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Runs one zone's matcher until shutdown or channel closure.
pub async fn run_zone_matcher(
    zone_id: String,
    mut matcher: Matcher,
    mut rx: mpsc::Receiver<IngestItem>,
    writer_tx: mpsc::Sender<WriteRequest>,
    aggregator_commit: mpsc::UnboundedSender<i64>,
    mape_commit: mpsc::UnboundedSender<i64>,
    now: NowFn,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(zone = %zone_id, "zone matcher running");
    loop {
        let deadline_ms = matcher.next_deadline_ms();
        let until_deadline = deadline_ms
            .map(|d| Duration::from_millis(d.saturating_sub(now.as_millis())));
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => match item {
                Some(item) => {
                    let finalized = matcher.handle_record(item.side, &item.record);
                    if !flush_finalized(&zone_id, finalized, &writer_tx, &aggregator_commit, &mape_commit).await {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(until_deadline.unwrap_or(Duration::ZERO)),
                if until_deadline.is_some() =>
            {
                let finalized = matcher.expire();
                if !flush_finalized(&zone_id, finalized, &writer_tx, &aggregator_commit, &mape_commit).await {
                    break;
                }
            }
        }
    }
    info!(zone = %zone_id, "zone matcher stopped");
}

/// Hands finalized epochs to the writer, in order, and commits their offsets
/// once each append is acknowledged. Returns false when the writer is gone
/// (fatal storage failure or shutdown).
async fn flush_finalized(
    zone_id: &str,
    finalized: Vec<Finalized>,
    writer_tx: &mpsc::Sender<WriteRequest>,
    aggregator_commit: &mpsc::UnboundedSender<i64>,
    mape_commit: &mpsc::UnboundedSender<i64>,
) -> bool {
    for epoch in finalized {
        let (ack_tx, ack_rx) = oneshot::channel();
        let req = WriteRequest {
            matched: epoch.matched,
            ack: ack_tx,
        };
        if writer_tx.send(req).await.is_err() {
            warn!(zone = %zone_id, "ledger writer gone; stopping matcher");
            return false;
        }
        match ack_rx.await {
            Ok(Ok(())) => {
                if let Some(offset) = epoch.aggregator_offset {
                    let _ = aggregator_commit.send(offset + 1);
                }
                if let Some(offset) = epoch.mape_offset {
                    let _ = mape_commit.send(offset + 1);
                }
            }
            Ok(Err(e)) => {
                error!(zone = %zone_id, error = %e, "append rejected; stopping matcher");
                return false;
            }
            Err(_) => {
                warn!(zone = %zone_id, "ledger writer gone; stopping matcher");
                return false;
            }
        }
    }
    true
}

/// Runs one partition-reader thread: fetch behind the breaker, forward into
/// the matcher channel, apply requested offset commits.
pub fn run_partition_reader(
    zone_id: String,
    side: Side,
    mut reader: Box<dyn PartitionReader>,
    ingest_tx: mpsc::Sender<IngestItem>,
    mut commit_rx: mpsc::UnboundedReceiver<i64>,
    breaker: Arc<CircuitBreaker>,
    poll_deadline: Duration,
    retry_backoff: Duration,
    handle: tokio::runtime::Handle,
    shutdown: watch::Receiver<bool>,
) {
    info!(
        zone = %zone_id,
        side = side.as_str(),
        partition = reader.partition(),
        "partition reader running",
    );
    let mut consecutive_errors = 0u32;
    while !*shutdown.borrow() {
        while let Ok(next_offset) = commit_rx.try_recv() {
            if let Err(e) = reader.commit(next_offset) {
                warn!(
                    zone = %zone_id,
                    side = side.as_str(),
                    error = %e,
                    "offset commit failed; will retry on redelivery",
                );
            }
        }
        let fetched = handle.block_on(
            breaker.call(|| std::future::ready(reader.fetch(poll_deadline))),
        );
        match fetched {
            Ok(Some(record)) => {
                consecutive_errors = 0;
                if ingest_tx
                    .blocking_send(IngestItem { side, record })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let backoff = retry_backoff
                    .saturating_mul(1 << consecutive_errors.min(6))
                    .min(Duration::from_secs(30));
                warn!(
                    zone = %zone_id,
                    side = side.as_str(),
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "fetch failed; backing off",
                );
                std::thread::sleep(backoff);
            }
        }
    }
    info!(zone = %zone_id, side = side.as_str(), "partition reader stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch};

    use champ_kafka_util::bus::BusProducer;
    use champ_kafka_util::mem::InMemoryBus;
    use champ_ore::now::system_time_now;
    use champ_repr::{AggregatedEpoch, EpochWindow, MapeLedgerEvent};

    use crate::ingest::{Matcher, MatcherConfig, Side};
    use crate::metrics::LedgerMetrics;
    use crate::store::{Ledger, QueryFilter};

    use super::{run_partition_reader, run_writer, run_zone_matcher, IngestItem};

    const EPOCH_LEN: Duration = Duration::from_secs(300);

    fn matcher_config(zone: &str) -> MatcherConfig {
        MatcherConfig {
            zone_id: zone.into(),
            grace: Duration::from_millis(100),
            buffer_max_epochs: 16,
            default_target_c: 21.0,
            epoch_length: EPOCH_LEN,
        }
    }

    fn test_breaker() -> Arc<champ_breaker::CircuitBreaker> {
        Arc::new(champ_breaker::CircuitBreaker::new(
            champ_breaker::Config {
                name: "test".into(),
                enabled: true,
                max_failures: 5,
                reset_timeout: Duration::from_millis(100),
                successes_to_close: 1,
                probe_timeout: Duration::from_secs(1),
            },
            system_time_now(),
        ))
    }

    // End to end on the in-memory bus: records on both partitions flow
    // through readers and matcher into a real on-disk ledger, and offsets
    // commit only after the append.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zone_pipeline_end_to_end() {
        let bus = InMemoryBus::new();
        bus.create_topic("zone.ledger.A", 2);
        let window = EpochWindow::at(5, EPOCH_LEN);
        let agg = AggregatedEpoch::empty("A".into(), window.clone(), chrono::Utc::now());
        let mape = MapeLedgerEvent::imputed_hold(
            "A".into(),
            5,
            window.start,
            window.end,
            22.0,
            0,
        );
        bus.produce("zone.ledger.A", None, &serde_json::to_vec(&agg).unwrap(), Some(0))
            .await
            .unwrap();
        bus.produce("zone.ledger.A", None, &serde_json::to_vec(&mape).unwrap(), Some(1))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let metrics = LedgerMetrics::unregistered();
        let ledger = Arc::new(
            Ledger::open(
                dir.path().join("ledger.jsonl"),
                system_time_now(),
                metrics.clone(),
            )
            .unwrap(),
        );

        let (writer_tx, writer_rx) = mpsc::channel(8);
        let (ingest_tx, ingest_rx) = mpsc::channel(8);
        let (agg_commit_tx, agg_commit_rx) = mpsc::unbounded_channel();
        let (mape_commit_tx, mape_commit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer = tokio::spawn(run_writer(Arc::clone(&ledger), None, writer_rx));
        let matcher_task = tokio::spawn(run_zone_matcher(
            "A".into(),
            Matcher::new(matcher_config("A"), system_time_now(), metrics.clone()),
            ingest_rx,
            writer_tx,
            agg_commit_tx,
            mape_commit_tx,
            system_time_now(),
            shutdown_rx.clone(),
        ));

        let handle = tokio::runtime::Handle::current();
        let mut reader_threads = Vec::new();
        for (side, partition, commit_rx) in [
            (Side::Aggregator, 0, agg_commit_rx),
            (Side::Mape, 1, mape_commit_rx),
        ] {
            let reader = Box::new(bus.reader("zone.ledger.A", partition).unwrap());
            let ingest_tx = ingest_tx.clone();
            let breaker = test_breaker();
            let handle = handle.clone();
            let shutdown = shutdown_rx.clone();
            reader_threads.push(std::thread::spawn(move || {
                run_partition_reader(
                    "A".into(),
                    side,
                    reader,
                    ingest_tx,
                    commit_rx,
                    breaker,
                    Duration::from_millis(5),
                    Duration::from_millis(1),
                    handle,
                    shutdown,
                )
            }));
        }
        drop(ingest_tx);

        // Wait for the append and the commits to land.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let committed = bus.committed("zone.ledger.A", 0) == 1
                && bus.committed("zone.ledger.A", 1) == 1;
            if committed || std::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(ledger.last_height(), Some(0));
        let entries = ledger.query(&QueryFilter::default(), 1, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(bus.committed("zone.ledger.A", 0), 1);
        assert_eq!(bus.committed("zone.ledger.A", 1), 1);
        assert_eq!(metrics.imputed_total.with_label_values(&["A"]).get(), 0);

        shutdown_tx.send(true).unwrap();
        matcher_task.await.unwrap();
        for thread in reader_threads {
            thread.join().unwrap();
        }
        // Matcher and readers gone: the writer channel closes cleanly.
        writer.await.unwrap().unwrap();
    }

    // One-sided arrival: the grace timer imputes and the ledger still
    // advances.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_sided_pipeline_imputes() {
        let bus = InMemoryBus::new();
        bus.create_topic("zone.ledger.B", 2);
        let window = EpochWindow::at(7, EPOCH_LEN);
        let agg = AggregatedEpoch::empty("B".into(), window, chrono::Utc::now());
        bus.produce("zone.ledger.B", None, &serde_json::to_vec(&agg).unwrap(), Some(0))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let metrics = LedgerMetrics::unregistered();
        let ledger = Arc::new(
            Ledger::open(
                dir.path().join("ledger.jsonl"),
                system_time_now(),
                metrics.clone(),
            )
            .unwrap(),
        );

        let (writer_tx, writer_rx) = mpsc::channel(8);
        let (ingest_tx, ingest_rx) = mpsc::channel(8);
        let (agg_commit_tx, _agg_commit_rx) = mpsc::unbounded_channel();
        let (mape_commit_tx, _mape_commit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer = tokio::spawn(run_writer(Arc::clone(&ledger), None, writer_rx));
        let matcher_task = tokio::spawn(run_zone_matcher(
            "B".into(),
            Matcher::new(matcher_config("B"), system_time_now(), metrics.clone()),
            ingest_rx,
            writer_tx,
            agg_commit_tx,
            mape_commit_tx,
            system_time_now(),
            shutdown_rx,
        ));

        let mut reader = bus.reader("zone.ledger.B", 0).unwrap();
        use champ_kafka_util::bus::PartitionReader as _;
        let record = reader.fetch(Duration::from_millis(5)).unwrap().unwrap();
        ingest_tx
            .send(IngestItem {
                side: Side::Aggregator,
                record,
            })
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ledger.last_height().is_none() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(ledger.last_height(), Some(0));
        assert_eq!(metrics.imputed_total.with_label_values(&["B"]).get(), 1);

        shutdown_tx.send(true).unwrap();
        drop(ingest_tx);
        matcher_task.await.unwrap();
        writer.await.unwrap().unwrap();
    }
}
