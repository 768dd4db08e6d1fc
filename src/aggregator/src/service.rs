// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-zone drain loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use champ_breaker::CircuitBreaker;
use champ_kafka_util::bus::BusProducer;
use champ_ore::now::NowFn;
use champ_ore::retry::Retry;
use champ_repr::EpochWindow;

use crate::drain::EpochDrainer;
use crate::metrics::AggregatorMetrics;

/// Static wiring for one zone's drain loop.
pub struct ZoneLoopConfig {
    pub zone_id: String,
    /// The `zone.ledger.<zone>` topic emitted epochs are produced to.
    pub ledger_topic: String,
    /// The aggregator-side partition of the ledger topic.
    pub ledger_partition: i32,
    pub epoch_length: Duration,
    /// Base backoff for produce retries behind the breaker.
    pub retry_backoff: Duration,
}

/// Drains epoch `target` and produces the result, committing consumer offsets
/// only once the produce is acknowledged. On produce failure the drained
/// offsets are rolled back so the next tick re-reads them; the ledger's dedup
/// absorbs any duplicate emission.
pub async fn emit_epoch(
    cfg: &ZoneLoopConfig,
    drainer: &mut EpochDrainer,
    producer: &Arc<dyn BusProducer>,
    breaker: &CircuitBreaker,
    now: &NowFn,
    metrics: &AggregatorMetrics,
    target: u64,
) -> Result<(), anyhow::Error> {
    let outcome = drainer
        .drain_epoch(target, now.as_datetime())
        .context("draining epoch")?;
    let payload = serde_json::to_vec(&outcome.epoch).context("encoding aggregated epoch")?;

    let produced = Retry::default()
        .initial_backoff(cfg.retry_backoff)
        .clamp_backoff(Duration::from_secs(30))
        .max_tries(5)
        .retry_async(|_| {
            breaker.call(|| {
                producer.produce(
                    &cfg.ledger_topic,
                    Some(cfg.zone_id.as_bytes()),
                    &payload,
                    Some(cfg.ledger_partition),
                )
            })
        })
        .await;

    match produced {
        Ok(()) => {
            drainer
                .commit(&outcome.progress)
                .context("committing drained offsets")?;
            metrics
                .emitted_epochs
                .with_label_values(&[&cfg.zone_id])
                .inc();
            info!(
                zone = %cfg.zone_id,
                epoch = target,
                devices = outcome.epoch.by_device.len(),
                "emitted aggregated epoch",
            );
            Ok(())
        }
        Err(e) => {
            drainer
                .rollback(&outcome.progress)
                .context("rolling back drained offsets")?;
            anyhow::bail!("producing aggregated epoch: {e}")
        }
    }
}

/// Runs one zone's drain loop until shutdown.
///
/// This is a plain thread body: the partition readers underneath are
/// synchronous, so each zone owns a thread and only hops onto the runtime
/// (via `handle`) to produce.
pub fn run_zone_loop(
    cfg: ZoneLoopConfig,
    mut drainer: EpochDrainer,
    producer: Arc<dyn BusProducer>,
    breaker: Arc<CircuitBreaker>,
    now: NowFn,
    handle: tokio::runtime::Handle,
    shutdown: watch::Receiver<bool>,
    metrics: AggregatorMetrics,
) {
    info!(zone = %cfg.zone_id, "starting zone drain loop");
    let mut last_emitted: Option<u64> = None;
    'outer: loop {
        // Sleep to the next tick in small steps so shutdown stays responsive.
        let mut remaining = cfg.epoch_length;
        while !remaining.is_zero() {
            if *shutdown.borrow() {
                break 'outer;
            }
            let step = remaining.min(Duration::from_millis(250));
            std::thread::sleep(step);
            remaining -= step;
        }

        let Some(target) = EpochWindow::index_for(now.as_datetime(), cfg.epoch_length).checked_sub(1)
        else {
            continue;
        };
        // Catch up every closed epoch we have not yet emitted; after a
        // produce outage this replays from the last committed offsets.
        let first = last_emitted.map_or(target, |l| l + 1);
        for idx in first..=target {
            if *shutdown.borrow() {
                break 'outer;
            }
            match handle.block_on(emit_epoch(
                &cfg, &mut drainer, &producer, &breaker, &now, &metrics, idx,
            )) {
                Ok(()) => last_emitted = Some(idx),
                Err(e) => {
                    warn!(zone = %cfg.zone_id, epoch = idx, error = %format!("{e:#}"), "drain pass failed; will retry next tick");
                    break;
                }
            }
        }
    }
    info!(zone = %cfg.zone_id, "zone drain loop stopped");
}
