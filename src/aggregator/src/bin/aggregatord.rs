// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! aggregatord: one drain loop per zone, device telemetry in, aggregated
//! epochs out.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use champ_aggregator::config::Args;
use champ_aggregator::drain::EpochDrainer;
use champ_aggregator::metrics::AggregatorMetrics;
use champ_aggregator::service::{run_zone_loop, ZoneLoopConfig};
use champ_breaker::CircuitBreaker;
use champ_kafka_util::bus::{BusProducer, PartitionReader};
use champ_kafka_util::kafka::{KafkaPartitionReader, KafkaProducer};
use champ_ore::now::system_time_now;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    args.validate()?;

    let registry = Registry::new();
    let metrics = AggregatorMetrics::register_into(&registry);
    if let Some(addr) = args.metrics_listen_addr {
        let _ = champ_ore::metrics::serve(addr, registry.clone());
    }

    let now = system_time_now();
    let producer: Arc<dyn BusProducer> = Arc::new(
        KafkaProducer::new(&args.kafka_brokers, -1).context("creating kafka producer")?,
    );
    let breaker = Arc::new(CircuitBreaker::new(
        args.breaker.kafka_config("aggregator-kafka"),
        now.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::runtime::Handle::current();
    let mut zone_threads = Vec::with_capacity(args.zones.len());
    for zone in &args.zones {
        let readings_topic = args.readings_topic(zone);
        let partitions = producer
            .partition_count(&readings_topic)
            .with_context(|| format!("resolving partitions of {readings_topic}"))?;
        let mut readers: Vec<Box<dyn PartitionReader>> = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            readers.push(Box::new(
                KafkaPartitionReader::new(
                    &args.kafka_brokers,
                    &args.group_id,
                    &readings_topic,
                    i32::try_from(partition).expect("partition count known to fit in i32"),
                )
                .with_context(|| format!("assigning {readings_topic}/{partition}"))?,
            ));
        }
        let drainer = EpochDrainer::new(
            zone.clone(),
            args.epoch_length(),
            args.poll_deadline(),
            readers,
            metrics.clone(),
        );
        let cfg = ZoneLoopConfig {
            zone_id: zone.clone(),
            ledger_topic: args.ledger_topic(zone),
            ledger_partition: args.ledger_partition_aggregator,
            epoch_length: args.epoch_length(),
            retry_backoff: args.breaker.retry_backoff(),
        };
        let producer = Arc::clone(&producer);
        let breaker = Arc::clone(&breaker);
        let now = now.clone();
        let handle = handle.clone();
        let shutdown = shutdown_rx.clone();
        let metrics = metrics.clone();
        let thread = std::thread::Builder::new()
            .name(format!("drain-{zone}"))
            .spawn(move || {
                run_zone_loop(cfg, drainer, producer, breaker, now, handle, shutdown, metrics)
            })
            .context("spawning zone drain thread")?;
        zone_threads.push(thread);
    }
    info!(zones = args.zones.len(), "aggregator running");

    tokio::signal::ctrl_c().await.context("awaiting shutdown signal")?;
    info!("shutdown signal received; draining zone loops");
    shutdown_tx.send(true).expect("zone loops outlive the sender");
    tokio::task::spawn_blocking(move || {
        for thread in zone_threads {
            let _ = thread.join();
        }
    })
    .await
    .context("joining zone loops")?;
    Ok(())
}
