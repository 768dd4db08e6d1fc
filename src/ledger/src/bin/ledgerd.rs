// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ledgerd: pairs aggregator and MAPE epochs, appends them to the
//! hash-chained ledger, and republishes the public stream.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use champ_breaker::CircuitBreaker;
use champ_kafka_util::bus::{BusProducer, PartitionReader};
use champ_kafka_util::kafka::{KafkaPartitionReader, KafkaProducer};
use champ_ledger::config::Args;
use champ_ledger::ingest::{Matcher, MatcherConfig, Side};
use champ_ledger::metrics::LedgerMetrics;
use champ_ledger::publish::Publisher;
use champ_ledger::service::{
    run_partition_reader, run_writer, run_zone_matcher, INGEST_CHANNEL_CAPACITY,
    WRITER_CHANNEL_CAPACITY,
};
use champ_ledger::store::Ledger;
use champ_ore::now::system_time_now;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    args.validate()?;

    let registry = Registry::new();
    let metrics = LedgerMetrics::register_into(&registry);
    if let Some(addr) = args.metrics_listen_addr {
        let _ = champ_ore::metrics::serve(addr, registry.clone());
    }

    let now = system_time_now();
    std::fs::create_dir_all(&args.data_directory).context("creating data directory")?;
    // A chain violation here is fatal by design: refuse to write on top of a
    // corrupt file.
    let ledger = Arc::new(
        Ledger::open(args.ledger_path(), now.clone(), metrics.clone())
            .context("loading ledger")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher = if args.public_enable {
        let publisher = Publisher::new(args.publisher_config(), now.clone(), metrics.clone());
        let producer: Arc<dyn BusProducer> = Arc::new(
            KafkaProducer::new(args.public_brokers(), args.public_acks)
                .context("creating public producer")?,
        );
        let breaker = Arc::new(CircuitBreaker::new(
            args.breaker.kafka_config("ledger-public"),
            now.clone(),
        ));
        let _ = champ_ore::task::spawn(
            || "public-publisher",
            publisher.clone().run_worker(producer, breaker, shutdown_rx.clone()),
        );
        Some(publisher)
    } else {
        None
    };

    let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
    let writer = champ_ore::task::spawn(
        || "ledger-writer",
        run_writer(Arc::clone(&ledger), publisher, writer_rx),
    );

    let handle = tokio::runtime::Handle::current();
    let mut reader_threads = Vec::new();
    let mut matcher_tasks = Vec::new();
    for zone in &args.zones {
        let topic = args.topic(zone);
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let (agg_commit_tx, agg_commit_rx) = mpsc::unbounded_channel();
        let (mape_commit_tx, mape_commit_rx) = mpsc::unbounded_channel();

        let matcher = Matcher::new(
            MatcherConfig {
                zone_id: zone.clone(),
                grace: args.grace(),
                buffer_max_epochs: args.buffer_max_epochs,
                default_target_c: args.default_target_c,
                epoch_length: args.epoch_length(),
            },
            now.clone(),
            metrics.clone(),
        );
        matcher_tasks.push(champ_ore::task::spawn(
            || format!("matcher-{zone}"),
            run_zone_matcher(
                zone.clone(),
                matcher,
                ingest_rx,
                writer_tx.clone(),
                agg_commit_tx,
                mape_commit_tx,
                now.clone(),
                shutdown_rx.clone(),
            ),
        ));

        for (side, partition, commit_rx) in [
            (Side::Aggregator, args.partition_aggregator, agg_commit_rx),
            (Side::Mape, args.partition_mape, mape_commit_rx),
        ] {
            let reader: Box<dyn PartitionReader> = Box::new(
                KafkaPartitionReader::new(&args.kafka_brokers, &args.group_id, &topic, partition)
                    .with_context(|| format!("assigning {topic}/{partition}"))?,
            );
            let breaker = Arc::new(CircuitBreaker::new(
                args.breaker
                    .kafka_config(&format!("ledger-ingest-{zone}-{}", side.as_str())),
                now.clone(),
            ));
            let ingest_tx = ingest_tx.clone();
            let zone = zone.clone();
            let handle = handle.clone();
            let shutdown = shutdown_rx.clone();
            let poll_deadline = args.poll_deadline();
            let retry_backoff = args.breaker.retry_backoff();
            reader_threads.push(
                std::thread::Builder::new()
                    .name(format!("ingest-{zone}-{}", side.as_str()))
                    .spawn(move || {
                        run_partition_reader(
                            zone,
                            side,
                            reader,
                            ingest_tx,
                            commit_rx,
                            breaker,
                            poll_deadline,
                            retry_backoff,
                            handle,
                            shutdown,
                        )
                    })
                    .context("spawning ingest reader thread")?,
            );
        }
    }
    drop(writer_tx);
    info!(zones = args.zones.len(), "ledger running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; draining");
        }
        res = writer => {
            // The writer only exits early on a fatal storage error.
            match res {
                Ok(Err(e)) => {
                    error!(error = %e, "ledger writer failed");
                    anyhow::bail!("ledger storage failure: {e}");
                }
                Ok(Ok(())) => {}
                Err(e) => anyhow::bail!("ledger writer panicked: {e}"),
            }
        }
    }

    shutdown_tx.send(true).expect("receivers outlive the sender");
    for task in matcher_tasks {
        let _ = task.await;
    }
    tokio::task::spawn_blocking(move || {
        for thread in reader_threads {
            let _ = thread.join();
        }
    })
    .await
    .context("joining reader threads")?;
    Ok(())
}
