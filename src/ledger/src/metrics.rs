// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Ledger metrics.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// All collectors exposed by `ledgerd`. Cheap to clone; clones share
/// collectors.
#[derive(Debug, Clone)]
pub struct LedgerMetrics {
    /// Sides synthesized after grace expiry, by zone.
    pub imputed_total: IntCounterVec,
    /// Payloads that failed to decode or arrived behind the finalized
    /// frontier, by side.
    pub decode_errors_total: IntCounterVec,
    /// Seconds from first side seen to finalization.
    pub match_latency_seconds: Histogram,
    /// Pending epochs evicted because the buffer was full, by zone.
    pub evicted_total: IntCounterVec,
    /// Loaded transactions whose schema version had to be normalized.
    pub load_tx_schema_empty_total: IntCounter,
    /// Public envelope publish attempts, by result.
    pub public_publish_total: IntCounterVec,
    /// Unix seconds of the last public publish failure.
    pub public_last_error_ts: IntGauge,
    /// Current depth of the public publish queue.
    pub public_queue_depth: IntGauge,
}

impl LedgerMetrics {
    pub fn register_into(registry: &Registry) -> LedgerMetrics {
        let metrics = LedgerMetrics {
            imputed_total: IntCounterVec::new(
                Opts::new(
                    "ledger_ingest_imputed_total",
                    "Epoch sides imputed after grace expiry.",
                ),
                &["zone"],
            )
            .expect("metric options known to be valid"),
            decode_errors_total: IntCounterVec::new(
                Opts::new(
                    "ledger_ingest_decode_errors_total",
                    "Undecodable or stale ingest payloads.",
                ),
                &["side"],
            )
            .expect("metric options known to be valid"),
            match_latency_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "ledger_ingest_match_latency_seconds",
                    "Time from first side seen to finalization.",
                )
                .buckets(prometheus::exponential_buckets(0.005, 2.0, 12).expect("valid buckets")),
            )
            .expect("metric options known to be valid"),
            evicted_total: IntCounterVec::new(
                Opts::new(
                    "ledger_ingest_evicted_total",
                    "Pending epochs evicted because the buffer was full.",
                ),
                &["zone"],
            )
            .expect("metric options known to be valid"),
            load_tx_schema_empty_total: IntCounter::new(
                "ledger_load_tx_schema_empty_total",
                "Loaded transactions with an empty schema version.",
            )
            .expect("metric options known to be valid"),
            public_publish_total: IntCounterVec::new(
                Opts::new(
                    "ledger_public_publish_total",
                    "Public envelope publish attempts.",
                ),
                &["result"],
            )
            .expect("metric options known to be valid"),
            public_last_error_ts: IntGauge::new(
                "ledger_public_last_error_ts",
                "Unix seconds of the last public publish failure.",
            )
            .expect("metric options known to be valid"),
            public_queue_depth: IntGauge::new(
                "ledger_public_queue_depth",
                "Current depth of the public publish queue.",
            )
            .expect("metric options known to be valid"),
        };
        registry
            .register(Box::new(metrics.imputed_total.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.decode_errors_total.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.match_latency_seconds.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.evicted_total.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.load_tx_schema_empty_total.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.public_publish_total.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.public_last_error_ts.clone()))
            .expect("collector not registered twice");
        registry
            .register(Box::new(metrics.public_queue_depth.clone()))
            .expect("collector not registered twice");
        metrics
    }

    /// A metrics instance on a throwaway registry, for tests.
    pub fn unregistered() -> LedgerMetrics {
        LedgerMetrics::register_into(&Registry::new())
    }
}
