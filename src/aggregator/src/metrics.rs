// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Aggregator metrics.

use prometheus::{IntCounterVec, Opts, Registry};

/// Counters for the drain loops. Cheap to clone; clones share collectors.
#[derive(Debug, Clone)]
pub struct AggregatorMetrics {
    /// Epochs emitted downstream, by zone.
    pub emitted_epochs: IntCounterVec,
    /// Readings dropped during draining, by zone and reason.
    pub discarded_readings: IntCounterVec,
    /// Telemetry payloads that failed to decode, by zone.
    pub decode_errors: IntCounterVec,
}

impl AggregatorMetrics {
    pub fn register_into(registry: &Registry) -> AggregatorMetrics {
        let metrics = AggregatorMetrics {
            emitted_epochs: IntCounterVec::new(
                Opts::new("agg_emitted_epochs_total", "Aggregated epochs emitted."),
                &["zone"],
            )
            .expect("metric options known to be valid"),
            discarded_readings: IntCounterVec::new(
                Opts::new(
                    "agg_discarded_readings_total",
                    "Readings dropped while draining.",
                ),
                &["zone", "reason"],
            )
            .expect("metric options known to be valid"),
            decode_errors: IntCounterVec::new(
                Opts::new(
                    "agg_decode_errors_total",
                    "Telemetry payloads that failed to decode.",
                ),
                &["zone"],
            )
            .expect("metric options known to be valid"),
        };
        for collector in [
            &metrics.emitted_epochs,
            &metrics.discarded_readings,
            &metrics.decode_errors,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("collector not registered twice");
        }
        metrics
    }
}
