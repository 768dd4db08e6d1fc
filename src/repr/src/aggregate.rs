// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The aggregator's per-epoch output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::epoch::EpochWindow;
use crate::reading::AggregatedReading;
use crate::SCHEMA_VERSION;

/// Summary key under which the aggregator reports the zone's energy use for
/// the epoch, in kWh. The public publisher projects this into
/// `energy_kwh_total`.
pub const SUMMARY_ZONE_ENERGY_KWH: &str = "zoneEnergyKWhEpoch";

/// Summary key for the mean of the epoch's finite temperature readings.
pub const SUMMARY_ZONE_AVG_TEMP: &str = "zoneAvgTempC";

/// Summary key for the number of readings that survived filtering.
pub const SUMMARY_READING_COUNT: &str = "readingCount";

/// One zone-epoch's worth of telemetry, grouped by device.
///
/// `by_device` values are sorted by `(timestamp, offset)` ascending and every
/// reading's timestamp lies in `[epoch.start, epoch.end)`. The maps are
/// `BTreeMap`s so the serialized key order is byte-wise, which the canonical
/// encoding relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEpoch {
    pub schema_version: String,
    pub zone_id: String,
    pub epoch: EpochWindow,
    pub by_device: BTreeMap<String, Vec<AggregatedReading>>,
    pub summary: BTreeMap<String, f64>,
    pub produced_at: DateTime<Utc>,
}

impl AggregatedEpoch {
    /// Returns an empty epoch for `(zone_id, epoch)`: no devices, zeroed
    /// summary. This is what the ledger imputes when the aggregator side
    /// never arrives.
    pub fn empty(zone_id: String, epoch: EpochWindow, produced_at: DateTime<Utc>) -> Self {
        let mut summary = BTreeMap::new();
        summary.insert(SUMMARY_ZONE_ENERGY_KWH.to_string(), 0.0);
        summary.insert(SUMMARY_ZONE_AVG_TEMP.to_string(), 0.0);
        summary.insert(SUMMARY_READING_COUNT.to_string(), 0.0);
        AggregatedEpoch {
            schema_version: SCHEMA_VERSION.to_string(),
            zone_id,
            epoch,
            by_device: BTreeMap::new(),
            summary,
            produced_at,
        }
    }

    /// The total energy recorded in the summary, or 0 when absent.
    pub fn energy_kwh_total(&self) -> f64 {
        self.summary
            .get(SUMMARY_ZONE_ENERGY_KWH)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::AggregatedEpoch;
    use crate::epoch::EpochWindow;

    #[test]
    fn test_empty_epoch_zeroes_summary() {
        let epoch = EpochWindow::at(5, Duration::from_secs(300));
        let agg = AggregatedEpoch::empty("A".into(), epoch, Utc::now());
        assert!(agg.by_device.is_empty());
        assert_eq!(agg.energy_kwh_total(), 0.0);
        assert_eq!(agg.schema_version, "v1");
    }

    #[test]
    fn test_by_device_keys_serialize_sorted() {
        let epoch = EpochWindow::at(0, Duration::from_secs(300));
        let mut agg = AggregatedEpoch::empty("A".into(), epoch, Utc::now());
        agg.by_device.insert("zeta".into(), vec![]);
        agg.by_device.insert("alpha".into(), vec![]);
        let json = serde_json::to_string(&agg).unwrap();
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
    }
}
