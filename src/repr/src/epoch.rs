// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Epoch windows.
//!
//! An epoch is a fixed-length, zone-scoped time window identified by a
//! monotonic integer index. Windows are aligned to the Unix epoch in UTC, so
//! an index determines its window for a given length and vice versa; two
//! epochs are the same iff `(zone_id, index)` matches.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open time window `[start, end)` with `end = start + length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Monotonic within a zone; `index = floor(start / length)`.
    pub index: u64,
    /// The system-wide epoch length, serialized as integer nanoseconds.
    #[serde(with = "duration_ns")]
    pub length: Duration,
}

impl EpochWindow {
    /// Returns the window at `index` for the given epoch length.
    ///
    /// # Panics
    ///
    /// Panics if `length` is zero; an epoch length of zero is rejected at
    /// configuration time.
    pub fn at(index: u64, length: Duration) -> EpochWindow {
        assert!(!length.is_zero(), "epoch length must be nonzero");
        let length_ns =
            i64::try_from(length.as_nanos()).expect("epoch length known to fit in i64 nanoseconds");
        let start_ns = i64::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(length_ns))
            .expect("epoch start known to fit in i64 nanoseconds");
        let start = DateTime::from_timestamp_nanos(start_ns);
        EpochWindow {
            start,
            end: start + chrono::Duration::nanoseconds(length_ns),
            index,
            length,
        }
    }

    /// Returns the index of the window containing `ts`.
    ///
    /// Timestamps before the Unix epoch clamp to index 0; building telemetry
    /// never produces them.
    pub fn index_for(ts: DateTime<Utc>, length: Duration) -> u64 {
        assert!(!length.is_zero(), "epoch length must be nonzero");
        let ts_ns = ts.timestamp_nanos_opt().unwrap_or(0).max(0) as u128;
        u64::try_from(ts_ns / length.as_nanos()).expect("epoch index known to fit in u64")
    }

    /// Reports whether `ts` falls within `[start, end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Serializes a [`std::time::Duration`] as integer nanoseconds.
///
/// The canonical encoding (and therefore every hash) depends on durations
/// never serializing as anything structured.
pub mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ns = i64::try_from(d.as_nanos())
            .map_err(|_| serde::ser::Error::custom("duration overflows i64 nanoseconds"))?;
        serializer.serialize_i64(ns)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ns = i64::deserialize(deserializer)?;
        let ns = u64::try_from(ns)
            .map_err(|_| serde::de::Error::custom("negative duration nanoseconds"))?;
        Ok(Duration::from_nanos(ns))
    }
}
