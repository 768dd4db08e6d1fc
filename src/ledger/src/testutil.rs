// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared unit-test fixtures.

use std::time::Duration;

use chrono::{TimeZone, Utc};

use champ_repr::{AggregatedEpoch, EpochWindow, MapeLedgerEvent};

use crate::transaction::EpochMatch;

pub(crate) const TEST_EPOCH_LENGTH: Duration = Duration::from_secs(300);

/// A minimal, fully-imputed match for `(zone, epoch_index)` at a fixed time.
pub(crate) fn test_match(zone: &str, epoch_index: u64) -> EpochMatch {
    let window = EpochWindow::at(epoch_index, TEST_EPOCH_LENGTH);
    let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    EpochMatch {
        zone_id: zone.into(),
        epoch_index,
        aggregator: AggregatedEpoch::empty(zone.into(), window.clone(), at),
        aggregator_received_at: at,
        mape: MapeLedgerEvent::imputed_hold(
            zone.into(),
            epoch_index,
            window.start,
            window.end,
            21.0,
            1_700_000_000_000,
        ),
        mape_received_at: at,
        matched_at: at,
    }
}
