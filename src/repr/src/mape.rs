// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The MAPE control loop's per-epoch decision event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION;

/// The action the planner chose for an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannedAction {
    Hold,
    Heat,
    Cool,
    Ventilate,
}

/// One decision event per (zone, epoch), produced on the MAPE partition of
/// `zone.ledger.<zone>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapeLedgerEvent {
    pub schema_version: String,
    pub epoch_index: u64,
    pub zone_id: String,
    pub planned: PlannedAction,
    pub target_c: f64,
    pub hysteresis_c: f64,
    pub delta_c: f64,
    /// Fan duty level; 0 when idle.
    pub fan: u8,
    pub epoch_start: DateTime<Utc>,
    pub epoch_end: DateTime<Utc>,
    pub timestamp_ms: u64,
}

impl MapeLedgerEvent {
    /// Returns the `hold` event the ledger imputes when the MAPE side never
    /// arrives: no correction, no fan, target carried from the last known
    /// value (or the configured default).
    pub fn imputed_hold(
        zone_id: String,
        epoch_index: u64,
        epoch_start: DateTime<Utc>,
        epoch_end: DateTime<Utc>,
        target_c: f64,
        now_ms: u64,
    ) -> Self {
        MapeLedgerEvent {
            schema_version: SCHEMA_VERSION.to_string(),
            epoch_index,
            zone_id,
            planned: PlannedAction::Hold,
            target_c,
            hysteresis_c: 0.0,
            delta_c: 0.0,
            fan: 0,
            epoch_start,
            epoch_end,
            timestamp_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PlannedAction;

    #[test]
    fn test_planned_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&PlannedAction::Hold).unwrap(),
            "\"hold\""
        );
        let cool: PlannedAction = serde_json::from_str("\"cool\"").unwrap();
        assert_eq!(cool, PlannedAction::Cool);
    }
}
