// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The core data model shared across NRG-CHAMP components.
//!
//! Telemetry flows through three shapes: raw device readings
//! ([`reading::DeviceReading`]) are binned by the aggregator into one
//! [`aggregate::AggregatedEpoch`] per (zone, epoch), which the ledger pairs
//! with the control loop's [`mape::MapeLedgerEvent`] for the same key.
//!
//! The [`canonical`] module defines the deterministic byte encoding used for
//! every hash in the system. Anything that ends up under a SHA-256 digest goes
//! through it.

pub mod aggregate;
pub mod canonical;
pub mod epoch;
pub mod mape;
pub mod reading;

pub use aggregate::AggregatedEpoch;
pub use epoch::EpochWindow;
pub use mape::{MapeLedgerEvent, PlannedAction};
pub use reading::{AggregatedReading, DeviceReading, DeviceType};

/// The schema version stamped on every record written by current code.
///
/// Loaders tolerate records with an absent version (see the ledger's load
/// path) but writers always stamp this value.
pub const SCHEMA_VERSION: &str = "v1";
