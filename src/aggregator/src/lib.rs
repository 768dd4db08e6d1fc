// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The epoch alignment engine.
//!
//! One drain loop per zone wakes every epoch tick, round-robins across the
//! partitions of the zone's telemetry topic, and bins readings into the
//! target epoch. The first message belonging to a later epoch stops its
//! partition and is *left unread* (the reader seeks back over it), so the
//! next pass starts exactly at the boundary. Offsets are committed only after
//! the emitted [`champ_repr::AggregatedEpoch`] has been acknowledged by the
//! downstream ledger topic; anything less re-drains from the last committed
//! position and relies on the ledger's dedup to absorb the replay.

pub mod config;
pub mod drain;
pub mod metrics;
pub mod service;
