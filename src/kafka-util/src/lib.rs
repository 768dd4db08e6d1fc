// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Utilities for working with Kafka.
//!
//! The aggregator and the ledger both talk to the bus through the narrow
//! capability set in [`bus`] (`produce` / `fetch` / `seek` / `commit`), which
//! keeps the epoch machinery testable against the in-memory implementation in
//! [`mem`] while production wires up the rdkafka-backed one in [`kafka`].

pub mod bus;
pub mod client;
pub mod kafka;
pub mod mem;

pub use bus::{BusError, BusProducer, BusRecord, PartitionReader};
