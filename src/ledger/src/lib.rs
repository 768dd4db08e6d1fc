// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tamper-evident epoch ledger.
//!
//! Ingest ([`ingest`]) pairs the aggregator's and the MAPE loop's views of
//! each `(zone, epoch)` across the two partitions of `zone.ledger.<zone>`,
//! imputing a missing side after a bounded grace period so the ledger always
//! advances. Finalized matches become transactions in an append-only,
//! hash-chained block file ([`store`], [`block`]); each successful append
//! fires the public publisher ([`publish`]), which projects a redacted
//! envelope onto the downstream epoch stream, best-effort, behind a circuit
//! breaker. The ledger file is the source of truth; the public stream never
//! gates or rolls it back.

pub mod block;
#[cfg(test)]
pub(crate) mod testutil;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod publish;
pub mod service;
pub mod store;
pub mod transaction;

pub use block::{BlockMeta, BlockV2};
pub use ingest::{Matcher, Side};
pub use store::{Ledger, LedgerError, VerifyReport};
pub use transaction::{EpochMatch, Transaction};
