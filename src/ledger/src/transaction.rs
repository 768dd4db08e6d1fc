// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ledger's atom: one matched (zone, epoch).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use champ_repr::canonical::{self, CanonicalError};
use champ_repr::{AggregatedEpoch, MapeLedgerEvent};

/// The `type` field of every matched-epoch transaction.
pub const TRANSACTION_TYPE: &str = "epoch.match";

/// A finalized pairing, as produced by the matcher. The store turns this into
/// a [`Transaction`] by assigning the chain fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMatch {
    pub zone_id: String,
    pub epoch_index: u64,
    pub aggregator: AggregatedEpoch,
    pub aggregator_received_at: DateTime<Utc>,
    pub mape: MapeLedgerEvent,
    pub mape_received_at: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
}

/// A ledger transaction.
///
/// `hash` covers the canonical encoding of everything except `id` and `hash`
/// itself; `prev_hash` chains transaction hashes across the whole file,
/// regardless of block boundaries, and is empty only for the genesis
/// transaction.
///
/// `schema_version` is skipped when empty so that legacy transactions written
/// before versions were stamped re-serialize to the exact bytes their stored
/// hash was computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema_version: String,
    pub zone_id: String,
    pub epoch_index: u64,
    pub aggregator: AggregatedEpoch,
    pub aggregator_received_at: DateTime<Utc>,
    pub mape: MapeLedgerEvent,
    pub mape_received_at: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub hash: String,
}

impl Transaction {
    /// Assembles the transaction with the given chain position. The caller
    /// (the store's writer) supplies `id` and `prev_hash`; `hash` is computed
    /// here.
    pub fn assemble(m: EpochMatch, id: i64, prev_hash: String) -> Result<Transaction, CanonicalError> {
        let mut tx = Transaction {
            id,
            kind: TRANSACTION_TYPE.to_string(),
            schema_version: champ_repr::SCHEMA_VERSION.to_string(),
            zone_id: m.zone_id,
            epoch_index: m.epoch_index,
            aggregator: m.aggregator,
            aggregator_received_at: m.aggregator_received_at,
            mape: m.mape,
            mape_received_at: m.mape_received_at,
            matched_at: m.matched_at,
            prev_hash,
            hash: String::new(),
        };
        tx.hash = tx.compute_hash()?;
        Ok(tx)
    }

    /// The transaction's hash: SHA-256 over the canonical encoding without
    /// `id` and `hash`.
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        let bytes = canonical::to_bytes_without(self, &["id", "hash"])?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }

    /// The transaction's Merkle leaf: SHA-256 over the full canonical
    /// encoding, chain fields included.
    pub fn leaf_hash(&self) -> Result<[u8; 32], CanonicalError> {
        let bytes = canonical::to_bytes(self)?;
        Ok(Sha256::digest(bytes).into())
    }
}
