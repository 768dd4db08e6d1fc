// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The append-only block file.
//!
//! One newline-delimited JSON record per line: v2 blocks from current code,
//! legacy v1 events tolerated for backward compatibility. Appends are
//! serialized by a single writer lock and fsynced before the in-memory tail
//! advances; readers see defensive copies under the same RW lock.
//!
//! Loading replays the file and refuses to start on any chain violation: a
//! height gap, a broken header or transaction chain, or a hash that fails to
//! recompute means the file is corrupt and no new writes may be layered on
//! top of it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use champ_ore::now::NowFn;
use champ_repr::canonical::CanonicalError;

use crate::block::{BlockError, BlockMeta, BlockV2};
use crate::metrics::LedgerMetrics;
use crate::transaction::{EpochMatch, Transaction};

/// The ledger file's name within the data directory.
pub const LEDGER_FILE_NAME: &str = "ledger.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("ledger corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

fn corrupt(line: usize, reason: impl Into<String>) -> LedgerError {
    LedgerError::Corrupt {
        line,
        reason: reason.into(),
    }
}

/// A legacy v1 ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventV1 {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// One line of the ledger file.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Event(EventV1),
    Block(BlockV2),
}

/// A query result entry; always a copy of the stored data.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Transaction(Transaction),
    Event(EventV1),
}

/// Filters for [`Ledger::query`]. String matching is case-insensitive; the
/// time range is inclusive on both ends.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub kind: Option<String>,
    pub zone_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// What a full verification pass saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub v1_events: u64,
    pub v2_blocks: u64,
    pub last_height: Option<u64>,
}

#[derive(Debug, Default)]
struct ScanState {
    records: Vec<Record>,
    v1_events: u64,
    v2_blocks: u64,
    schema_empty: u64,
    last_id: i64,
    last_tx_hash: String,
    last_height: Option<u64>,
    last_header_hash: String,
}

impl ScanState {
    fn report(&self) -> VerifyReport {
        VerifyReport {
            v1_events: self.v1_events,
            v2_blocks: self.v2_blocks,
            last_height: self.last_height,
        }
    }
}

/// Replays `path` line by line, verifying every chain invariant.
///
/// Transactions with an empty schema version are normalized to `"v1"` in the
/// returned records and counted in `schema_empty`; their hashes are checked
/// against the *original* empty value first, since that is what was hashed
/// when they were written.
fn scan_file(path: &Path) -> Result<ScanState, LedgerError> {
    let mut state = ScanState::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let lineno = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(block) = serde_json::from_str::<BlockV2>(&line) {
            scan_block(&mut state, block, &line, lineno)?;
            continue;
        }
        match serde_json::from_str::<EventV1>(&line) {
            Ok(event) => {
                state.v1_events += 1;
                if event.id > 0 {
                    state.last_id = state.last_id.max(event.id);
                }
                state.records.push(Record::Event(event));
            }
            Err(e) => return Err(corrupt(lineno, format!("unparseable record: {e}"))),
        }
    }
    Ok(state)
}

fn scan_block(
    state: &mut ScanState,
    mut block: BlockV2,
    line: &str,
    lineno: usize,
) -> Result<(), LedgerError> {
    let header = &block.header;
    let expected_height = state.last_height.map_or(0, |h| h + 1);
    if header.height != expected_height {
        return Err(corrupt(
            lineno,
            format!("height {} does not follow {:?}", header.height, state.last_height),
        ));
    }
    if header.prev_header_hash != state.last_header_hash {
        return Err(corrupt(lineno, "prevHeaderHash does not chain"));
    }
    let leaves = block
        .data
        .transactions
        .iter()
        .map(|tx| tx.leaf_hash())
        .collect::<Result<Vec<_>, _>>()?;
    if header.data_hash != crate::block::merkle_root(&leaves) {
        return Err(corrupt(lineno, "dataHash does not recompute"));
    }
    if header.header_hash != header.compute_hash()? {
        return Err(corrupt(lineno, "headerHash does not recompute"));
    }
    if header.block_size != line.len() as u64 {
        return Err(corrupt(
            lineno,
            format!("blockSize {} != line length {}", header.block_size, line.len()),
        ));
    }
    for tx in &block.data.transactions {
        if tx.id != state.last_id + 1 {
            return Err(corrupt(
                lineno,
                format!("transaction id {} does not follow {}", tx.id, state.last_id),
            ));
        }
        if tx.prev_hash != state.last_tx_hash {
            return Err(corrupt(lineno, "transaction prevHash does not chain"));
        }
        // Recompute over the bytes as written, before any normalization.
        if tx.hash != tx.compute_hash()? {
            return Err(corrupt(lineno, "transaction hash does not recompute"));
        }
        state.last_id = tx.id;
        state.last_tx_hash = tx.hash.clone();
    }
    for tx in &mut block.data.transactions {
        if tx.schema_version.is_empty() {
            tx.schema_version = champ_repr::SCHEMA_VERSION.to_string();
            state.schema_empty += 1;
        }
    }
    state.v2_blocks += 1;
    state.last_height = Some(block.header.height);
    state.last_header_hash = block.header.header_hash.clone();
    state.records.push(Record::Block(block));
    Ok(())
}

#[derive(Debug)]
struct Inner {
    file: File,
    records: Vec<Record>,
    last_id: i64,
    last_tx_hash: String,
    last_height: Option<u64>,
    last_header_hash: String,
}

/// The append-only, hash-chained ledger.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    now: NowFn,
    metrics: LedgerMetrics,
    inner: RwLock<Inner>,
}

impl Ledger {
    /// Opens (creating if absent) and replays the ledger at `path`.
    ///
    /// Any chain violation is fatal: the error is returned and nothing may be
    /// appended on top of the corrupt file.
    pub fn open(
        path: impl Into<PathBuf>,
        now: NowFn,
        metrics: LedgerMetrics,
    ) -> Result<Ledger, LedgerError> {
        let path = path.into();
        let state = scan_file(&path)?;
        metrics
            .load_tx_schema_empty_total
            .inc_by(state.schema_empty);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.set_permissions(PermissionsExt::from_mode(0o644))?;
        info!(
            path = %path.display(),
            v1_events = state.v1_events,
            v2_blocks = state.v2_blocks,
            last_height = ?state.last_height,
            "ledger loaded",
        );
        Ok(Ledger {
            path,
            now,
            metrics,
            inner: RwLock::new(Inner {
                file,
                records: state.records,
                last_id: state.last_id,
                last_tx_hash: state.last_tx_hash,
                last_height: state.last_height,
                last_header_hash: state.last_header_hash,
            }),
        })
    }

    /// Appends one finalized match as a single-transaction block.
    ///
    /// The line is flushed and fsynced before the in-memory tail advances, so
    /// a crash can lose at most an unacknowledged append, never reorder one.
    pub fn append_match(&self, m: EpochMatch) -> Result<(Transaction, BlockMeta), LedgerError> {
        let mut inner = self.inner.write().expect("ledger lock poisoned");
        let tx = Transaction::assemble(m, inner.last_id + 1, inner.last_tx_hash.clone())?;
        let height = inner.last_height.map_or(0, |h| h + 1);
        let (block, line) = BlockV2::seal(
            height,
            inner.last_header_hash.clone(),
            vec![tx],
            self.now.as_datetime(),
        )?;

        inner.file.write_all(&line)?;
        inner.file.write_all(b"\n")?;
        inner.file.flush()?;
        inner.file.sync_all()?;

        let tx = block.data.transactions[0].clone();
        let meta = BlockMeta {
            height: block.header.height,
            header_hash: block.header.header_hash.clone(),
            data_hash: block.header.data_hash.clone(),
        };
        inner.last_id = tx.id;
        inner.last_tx_hash = tx.hash.clone();
        inner.last_height = Some(block.header.height);
        inner.last_header_hash = block.header.header_hash.clone();
        inner.records.push(Record::Block(block));
        Ok((tx, meta))
    }

    /// Rescans the file from disk and checks every invariant.
    ///
    /// Deterministic and idempotent: verifying twice yields the same report.
    /// Holds the read lock so a concurrent append cannot tear the file
    /// mid-scan.
    pub fn verify(&self) -> Result<VerifyReport, LedgerError> {
        let _inner = self.inner.read().expect("ledger lock poisoned");
        let state = scan_file(&self.path)?;
        Ok(state.report())
    }

    /// Pages through matching entries, 1-indexed. Returns copies; callers
    /// cannot mutate stored records.
    pub fn query(&self, filter: &QueryFilter, page: usize, size: usize) -> Vec<LedgerEntry> {
        if page == 0 || size == 0 {
            return Vec::new();
        }
        let inner = self.inner.read().expect("ledger lock poisoned");
        inner
            .records
            .iter()
            .flat_map(|record| -> Vec<LedgerEntry> {
                match record {
                    Record::Event(event) => vec![LedgerEntry::Event(event.clone())],
                    Record::Block(block) => block
                        .data
                        .transactions
                        .iter()
                        .cloned()
                        .map(LedgerEntry::Transaction)
                        .collect(),
                }
            })
            .filter(|entry| filter_matches(filter, entry))
            .skip((page - 1) * size)
            .take(size)
            .collect()
    }

    /// The height of the newest block, if any.
    pub fn last_height(&self) -> Option<u64> {
        self.inner.read().expect("ledger lock poisoned").last_height
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn filter_matches(filter: &QueryFilter, entry: &LedgerEntry) -> bool {
    let (kind, zone_id, timestamp) = match entry {
        LedgerEntry::Transaction(tx) => (&tx.kind, Some(&tx.zone_id), tx.matched_at),
        LedgerEntry::Event(event) => (&event.kind, event.zone_id.as_ref(), event.timestamp),
    };
    if let Some(want) = &filter.kind {
        if !want.eq_ignore_ascii_case(kind) {
            return false;
        }
    }
    if let Some(want) = &filter.zone_id {
        match zone_id {
            Some(zone_id) if want.eq_ignore_ascii_case(zone_id) => {}
            _ => return false,
        }
    }
    if let Some(from) = filter.from {
        if timestamp < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if timestamp > to {
            return false;
        }
    }
    true
}
