// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Canonical JSON.
//!
//! Every hash in the system is computed over the byte encoding produced here,
//! so the encoding must be a pure function of the value:
//!
//!   * object keys appear in natural (byte-wise) sort order;
//!   * no whitespace;
//!   * absent optional fields are omitted entirely, never `null`;
//!   * timestamps are UTC RFC 3339, durations integer nanoseconds (both are
//!     properties of the serde representations in this crate, enforced by the
//!     round-trip tests below).
//!
//! We deliberately do not hash language-native struct serialisation: values
//! are first lowered to [`serde_json::Value`], whose object representation is
//! a `BTreeMap`, which gives the sorted-key property for free. The on-disk
//! line may order struct fields by declaration instead; only hashes go
//! through this module.

use serde::Serialize;
use serde_json::Value;

/// An error produced while canonicalizing a value.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("value did not serialize to a JSON object")]
    NotAnObject,
    #[error("canonical serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Returns the canonical byte encoding of `value`.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Returns the canonical byte encoding of `value` with the named top-level
/// fields removed.
///
/// This is how hashes exclude their own carrier fields (`hash`, `id`,
/// `headerHash`): strip the keys from the lowered object, then encode.
pub fn to_bytes_without<T: Serialize>(
    value: &T,
    exclude: &[&str],
) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(value)?;
    let Value::Object(mut map) = value else {
        return Err(CanonicalError::NotAnObject);
    };
    for key in exclude {
        map.remove(*key);
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}
