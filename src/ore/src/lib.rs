// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility libraries for NRG-CHAMP.
//!
//! **ore** (_n_): the raw material from which more valuable materials are
//! extracted. Modules here are meant to be small extensions of the Rust
//! standard library with no knowledge of NRG-CHAMP's domain.

pub mod now;
pub mod retry;
pub mod task;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "test")]
pub mod test;
