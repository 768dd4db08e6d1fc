// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tokio task spawning that requires a name.
//!
//! Naming every task costs nothing and pays for itself the first time a
//! runtime dump has to be read.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a named asynchronous task on the current Tokio runtime.
#[track_caller]
pub fn spawn<N, S, Fut>(name: N, fut: Fut) -> JoinHandle<Fut::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    tracing::debug!(task = name().as_ref(), "spawning task");
    tokio::spawn(fut)
}

/// Spawns a named blocking task on the current Tokio runtime's blocking pool.
#[track_caller]
pub fn spawn_blocking<N, S, F, R>(name: N, f: F) -> JoinHandle<R>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tracing::debug!(task = name().as_ref(), "spawning blocking task");
    tokio::task::spawn_blocking(f)
}
