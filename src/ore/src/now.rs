// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Now utilities.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Converts epoch milliseconds to a UTC `DateTime`.
pub fn to_datetime(millis: EpochMillis) -> DateTime<Utc> {
    let dur = std::time::Duration::from_millis(millis);
    match Utc.timestamp_opt(dur.as_secs() as i64, dur.subsec_nanos()) {
        chrono::LocalResult::Single(dt) => dt,
        _ => panic!("metamorphosis from millis to DateTime failed for millis: {millis}"),
    }
}

/// A function that returns the current time in milliseconds since the Unix
/// epoch.
///
/// Wrapping the clock this way lets tests substitute a controllable source of
/// time for anything that schedules on wall-clock deadlines (grace timers,
/// breaker reset timeouts, block timestamps).
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time, according to this function.
    pub fn as_millis(&self) -> EpochMillis {
        (self.0)()
    }

    /// Returns the current time as a UTC `DateTime`.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        to_datetime(self.as_millis())
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

fn system_time() -> EpochMillis {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get millis since epoch");
    u64::try_from(since_epoch.as_millis()).expect("current time did not fit into u64")
}

fn now_zero() -> EpochMillis {
    0
}

/// A [`NowFn`] that returns the actual system time.
pub fn system_time_now() -> NowFn {
    NowFn::from(system_time)
}

/// A [`NowFn`] that always returns zero.
///
/// For use in tests that want a fixed, predictable clock.
pub fn now_zero_fn() -> NowFn {
    NowFn::from(now_zero)
}

#[cfg(test)]
mod tests {
    use super::{to_datetime, NowFn};

    #[test]
    fn test_to_datetime() {
        let dt = to_datetime(1_577_836_800_000);
        assert_eq!(dt.to_rfc3339(), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_now_fn_from_closure() {
        let now: NowFn = NowFn::from(|| 42);
        assert_eq!(now.as_millis(), 42);
    }
}
