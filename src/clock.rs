// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wall-clock timestamps and their conversion to native timer deadlines.

use crate::error::Error;
use std::ops::Add;
use std::ops::Sub;
use std::time::Duration;
use std::time::SystemTime;

const NANOS_PER_SEC: u32 = 1_000_000_000;
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;
/// Seconds between 1601-01-01 (the FILETIME epoch) and 1970-01-01.
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// An absolute wall-clock instant, measured against the system's real-time
/// clock.
///
/// Stored as whole seconds since the Unix epoch plus a nanosecond remainder
/// in `[0, 1e9)`. Instants before the epoch have a negative second count and
/// a non-negative remainder, so ordering and arithmetic stay uniform.
///
/// A `Timestamp` may be in the past; waits armed on a past instant complete
/// promptly rather than failing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns a timestamp from whole seconds and a nanosecond remainder.
    ///
    /// Panics if `nanos` is `1e9` or more.
    pub fn from_unix_parts(secs: i64, nanos: u32) -> Self {
        assert!(nanos < NANOS_PER_SEC);
        Self { secs, nanos }
    }

    /// Returns a timestamp from a fractional Unix timestamp in seconds.
    ///
    /// The fractional part is rounded to the nearest nanosecond; rounding
    /// that reaches a full second carries into the second count.
    pub fn from_unix_secs_f64(secs: f64) -> Self {
        let mut whole = secs.trunc() as i64;
        let mut nanos = (secs.fract() * NANOS_PER_SEC as f64).round() as i64;
        if nanos < 0 {
            whole -= 1;
            nanos += NANOS_PER_SEC as i64;
        }
        if nanos >= NANOS_PER_SEC as i64 {
            whole += 1;
            nanos -= NANOS_PER_SEC as i64;
        }
        Self {
            secs: whole,
            nanos: nanos as u32,
        }
    }

    /// The whole-second part, seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> i64 {
        self.secs
    }

    /// The sub-second part, in nanoseconds.
    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Returns `(tv_sec, tv_nsec)` for programming an absolute one-shot
    /// deadline into a POSIX timer facility.
    ///
    /// Instants at or before the epoch are clamped to one nanosecond past
    /// it: the all-zero encoding disarms rather than arms a timer, and a
    /// clamped value is still long past, so the timer fires promptly either
    /// way.
    #[cfg(unix)]
    pub(crate) fn to_timespec_parts(&self) -> (i64, u32) {
        if self.secs < 0 || (self.secs == 0 && self.nanos == 0) {
            (0, 1)
        } else {
            (self.secs, self.nanos)
        }
    }

    /// Returns the instant as 100 ns ticks since 1601-01-01, the Windows
    /// FILETIME epoch, rounding the nanosecond remainder to the nearest
    /// tick.
    ///
    /// Instants at or before 1601 are clamped to one tick: zero or negative
    /// due times have reserved meanings to `SetWaitableTimer`.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn to_filetime_ticks(&self) -> i64 {
        let mut secs = self.secs + FILETIME_EPOCH_OFFSET_SECS;
        let mut frac = (i64::from(self.nanos) + 50) / 100;
        if frac == FILETIME_TICKS_PER_SEC {
            secs += 1;
            frac = 0;
        }
        let ticks = secs.saturating_mul(FILETIME_TICKS_PER_SEC).saturating_add(frac);
        ticks.max(1)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(since) => Self {
                secs: since.as_secs() as i64,
                nanos: since.subsec_nanos(),
            },
            Err(err) => {
                // Pre-epoch: negate and normalize the remainder back into
                // [0, 1e9).
                let before = err.duration();
                let mut secs = -(before.as_secs() as i64);
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = NANOS_PER_SEC - nanos;
                }
                Self { secs, nanos }
            }
        }
    }
}

impl From<time::OffsetDateTime> for Timestamp {
    fn from(time: time::OffsetDateTime) -> Self {
        let nanos = time.unix_timestamp_nanos();
        Self {
            secs: nanos.div_euclid(i128::from(NANOS_PER_SEC)) as i64,
            nanos: nanos.rem_euclid(i128::from(NANOS_PER_SEC)) as u32,
        }
    }
}

impl TryFrom<time::PrimitiveDateTime> for Timestamp {
    type Error = Error;

    /// Always fails: a [`time::PrimitiveDateTime`] carries no UTC offset, so
    /// it does not name an instant. Resolve the offset first and pass a
    /// [`time::OffsetDateTime`].
    fn try_from(_time: time::PrimitiveDateTime) -> Result<Self, Error> {
        Err(Error::NaiveTimestamp)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let mut secs = self.secs + rhs.as_secs() as i64;
        let mut nanos = self.nanos + rhs.subsec_nanos();
        if nanos >= NANOS_PER_SEC {
            secs += 1;
            nanos -= NANOS_PER_SEC;
        }
        Self { secs, nanos }
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        let mut secs = self.secs - rhs.as_secs() as i64;
        let borrow = rhs.subsec_nanos();
        let nanos = if self.nanos >= borrow {
            self.nanos - borrow
        } else {
            secs -= 1;
            self.nanos + NANOS_PER_SEC - borrow
        };
        Self { secs, nanos }
    }
}
