//! 4-hour window arithmetic.
//!
//! Windows are anchored at 00:00 of a reference day. The reference day is
//! defined by a fixed UTC offset (`WindowAnchor`), so boundaries fall at
//! 00:00, 04:00, 08:00, 12:00, 16:00 and 20:00 local to that offset. The
//! last window of a day is [20:00, 24:00).

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Width of a raw record slot.
pub const QUARTER_MINUTES: i64 = 15;

/// Width of an aggregated window.
pub const WINDOW_HOURS: i64 = 4;

/// Number of 15-minute slots in one 4-hour window.
pub const RECORDS_PER_WINDOW: usize = 16;

/// Number of 4-hour windows in one reference day.
pub const WINDOWS_PER_DAY: usize = 6;

const QUARTER_SECS: i64 = QUARTER_MINUTES * 60;
const WINDOW_SECS: i64 = WINDOW_HOURS * 3600;
const DAY_MINUTES: i32 = 24 * 60;

/// Duration of one aggregated window.
pub fn window_duration() -> Duration {
    Duration::hours(WINDOW_HOURS)
}

/// Duration of one raw record slot.
pub fn quarter_duration() -> Duration {
    Duration::minutes(QUARTER_MINUTES)
}

/// True if `ts` sits exactly on a :00/:15/:30/:45 boundary with zero seconds.
pub fn is_quarter_aligned(ts: DateTime<Utc>) -> bool {
    ts.timestamp().rem_euclid(QUARTER_SECS) == 0 && ts.timestamp_subsec_nanos() == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    #[error("anchor offset {0} min is not a multiple of 15 minutes")]
    NotQuarterAligned(i32),

    #[error("anchor offset {0} min is outside (-24h, +24h)")]
    OutOfRange(i32),
}

/// Reference-day definition: the UTC offset whose local midnight starts
/// the first window of each day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WindowAnchor {
    offset_minutes: i32,
}

impl WindowAnchor {
    /// Windows anchored at 00:00 UTC.
    pub const UTC: Self = Self { offset_minutes: 0 };

    pub fn from_offset_minutes(offset_minutes: i32) -> Result<Self, AnchorError> {
        if offset_minutes <= -DAY_MINUTES || offset_minutes >= DAY_MINUTES {
            return Err(AnchorError::OutOfRange(offset_minutes));
        }
        if i64::from(offset_minutes) % QUARTER_MINUTES != 0 {
            return Err(AnchorError::NotQuarterAligned(offset_minutes));
        }
        Ok(Self { offset_minutes })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset_minutes
    }

    fn offset_secs(&self) -> i64 {
        i64::from(self.offset_minutes) * 60
    }

    /// Seconds elapsed since the start of the window containing `ts`.
    fn excess_secs(&self, ts: DateTime<Utc>) -> i64 {
        (ts.timestamp() + self.offset_secs()).rem_euclid(WINDOW_SECS)
    }

    /// Start of the window containing `ts`, or `None` if it falls outside
    /// the representable range.
    pub fn window_start(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        ts.checked_sub_signed(Duration::seconds(self.excess_secs(ts)))?
            .checked_sub_signed(Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos())))
    }

    /// Exclusive end of the window containing `ts`.
    pub fn window_end(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window_start(ts)?.checked_add_signed(window_duration())
    }

    /// Smallest window boundary that is `>= ts`.
    pub fn window_ceil(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_window_start(ts) {
            Some(ts)
        } else {
            self.window_end(ts)
        }
    }

    pub fn is_window_start(&self, ts: DateTime<Utc>) -> bool {
        self.excess_secs(ts) == 0 && ts.timestamp_subsec_nanos() == 0
    }

    /// Window starts covering `[start, end)`, padded outward to boundaries.
    /// Empty when either padded end is unrepresentable.
    pub fn windows_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> {
        let bounds = self.window_start(start).zip(self.window_ceil(end));
        std::iter::successors(bounds.map(|(first, _)| first), |w| {
            w.checked_add_signed(window_duration())
        })
        .take_while(move |w| bounds.is_some_and(|(_, last)| *w < last))
    }

    /// Slot index (0..16) of `ts` inside the window starting at `window`,
    /// or `None` if `ts` is misaligned or outside that window.
    pub fn quarter_slot(&self, window: DateTime<Utc>, ts: DateTime<Utc>) -> Option<usize> {
        if !is_quarter_aligned(ts) || ts < window {
            return None;
        }
        let slot = (ts - window).num_seconds() / QUARTER_SECS;
        usize::try_from(slot)
            .ok()
            .filter(|s| *s < RECORDS_PER_WINDOW)
    }
}
