//! 15-minute → 4-hour aggregation.
//!
//! Records are grouped by their anchored 4-hour window. A window produces a
//! `Candle4h` only when all 16 quarter slots are present exactly once.
//! Incomplete windows, including those cut off at the edges of the input,
//! are dropped without a trace; they are "not yet computable", not errors.
//!
//! Integrity problems are different. A duplicated or misaligned timestamp
//! aborts its window and is reported in `Aggregation::rejected`. Out-of-order
//! input aborts the whole call, since grouping relies on ascending order.

use crate::domain::{Candle15m, Candle4h, WindowAnchor, FULL_WINDOW_COUNT, RECORDS_PER_WINDOW};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("duplicate 15m timestamp {timestamp} for {symbol}")]
    DuplicateRawTimestamp {
        symbol: String,
        timestamp: DateTime<Utc>,
    },

    #[error("15m timestamp {timestamp} for {symbol} is not on a quarter-hour boundary")]
    MisalignedTimestamp {
        symbol: String,
        timestamp: DateTime<Utc>,
    },

    #[error("15m timestamp {timestamp} for {symbol} has no representable 4h window")]
    TimestampOutOfRange {
        symbol: String,
        timestamp: DateTime<Utc>,
    },

    #[error("15m records for {symbol} out of order: {timestamp} follows {previous}")]
    UnsortedInput {
        symbol: String,
        previous: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    /// Complete bars in window order.
    pub bars: Vec<Candle4h>,
    /// Windows aborted because of raw-data integrity problems.
    pub rejected: Vec<AggregateError>,
}

impl Aggregation {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Records falling in one window, in input order.
struct WindowGroup<'a> {
    start: DateTime<Utc>,
    records: Vec<&'a Candle15m>,
}

/// Aggregate ascending 15-minute records for `symbol` into 4-hour bars.
pub fn aggregate(
    symbol: &str,
    records: &[Candle15m],
    anchor: WindowAnchor,
) -> Result<Aggregation, AggregateError> {
    let (groups, out_of_range) = group_by_window(symbol, records, anchor)?;

    let folded: Vec<Result<Option<Candle4h>, AggregateError>> = groups
        .par_iter()
        .map(|group| fold_window(symbol, group, anchor))
        .collect();

    let mut out = Aggregation {
        rejected: out_of_range,
        ..Aggregation::default()
    };
    for result in folded {
        match result {
            Ok(Some(bar)) => out.bars.push(bar),
            Ok(None) => {}
            Err(e) => out.rejected.push(e),
        }
    }

    debug!(
        symbol,
        records = records.len(),
        windows = groups.len(),
        bars = out.bars.len(),
        rejected = out.rejected.len(),
        "aggregated 15m records"
    );
    Ok(out)
}

/// Groups in window order, plus rejections for records whose window would
/// start or end outside the representable time range.
fn group_by_window<'a>(
    symbol: &str,
    records: &'a [Candle15m],
    anchor: WindowAnchor,
) -> Result<(Vec<WindowGroup<'a>>, Vec<AggregateError>), AggregateError> {
    let mut groups: Vec<WindowGroup<'a>> = Vec::new();
    let mut out_of_range = Vec::new();
    let mut previous: Option<DateTime<Utc>> = None;

    for record in records {
        if let Some(prev) = previous {
            if record.timestamp < prev {
                return Err(AggregateError::UnsortedInput {
                    symbol: symbol.to_string(),
                    previous: prev,
                    timestamp: record.timestamp,
                });
            }
        }
        previous = Some(record.timestamp);

        let Some(start) = anchor
            .window_start(record.timestamp)
            .filter(|_| anchor.window_end(record.timestamp).is_some())
        else {
            out_of_range.push(AggregateError::TimestampOutOfRange {
                symbol: symbol.to_string(),
                timestamp: record.timestamp,
            });
            continue;
        };
        match groups.last_mut() {
            Some(group) if group.start == start => group.records.push(record),
            _ => groups.push(WindowGroup {
                start,
                records: vec![record],
            }),
        }
    }

    Ok((groups, out_of_range))
}

/// Fold one window. `Ok(None)` means incomplete.
fn fold_window(
    symbol: &str,
    group: &WindowGroup<'_>,
    anchor: WindowAnchor,
) -> Result<Option<Candle4h>, AggregateError> {
    let mut slots: [Option<&Candle15m>; RECORDS_PER_WINDOW] = [None; RECORDS_PER_WINDOW];

    for record in &group.records {
        let slot = anchor.quarter_slot(group.start, record.timestamp).ok_or_else(|| {
            AggregateError::MisalignedTimestamp {
                symbol: symbol.to_string(),
                timestamp: record.timestamp,
            }
        })?;
        if slots[slot].is_some() {
            return Err(AggregateError::DuplicateRawTimestamp {
                symbol: symbol.to_string(),
                timestamp: record.timestamp,
            });
        }
        slots[slot] = Some(record);
    }

    let mut filled = Vec::with_capacity(RECORDS_PER_WINDOW);
    for slot in slots {
        match slot {
            Some(record) => filled.push(record),
            None => return Ok(None),
        }
    }

    let first = filled[0];
    let last = filled[RECORDS_PER_WINDOW - 1];
    let mut bar = Candle4h {
        period_start: group.start,
        open: first.open,
        high: first.high,
        low: first.low,
        close: last.close,
        volume: first.volume,
        record_count: FULL_WINDOW_COUNT,
    };
    for record in &filled[1..] {
        bar.high = bar.high.max(record.high);
        bar.low = bar.low.min(record.low);
        bar.volume += record.volume;
    }

    Ok(Some(bar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record(ts: DateTime<Utc>, i: i64) -> Candle15m {
        let base = Decimal::from(100 + i);
        Candle15m {
            timestamp: ts,
            open: base,
            high: base + dec!(2.5),
            low: base - dec!(1.25),
            close: base + dec!(0.5),
            volume: dec!(10.1),
        }
    }

    fn quarters(start: DateTime<Utc>, n: i64) -> Vec<Candle15m> {
        (0..n)
            .map(|i| record(start + Duration::minutes(15 * i), i))
            .collect()
    }

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn full_window_folds_ohlcv() {
        let records = quarters(midnight(), 16);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();

        assert!(out.is_clean());
        assert_eq!(out.bars.len(), 1);
        let bar = &out.bars[0];
        assert_eq!(bar.period_start, midnight());
        assert_eq!(bar.open, dec!(100));
        assert_eq!(bar.close, dec!(115.5));
        assert_eq!(bar.high, dec!(117.5));
        assert_eq!(bar.low, dec!(98.75));
        assert_eq!(bar.volume, dec!(161.6));
        assert_eq!(bar.record_count, 16);
    }

    #[test]
    fn missing_slot_drops_window() {
        let mut records = quarters(midnight(), 16);
        records.remove(7);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert!(out.bars.is_empty());
        assert!(out.is_clean());
    }

    #[test]
    fn edge_windows_are_dropped() {
        // Starts at 02:00, so [00:00, 04:00) is partial; [04:00, 08:00) is full;
        // [08:00, 12:00) only has one record.
        let records = quarters(midnight() + Duration::hours(2), 8 + 16 + 1);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert_eq!(out.bars.len(), 1);
        assert_eq!(out.bars[0].period_start, midnight() + Duration::hours(4));
    }

    #[test]
    fn duplicate_timestamp_aborts_only_its_window() {
        let mut records = quarters(midnight(), 32);
        let dup = records[20].clone();
        records.insert(21, dup);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();

        assert_eq!(out.bars.len(), 1);
        assert_eq!(out.bars[0].period_start, midnight());
        assert_eq!(
            out.rejected,
            vec![AggregateError::DuplicateRawTimestamp {
                symbol: "BTCUSDT".into(),
                timestamp: midnight() + Duration::minutes(15 * 20),
            }]
        );
    }

    #[test]
    fn misaligned_record_aborts_window() {
        let mut records = quarters(midnight(), 16);
        records[3].timestamp += Duration::minutes(1);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert!(out.bars.is_empty());
        assert!(matches!(
            out.rejected[0],
            AggregateError::MisalignedTimestamp { .. }
        ));
    }

    #[test]
    fn record_in_last_representable_window_is_rejected() {
        let max = DateTime::<Utc>::MAX_UTC;
        let last_quarter = max - Duration::nanoseconds(i64::from(max.timestamp_subsec_nanos()))
            - Duration::seconds(max.timestamp().rem_euclid(15 * 60));
        let records = vec![record(last_quarter, 0)];
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert!(out.bars.is_empty());
        assert_eq!(
            out.rejected,
            vec![AggregateError::TimestampOutOfRange {
                symbol: "BTCUSDT".into(),
                timestamp: last_quarter,
            }]
        );
    }

    #[test]
    fn unsorted_input_is_an_error() {
        let mut records = quarters(midnight(), 16);
        records.swap(4, 5);
        let err = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap_err();
        assert!(matches!(err, AggregateError::UnsortedInput { .. }));
    }

    #[test]
    fn full_day_yields_six_bars() {
        let records = quarters(midnight(), 96);
        let out = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert_eq!(out.bars.len(), 6);
        let last = out.bars.last().unwrap();
        assert_eq!(last.period_start, midnight() + Duration::hours(20));
        assert_eq!(last.period_end(), Some(midnight() + Duration::hours(24)));
    }

    #[test]
    fn anchored_day_uses_local_midnight() {
        // UTC+2 local midnight on 2024-03-01 is 2024-02-29T22:00Z.
        let anchor = WindowAnchor::from_offset_minutes(120).unwrap();
        let local_midnight = midnight() - Duration::hours(2);
        let records = quarters(local_midnight, 96);
        let out = aggregate("BTCUSDT", &records, anchor).unwrap();
        assert_eq!(out.bars.len(), 6);
        assert_eq!(out.bars[0].period_start, local_midnight);

        // Same records on a UTC grid: the first and last windows are split.
        let utc = aggregate("BTCUSDT", &records, WindowAnchor::UTC).unwrap();
        assert_eq!(utc.bars.len(), 5);
    }

    #[test]
    fn empty_input() {
        let out = aggregate("BTCUSDT", &[], WindowAnchor::UTC).unwrap();
        assert_eq!(out, Aggregation::default());
    }
}
