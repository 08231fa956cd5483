//! On-disk CSV representation of a cache entry.
//!
//! ```text
//! period_start,open,high,low,close,volume
//! 2024-03-01T00:00:00Z,100.5,103,99.25,102,1234.5
//! ```
//!
//! Rows are strictly ascending, aligned to the store's anchor, and carry
//! decimals in plain notation. `record_count` is implied (always 16).

use super::entry::CacheEntry;
use crate::domain::{Candle4h, WindowAnchor, FULL_WINDOW_COUNT};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HEADER: [&str; 6] = ["period_start", "open", "high", "low", "close", "volume"];

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected header {found:?}")]
    Header { found: Vec<String> },

    #[error("row {row}: {reason}")]
    Row { row: u64, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRow {
    period_start: String,
    #[serde(with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
}

impl From<&Candle4h> for CacheRow {
    fn from(bar: &Candle4h) -> Self {
        Self {
            period_start: bar.period_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// Serialize bars to CSV bytes. The header is written even when empty.
pub fn encode(bars: &[Candle4h]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for bar in bars {
        writer.serialize(CacheRow::from(bar))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Parse and validate CSV bytes written by [`encode`].
pub fn decode(bytes: &[u8], anchor: WindowAnchor) -> Result<CacheEntry, FormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader.headers().map_err(|e| FormatError::Row {
        row: 1,
        reason: e.to_string(),
    })?;
    if headers.iter().ne(HEADER) {
        return Err(FormatError::Header {
            found: headers.iter().map(str::to_string).collect(),
        });
    }

    let mut bars: Vec<Candle4h> = Vec::new();
    for (i, row) in reader.deserialize::<CacheRow>().enumerate() {
        let line = i as u64 + 2;
        let bad = |reason: String| FormatError::Row { row: line, reason };

        let row = row.map_err(|e| bad(e.to_string()))?;
        let period_start = DateTime::parse_from_rfc3339(&row.period_start)
            .map_err(|e| bad(format!("period_start {:?}: {e}", row.period_start)))?
            .with_timezone(&Utc);

        if !anchor.is_window_start(period_start) {
            return Err(bad(format!(
                "period_start {period_start} is not a window boundary for offset {} min",
                anchor.offset_minutes()
            )));
        }
        if let Some(prev) = bars.last() {
            if period_start <= prev.period_start {
                return Err(bad(format!(
                    "period_start {period_start} does not follow {}",
                    prev.period_start
                )));
            }
        }
        if row.volume.is_sign_negative() {
            return Err(bad(format!("negative volume {}", row.volume)));
        }

        bars.push(Candle4h {
            period_start,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            record_count: FULL_WINDOW_COUNT,
        });
    }

    // Ordering was checked row by row above.
    CacheEntry::from_sorted(bars).map_err(|ts| FormatError::Row {
        row: 0,
        reason: format!("unordered period_start {ts}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(h: u32) -> Candle4h {
        Candle4h {
            period_start: Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap(),
            open: dec!(100.5),
            high: dec!(103),
            low: dec!(99.25),
            close: dec!(102),
            volume: dec!(1234.5),
            record_count: FULL_WINDOW_COUNT,
        }
    }

    #[test]
    fn encodes_documented_layout() {
        let bytes = encode(&[bar(0)]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "period_start,open,high,low,close,volume\n\
             2024-03-01T00:00:00Z,100.5,103,99.25,102,1234.5\n"
        );
    }

    #[test]
    fn empty_entry_keeps_header() {
        let bytes = encode(&[]).unwrap();
        assert_eq!(bytes, b"period_start,open,high,low,close,volume\n");
        assert!(decode(&bytes, WindowAnchor::UTC).unwrap().is_empty());
    }

    #[test]
    fn decode_reads_back_values() {
        let bytes = encode(&[bar(0), bar(4)]).unwrap();
        let entry = decode(&bytes, WindowAnchor::UTC).unwrap();
        assert_eq!(entry.bars(), &[bar(0), bar(4)]);
    }

    #[test]
    fn rejects_wrong_header() {
        let err = decode(b"time,o,h,l,c,v\n", WindowAnchor::UTC).unwrap_err();
        assert!(matches!(err, FormatError::Header { .. }));
    }

    #[test]
    fn rejects_unordered_rows() {
        let text = "period_start,open,high,low,close,volume\n\
                    2024-03-01T04:00:00Z,1,1,1,1,1\n\
                    2024-03-01T00:00:00Z,1,1,1,1,1\n";
        let err = decode(text.as_bytes(), WindowAnchor::UTC).unwrap_err();
        assert!(matches!(err, FormatError::Row { row: 3, .. }));
    }

    #[test]
    fn rejects_rows_off_the_anchor_grid() {
        let text = "period_start,open,high,low,close,volume\n\
                    2024-03-01T02:00:00Z,1,1,1,1,1\n";
        assert!(decode(text.as_bytes(), WindowAnchor::UTC).is_err());
        let utc2 = WindowAnchor::from_offset_minutes(120).unwrap();
        assert!(decode(text.as_bytes(), utc2).is_ok());
    }

    #[test]
    fn rejects_garbage_numbers_and_negative_volume() {
        let text = "period_start,open,high,low,close,volume\n\
                    2024-03-01T00:00:00Z,abc,1,1,1,1\n";
        assert!(decode(text.as_bytes(), WindowAnchor::UTC).is_err());
        let text = "period_start,open,high,low,close,volume\n\
                    2024-03-01T00:00:00Z,1,1,1,1,-1\n";
        assert!(decode(text.as_bytes(), WindowAnchor::UTC).is_err());
    }
}
