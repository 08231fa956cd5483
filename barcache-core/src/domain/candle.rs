//! Candles: the raw 15-minute record and the derived 4-hour bar.

use super::window::{window_duration, RECORDS_PER_WINDOW};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw 15-minute OHLCV record as supplied by a raw source.
///
/// Prices and volume are carried as exact decimals; nothing in this crate
/// rounds them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle15m {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
}

/// Aggregated 4-hour bar covering `[period_start, period_start + 4h)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle4h {
    pub period_start: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Number of 15-minute records folded into this bar. Always 16.
    pub record_count: u32,
}

impl Candle4h {
    /// Exclusive end of the covered window. `None` only for a window that
    /// would end past the representable range.
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.period_start.checked_add_signed(window_duration())
    }

    /// OHLCV equality, ignoring decimal scale (`1.0 == 1.00`).
    ///
    /// Two bars for the same window that differ here indicate a raw-data
    /// revision upstream.
    pub fn same_values(&self, other: &Candle4h) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }

    /// Basic sanity: low <= open/close <= high, non-negative volume.
    pub fn is_sane(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && !self.volume.is_sign_negative()
    }
}

/// `record_count` value of every complete bar.
pub const FULL_WINDOW_COUNT: u32 = RECORDS_PER_WINDOW as u32;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_bar() -> Candle4h {
        Candle4h {
            period_start: Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap(),
            open: dec!(100.0),
            high: dec!(105.5),
            low: dec!(98.25),
            close: dec!(103.0),
            volume: dec!(1200),
            record_count: FULL_WINDOW_COUNT,
        }
    }

    #[test]
    fn period_end_crosses_midnight() {
        assert_eq!(
            sample_bar().period_end(),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn same_values_ignores_scale() {
        let a = sample_bar();
        let mut b = sample_bar();
        b.open = dec!(100.00);
        assert!(a.same_values(&b));
        b.close = dec!(103.01);
        assert!(!a.same_values(&b));
    }

    #[test]
    fn sanity_check() {
        assert!(sample_bar().is_sane());
        let mut bad = sample_bar();
        bad.low = dec!(101);
        assert!(!bad.is_sane());
    }

    #[test]
    fn json_keeps_decimal_text() {
        let json = serde_json::to_string(&sample_bar()).unwrap();
        assert!(json.contains("\"high\":\"105.5\""));
        let back: Candle4h = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_bar());
    }
}
