//! In-memory form of one symbol's cached history.

use crate::domain::Candle4h;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A bar replaced because the raw data for its window changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub period_start: DateTime<Utc>,
    pub previous: Candle4h,
    pub replacement: Candle4h,
}

/// Counts from folding new bars into an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub unchanged: usize,
    pub corrections: Vec<Correction>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || !self.corrections.is_empty()
    }
}

/// Bars for one symbol, strictly increasing by `period_start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    bars: Vec<Candle4h>,
}

impl CacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap bars that are already strictly increasing. Returns the offending
    /// `period_start` otherwise.
    pub fn from_sorted(bars: Vec<Candle4h>) -> Result<Self, DateTime<Utc>> {
        if let Some(pair) = bars.windows(2).find(|w| w[0].period_start >= w[1].period_start) {
            return Err(pair[1].period_start);
        }
        Ok(Self { bars })
    }

    pub fn bars(&self) -> &[Candle4h] {
        &self.bars
    }

    pub fn into_bars(self) -> Vec<Candle4h> {
        self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Candle4h> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Candle4h> {
        self.bars.last()
    }

    pub fn get(&self, period_start: DateTime<Utc>) -> Option<&Candle4h> {
        self.bars
            .binary_search_by_key(&period_start, |b| b.period_start)
            .ok()
            .map(|i| &self.bars[i])
    }

    pub fn contains(&self, period_start: DateTime<Utc>) -> bool {
        self.get(period_start).is_some()
    }

    /// Bars with `start <= period_start < end`.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle4h] {
        let lo = self.bars.partition_point(|b| b.period_start < start);
        let hi = self.bars.partition_point(|b| b.period_start < end);
        if lo >= hi {
            &[]
        } else {
            &self.bars[lo..hi]
        }
    }

    /// BLAKE3 digest over every bar's period and values, hex encoded.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for bar in &self.bars {
            hasher.update(&bar.period_start.timestamp().to_le_bytes());
            for value in [bar.open, bar.high, bar.low, bar.close, bar.volume] {
                hasher.update(value.normalize().to_string().as_bytes());
                hasher.update(b"|");
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Fold strictly increasing `new_bars` in. Last write wins on collisions.
    pub fn merged_with(&self, new_bars: &[Candle4h]) -> (CacheEntry, MergeOutcome) {
        let mut outcome = MergeOutcome::default();
        let mut merged = Vec::with_capacity(self.bars.len() + new_bars.len());
        let mut old = self.bars.iter().peekable();
        let mut new = new_bars.iter().peekable();

        loop {
            match (old.peek(), new.peek()) {
                (Some(o), Some(n)) if o.period_start < n.period_start => {
                    merged.push((*o).clone());
                    old.next();
                }
                (Some(o), Some(n)) if o.period_start > n.period_start => {
                    merged.push((*n).clone());
                    outcome.inserted += 1;
                    new.next();
                }
                (Some(o), Some(n)) => {
                    if o.same_values(n) {
                        merged.push((*o).clone());
                        outcome.unchanged += 1;
                    } else {
                        outcome.corrections.push(Correction {
                            period_start: n.period_start,
                            previous: (*o).clone(),
                            replacement: (*n).clone(),
                        });
                        merged.push((*n).clone());
                    }
                    old.next();
                    new.next();
                }
                (Some(o), None) => {
                    merged.push((*o).clone());
                    old.next();
                }
                (None, Some(n)) => {
                    merged.push((*n).clone());
                    outcome.inserted += 1;
                    new.next();
                }
                (None, None) => break,
            }
        }

        (Self { bars: merged }, outcome)
    }
}
