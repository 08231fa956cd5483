//! In-process source backed by a map of symbol → records.

use super::{RawRecordSource, SourceError};
use crate::domain::Candle15m;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct MemorySource {
    records: RwLock<HashMap<String, Vec<Candle15m>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records for `symbol`, keeping the per-symbol list ascending.
    pub fn insert(&self, symbol: &str, records: impl IntoIterator<Item = Candle15m>) {
        let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let list = map.entry(symbol.to_string()).or_default();
        list.extend(records);
        list.sort_by_key(|r| r.timestamp);
    }

    /// Replace the record at `timestamp` (simulates an upstream correction).
    pub fn replace(&self, symbol: &str, record: Candle15m) -> bool {
        let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = map.get_mut(symbol) else {
            return false;
        };
        match list.iter_mut().find(|r| r.timestamp == record.timestamp) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .map_or(0, Vec::len)
    }
}

impl RawRecordSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(symbol)
            .map(|list| {
                list.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
