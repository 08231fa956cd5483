//! Query orchestration: cached bars first, gap-fill from the raw source,
//! merge, answer.
//!
//! `get_bars` only fails on caller mistakes (empty or unrepresentable range,
//! bad symbol).
//! Source and cache trouble degrades the answer instead: whatever is
//! cached is returned and the problem is listed in `QueryResult::issues`.

use crate::aggregate::{aggregate, AggregateError};
use crate::cache::{CacheEntry, CacheError, CacheStore, Correction, FileStamp};
use crate::config::{AppConfig, ConfigError};
use crate::domain::{validate_symbol, window_duration, Candle4h, SymbolError, WindowAnchor};
use crate::memory_index::MemoryIndex;
use crate::source::{self, RawRecordSource};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Source of "now". Windows ending after it are never fetched.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("empty range: start {start} is not before end {end}")]
    EmptyRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("range [{start}, {end}) cannot be padded to 4h windows within representable time")]
    RangeOutOfBounds {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),
}

/// Something that went wrong while answering, without failing the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryIssue {
    #[error("source unavailable for [{start}, {end}): {reason}")]
    SourceUnavailable {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reason: String,
    },

    #[error("raw data rejected: {0}")]
    RawData(AggregateError),

    #[error("corrupt cache file moved to {}", quarantined.display())]
    CacheCorrupted { quarantined: PathBuf },

    #[error("cache busy after {attempts} lock attempts; new bars not persisted")]
    WriteConflict { attempts: u32 },

    #[error("cache I/O failure: {reason}")]
    CacheIo { reason: String },

    #[error("bar at {} corrected", .0.period_start)]
    Correction(Correction),
}

impl QueryIssue {
    /// Corrections are informational; everything else means the answer
    /// may be missing bars it would otherwise contain.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, QueryIssue::Correction(_))
    }
}

/// One gap-fill fetch performed while answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub records: usize,
    pub bars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub symbol: String,
    /// Effective range after padding to window boundaries.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bars: Vec<Candle4h>,
    pub issues: Vec<QueryIssue>,
    pub fetched: Vec<FetchWindow>,
}

impl QueryResult {
    pub fn is_degraded(&self) -> bool {
        self.issues.iter().any(QueryIssue::is_degraded)
    }
}

pub struct AggregationService {
    source: Box<dyn RawRecordSource>,
    store: CacheStore,
    memory: Option<MemoryIndex>,
    clock: Box<dyn Clock>,
}

impl AggregationService {
    pub fn new(source: impl RawRecordSource + 'static, store: CacheStore) -> Self {
        Self {
            source: Box::new(source),
            store,
            memory: Some(MemoryIndex::new()),
            clock: Box::new(SystemClock),
        }
    }

    /// Every query goes to the store.
    pub fn without_memory_index(mut self) -> Self {
        self.memory = None;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let anchor = config.anchor()?;
        Ok(Self {
            source: source::from_config(&config.source)?,
            store: CacheStore::from_config(&config.cache, anchor),
            memory: config.service.memory_index.then(MemoryIndex::new),
            clock: Box::new(SystemClock),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn memory(&self) -> Option<&MemoryIndex> {
        self.memory.as_ref()
    }

    pub fn anchor(&self) -> WindowAnchor {
        self.store.anchor()
    }

    /// Bars whose `period_start` lies in `[start, end)` padded outward to
    /// window boundaries.
    pub fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<QueryResult, QueryError> {
        validate_symbol(symbol)?;
        if start >= end {
            return Err(QueryError::EmptyRange { start, end });
        }

        let anchor = self.anchor();
        let (eff_start, eff_end) = match (anchor.window_start(start), anchor.window_ceil(end)) {
            (Some(eff_start), Some(eff_end)) => (eff_start, eff_end),
            _ => return Err(QueryError::RangeOutOfBounds { start, end }),
        };
        let mut issues = Vec::new();
        let mut fetched = Vec::new();

        let mut entry = self.cached_entry(symbol, &mut issues);

        let now = self.clock.now();
        let missing: Vec<DateTime<Utc>> = anchor
            .windows_between(eff_start, eff_end)
            .filter(|w| {
                w.checked_add_signed(window_duration())
                    .is_some_and(|closes| closes <= now)
                    && !entry.contains(*w)
            })
            .collect();

        let mut new_bars = Vec::new();
        for (run_start, run_end) in contiguous_runs(&missing) {
            if let Some(window) = self.fill_run(symbol, run_start, run_end, &mut new_bars, &mut issues) {
                fetched.push(window);
            }
        }

        if !new_bars.is_empty() {
            entry = self.persist(symbol, &entry, &new_bars, &mut issues);
        }

        let bars = entry.range(eff_start, eff_end).to_vec();
        debug!(
            symbol,
            start = %eff_start,
            end = %eff_end,
            bars = bars.len(),
            fetched = fetched.len(),
            issues = issues.len(),
            "answered bar query"
        );

        Ok(QueryResult {
            symbol: symbol.to_string(),
            start: eff_start,
            end: eff_end,
            bars,
            issues,
            fetched,
        })
    }

    /// Entry from the memory index if still current, otherwise from disk.
    fn cached_entry(&self, symbol: &str, issues: &mut Vec<QueryIssue>) -> Arc<CacheEntry> {
        if let Some(memory) = &self.memory {
            if let Some(entry) = memory.get(symbol, self.store.stamp(symbol)) {
                return entry;
            }
        }

        match self.store.load(symbol) {
            Ok(loaded) => {
                if let Some(quarantined) = loaded.quarantined {
                    issues.push(QueryIssue::CacheCorrupted { quarantined });
                }
                let entry = Arc::new(loaded.entry);
                self.remember(symbol, loaded.stamp, &entry);
                entry
            }
            Err(e) => {
                warn!(symbol, error = %e, "cache load failed; treating as empty");
                issues.push(QueryIssue::CacheIo {
                    reason: e.to_string(),
                });
                Arc::new(CacheEntry::new())
            }
        }
    }

    fn remember(&self, symbol: &str, stamp: Option<FileStamp>, entry: &Arc<CacheEntry>) {
        if let Some(memory) = &self.memory {
            memory.put(symbol, stamp, Arc::clone(entry));
        }
    }

    /// Fetch and aggregate one run of missing windows. Returns `None` when
    /// the source could not be asked or refused.
    fn fill_run(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        new_bars: &mut Vec<Candle4h>,
        issues: &mut Vec<QueryIssue>,
    ) -> Option<FetchWindow> {
        let unavailable = |reason: String| QueryIssue::SourceUnavailable { start, end, reason };

        if !self.source.is_available() {
            issues.push(unavailable(format!("{} is not accepting requests", self.source.name())));
            return None;
        }

        let mut records = match self.source.fetch(symbol, start, end) {
            Ok(records) => records,
            Err(e) => {
                warn!(symbol, %start, %end, error = %e, "gap-fill fetch failed");
                issues.push(unavailable(e.to_string()));
                return None;
            }
        };
        records.retain(|r| r.timestamp >= start && r.timestamp < end);

        let aggregation = match aggregate(symbol, &records, self.anchor()) {
            Ok(aggregation) => aggregation,
            Err(e) => {
                warn!(symbol, error = %e, "raw records rejected");
                issues.push(QueryIssue::RawData(e));
                return Some(FetchWindow {
                    start,
                    end,
                    records: records.len(),
                    bars: 0,
                });
            }
        };

        for rejected in aggregation.rejected {
            warn!(symbol, error = %rejected, "window aborted");
            issues.push(QueryIssue::RawData(rejected));
        }

        debug!(symbol, %start, %end, records = records.len(), bars = aggregation.bars.len(), "gap filled");
        let window = FetchWindow {
            start,
            end,
            records: records.len(),
            bars: aggregation.bars.len(),
        };
        new_bars.extend(aggregation.bars);
        Some(window)
    }

    /// Merge new bars into the store. If the store refuses, the answer still
    /// includes them but nothing is persisted.
    fn persist(
        &self,
        symbol: &str,
        cached: &CacheEntry,
        new_bars: &[Candle4h],
        issues: &mut Vec<QueryIssue>,
    ) -> Arc<CacheEntry> {
        match self.store.merge(symbol, new_bars) {
            Ok(report) => {
                if let Some(quarantined) = report.quarantined {
                    issues.push(QueryIssue::CacheCorrupted { quarantined });
                }
                issues.extend(report.corrections.into_iter().map(QueryIssue::Correction));
                self.remember(symbol, report.stamp, &report.entry);
                report.entry
            }
            Err(e) => {
                warn!(symbol, error = %e, "merge failed; serving unpersisted bars");
                issues.push(match e {
                    CacheError::LockContention { attempts, .. } => {
                        QueryIssue::WriteConflict { attempts }
                    }
                    other => QueryIssue::CacheIo {
                        reason: other.to_string(),
                    },
                });
                if let Some(memory) = &self.memory {
                    memory.invalidate(symbol);
                }
                Arc::new(cached.merged_with(new_bars).0)
            }
        }
    }
}

/// Group ascending window starts into maximal `[start, end)` runs.
fn contiguous_runs(windows: &[DateTime<Utc>]) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut runs: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for &w in windows {
        let Some(w_end) = w.checked_add_signed(window_duration()) else {
            continue;
        };
        match runs.last_mut() {
            Some((_, end)) if *end == w => *end = w_end,
            _ => runs.push((w, w_end)),
        }
    }
    runs
}
