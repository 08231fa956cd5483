//! Barcache Core: 15-minute → 4-hour candle aggregation with a durable cache.
//!
//! This crate contains:
//! - Domain types (candles, window anchoring, symbol validation)
//! - The aggregator (strict 16-slot completeness, parallel window folding)
//! - The per-symbol CSV cache store with atomic writes and quarantine
//! - A memory index validated against cache file stamps
//! - The aggregation service that gap-fills from a raw record source
//! - Raw sources (CSV directory, price-history REST API, in-memory)

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod domain;
pub mod memory_index;
pub mod service;
pub mod source;
pub mod streak;

pub use aggregate::{aggregate, AggregateError, Aggregation};
pub use cache::{CacheEntry, CacheError, CacheStore, Correction, FileStamp, MergeReport};
pub use config::{AppConfig, ConfigError};
pub use domain::{Candle15m, Candle4h, WindowAnchor};
pub use memory_index::MemoryIndex;
pub use service::{AggregationService, Clock, FixedClock, QueryError, QueryIssue, QueryResult};
pub use source::{RawRecordSource, SourceError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: shared types are Send + Sync so a service can be
    /// queried from several threads.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Candle15m>();
        require_sync::<Candle15m>();
        require_send::<Candle4h>();
        require_sync::<Candle4h>();
        require_send::<CacheEntry>();
        require_sync::<CacheEntry>();

        require_send::<CacheStore>();
        require_sync::<CacheStore>();
        require_send::<MemoryIndex>();
        require_sync::<MemoryIndex>();
        require_send::<AggregationService>();
        require_sync::<AggregationService>();

        require_send::<source::CsvSource>();
        require_sync::<source::CsvSource>();
        require_send::<source::HttpSource>();
        require_sync::<source::HttpSource>();
        require_send::<source::MemorySource>();
        require_sync::<source::MemorySource>();
    }
}
