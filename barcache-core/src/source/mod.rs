//! Raw 15-minute record sources.
//!
//! The `RawRecordSource` trait abstracts over where 15-minute candles come
//! from (CSV files, a price-history REST API, memory) so the aggregation
//! service can be pointed at any of them and mocked in tests. Sources know
//! nothing about aggregation or the 4h cache.

pub mod circuit_breaker;
pub mod csv_dir;
pub mod http;
pub mod memory;

pub use circuit_breaker::CircuitBreaker;
pub use csv_dir::CsvSource;
pub use http::{HttpSource, HttpSourceConfig};
pub use memory::MemorySource;

use crate::config::SourceConfig;
use crate::domain::{Candle15m, SymbolError};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors from raw sources. Any of these makes the service skip gap-fill
/// for the affected range and serve cached bars instead.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("HTTP {status} fetching {symbol}")]
    HttpStatus { status: u16, symbol: String },

    #[error("source rejected request: code {code}: {message}")]
    Api { code: String, message: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {path}: {reason}")]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("source error: {0}")]
    Other(String),
}

/// Read-only supplier of 15-minute candles.
pub trait RawRecordSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Records for `symbol` with `start <= timestamp < end`, ascending.
    ///
    /// May return fewer records than the range implies; upstream gaps are
    /// normal. Duplicates are passed through untouched so the aggregator
    /// can flag them.
    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError>;

    /// False while the source is known to refuse requests.
    fn is_available(&self) -> bool {
        true
    }
}

impl<T: RawRecordSource + ?Sized> RawRecordSource for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        (**self).fetch(symbol, start, end)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

impl<T: RawRecordSource + ?Sized> RawRecordSource for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        (**self).fetch(symbol, start, end)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Build the source described by `config`.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn RawRecordSource>, SourceError> {
    match config {
        SourceConfig::Csv { dir } => Ok(Box::new(CsvSource::new(dir.clone()))),
        SourceConfig::Http(http) => {
            let breaker = Arc::new(CircuitBreaker::default_source());
            Ok(Box::new(HttpSource::new(http.clone(), breaker)?))
        }
    }
}
