//! Durable per-symbol store of 4-hour bars.
//!
//! Layout: `{cache_dir}/4h/{SYMBOL}.csv`, one file per symbol, replaced
//! atomically on every changing merge. Corrupt files are renamed to
//! `{SYMBOL}.csv.corrupt-{unix_millis}` and treated as empty.

pub mod entry;
pub mod format;
pub mod lock;
pub mod store;

pub use entry::{CacheEntry, Correction, MergeOutcome};
pub use lock::LockPolicy;
pub use store::{CacheStore, FileStamp, Inspection, Loaded, MergeReport};

use crate::domain::SymbolError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),

    #[error("refusing to merge bars for {symbol}: {reason}")]
    InvalidBars { symbol: String, reason: String },

    #[error("could not lock {symbol} after {attempts} attempts")]
    LockContention { symbol: String, attempts: u32 },

    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache file: {0}")]
    Encode(#[from] csv::Error),
}
