//! Directory of per-symbol 15-minute CSV files.
//!
//! Layout: `{dir}/{SYMBOL}.csv` with header
//! `timestamp,open,high,low,close,volume`, RFC 3339 timestamps and plain
//! decimal text. A missing file means "no records yet".

use super::{RawRecordSource, SourceError};
use crate::domain::{validate_symbol, Candle15m};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct CsvSource {
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn symbol_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.csv"))
    }

    fn read_all(&self, path: &Path) -> Result<Vec<Candle15m>, SourceError> {
        let mut reader = match ::csv::Reader::from_path(path) {
            Ok(reader) => reader,
            Err(e) => {
                return match e.into_kind() {
                    ::csv::ErrorKind::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                        Ok(Vec::new())
                    }
                    ::csv::ErrorKind::Io(io_err) => Err(SourceError::Io {
                        path: path.to_path_buf(),
                        source: io_err,
                    }),
                    other => Err(SourceError::MalformedRecord {
                        path: path.to_path_buf(),
                        reason: format!("{other:?}"),
                    }),
                };
            }
        };

        let mut records = Vec::new();
        for row in reader.deserialize::<Candle15m>() {
            let record = row.map_err(|e| SourceError::MalformedRecord {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl RawRecordSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        validate_symbol(symbol)?;
        let path = self.symbol_path(symbol);
        let mut records: Vec<Candle15m> = self
            .read_all(&path)?
            .into_iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .collect();
        // Stable sort keeps duplicates adjacent and in file order.
        records.sort_by_key(|r| r.timestamp);

        debug!(
            symbol,
            path = %path.display(),
            %start,
            %end,
            records = records.len(),
            "read 15m records from csv"
        );
        Ok(records)
    }
}
