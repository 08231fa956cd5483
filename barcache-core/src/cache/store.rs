use super::entry::{CacheEntry, Correction};
use super::format;
use super::lock::{LockFile, LockPolicy, SymbolLocks};
use super::CacheError;
use crate::config::CacheConfig;
use crate::domain::{validate_symbol, Candle4h, WindowAnchor, FULL_WINDOW_COUNT};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Subdirectory for this resolution, so other resolutions can live beside it.
const RESOLUTION_DIR: &str = "4h";

/// Cheap identity of a cache file: length and modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub len: u64,
    pub modified: SystemTime,
}

impl FileStamp {
    fn from_metadata(meta: &fs::Metadata) -> Option<Self> {
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok()?,
        })
    }
}

/// Result of [`CacheStore::load`].
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub entry: CacheEntry,
    /// Stamp of the file the entry was read from; `None` if no file.
    pub stamp: Option<FileStamp>,
    /// Where a corrupt file was moved, if one was found.
    pub quarantined: Option<PathBuf>,
}

/// Result of [`CacheStore::inspect`].
#[derive(Debug)]
pub enum Inspection {
    Missing,
    Valid(CacheEntry),
    Corrupt(format::FormatError),
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub inserted: usize,
    pub unchanged: usize,
    pub corrections: Vec<Correction>,
    pub quarantined: Option<PathBuf>,
    /// False when the merge changed nothing and the file was left alone.
    pub written: bool,
    pub entry: Arc<CacheEntry>,
    pub stamp: Option<FileStamp>,
}

pub struct CacheStore {
    root: PathBuf,
    anchor: WindowAnchor,
    policy: LockPolicy,
    locks: SymbolLocks,
    tmp_seq: AtomicU64,
}

impl CacheStore {
    /// Store rooted at `{cache_dir}/4h`, UTC anchor, default lock policy.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            root: cache_dir.as_ref().join(RESOLUTION_DIR),
            anchor: WindowAnchor::UTC,
            policy: LockPolicy::default(),
            locks: SymbolLocks::default(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn with_anchor(mut self, anchor: WindowAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn from_config(config: &CacheConfig, anchor: WindowAnchor) -> Self {
        Self::new(&config.dir)
            .with_anchor(anchor)
            .with_lock_policy(config.lock_policy())
    }

    /// Directory holding the per-symbol files.
    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn anchor(&self) -> WindowAnchor {
        self.anchor
    }

    fn data_path(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("{symbol}.csv"))
    }

    fn lock_path(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("{symbol}.lock"))
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Current stamp of the symbol's file, `None` if absent or unreadable.
    pub fn stamp(&self, symbol: &str) -> Option<FileStamp> {
        validate_symbol(symbol).ok()?;
        let meta = fs::metadata(self.data_path(symbol)).ok()?;
        FileStamp::from_metadata(&meta)
    }

    /// Bytes and metadata of the symbol's file, `None` if there is none.
    fn read_file(&self, path: &Path) -> Result<Option<(Vec<u8>, fs::Metadata)>, CacheError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(path)(e)),
        };
        // Stamp and bytes come from the same handle, so they describe the
        // same file even if a writer renames over the path meanwhile.
        let meta = file.metadata().map_err(Self::io_err(path))?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes).map_err(Self::io_err(path))?;
        Ok(Some((bytes, meta)))
    }

    /// Read the symbol's entry. A missing file is an empty entry; a corrupt
    /// one is quarantined and also yields an empty entry.
    pub fn load(&self, symbol: &str) -> Result<Loaded, CacheError> {
        validate_symbol(symbol)?;
        let path = self.data_path(symbol);
        let Some((bytes, meta)) = self.read_file(&path)? else {
            return Ok(Loaded::default());
        };

        match format::decode(&bytes, self.anchor) {
            Ok(entry) => {
                debug!(symbol, bars = entry.len(), "loaded cache entry");
                Ok(Loaded {
                    entry,
                    stamp: FileStamp::from_metadata(&meta),
                    quarantined: None,
                })
            }
            Err(e) => {
                let quarantined = self.quarantine(symbol, &path)?;
                warn!(
                    symbol,
                    error = %e,
                    quarantined = %quarantined.display(),
                    "corrupt cache file quarantined"
                );
                Ok(Loaded {
                    entry: CacheEntry::new(),
                    stamp: None,
                    quarantined: Some(quarantined),
                })
            }
        }
    }

    /// Like [`load`](Self::load) but never touches the file: a corrupt
    /// file is reported, not quarantined.
    pub fn inspect(&self, symbol: &str) -> Result<Inspection, CacheError> {
        validate_symbol(symbol)?;
        let Some((bytes, _)) = self.read_file(&self.data_path(symbol))? else {
            return Ok(Inspection::Missing);
        };
        Ok(match format::decode(&bytes, self.anchor) {
            Ok(entry) => Inspection::Valid(entry),
            Err(e) => Inspection::Corrupt(e),
        })
    }

    fn quarantine(&self, symbol: &str, path: &Path) -> Result<PathBuf, CacheError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let target = self.root.join(format!("{symbol}.csv.corrupt-{millis}"));
        fs::rename(path, &target).map_err(Self::io_err(path))?;
        Ok(target)
    }

    fn check_new_bars(&self, symbol: &str, bars: &[Candle4h]) -> Result<(), CacheError> {
        let invalid = |reason: String| CacheError::InvalidBars {
            symbol: symbol.to_string(),
            reason,
        };
        for (i, bar) in bars.iter().enumerate() {
            if !self.anchor.is_window_start(bar.period_start) {
                return Err(invalid(format!(
                    "{} is not a window boundary",
                    bar.period_start
                )));
            }
            if i > 0 && bar.period_start <= bars[i - 1].period_start {
                return Err(invalid(format!(
                    "{} is not after {}",
                    bar.period_start,
                    bars[i - 1].period_start
                )));
            }
            if bar.record_count != FULL_WINDOW_COUNT {
                return Err(invalid(format!(
                    "{} folds {} records",
                    bar.period_start, bar.record_count
                )));
            }
            if bar.volume.is_sign_negative() {
                return Err(invalid(format!("{} has negative volume", bar.period_start)));
            }
        }
        Ok(())
    }

    /// Fold `new_bars` into the symbol's entry and persist the result.
    ///
    /// Collisions with differing values replace the stored bar and are
    /// returned as corrections. Nothing is written when nothing changed.
    pub fn merge(&self, symbol: &str, new_bars: &[Candle4h]) -> Result<MergeReport, CacheError> {
        validate_symbol(symbol)?;
        self.check_new_bars(symbol, new_bars)?;
        fs::create_dir_all(&self.root).map_err(Self::io_err(&self.root))?;

        let symbol_lock = self.locks.for_symbol(symbol);
        let _thread_guard = symbol_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_guard = LockFile::acquire(&self.lock_path(symbol), symbol, &self.policy)?;

        let loaded = self.load(symbol)?;
        let (merged, outcome) = loaded.entry.merged_with(new_bars);

        for c in &outcome.corrections {
            warn!(
                symbol,
                period_start = %c.period_start,
                previous_close = %c.previous.close,
                replacement_close = %c.replacement.close,
                "cached bar corrected"
            );
        }

        let write = outcome.changed() || loaded.quarantined.is_some();
        let stamp = if write {
            let path = self.data_path(symbol);
            self.write_atomic(symbol, &path, &format::encode(merged.bars())?)?;
            info!(
                symbol,
                inserted = outcome.inserted,
                corrected = outcome.corrections.len(),
                bars = merged.len(),
                "cache entry written"
            );
            fs::metadata(&path)
                .ok()
                .and_then(|m| FileStamp::from_metadata(&m))
        } else {
            debug!(symbol, unchanged = outcome.unchanged, "merge changed nothing");
            loaded.stamp
        };

        Ok(MergeReport {
            inserted: outcome.inserted,
            unchanged: outcome.unchanged,
            corrections: outcome.corrections,
            quarantined: loaded.quarantined,
            written: write,
            entry: Arc::new(merged),
            stamp,
        })
    }

    /// Write to a unique temp file beside `path`, sync, then rename over it.
    fn write_atomic(&self, symbol: &str, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .root
            .join(format!("{symbol}.csv.tmp-{}-{seq}", std::process::id()));

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        result.map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CacheError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        })
    }

    /// Symbols with a cache file, sorted.
    pub fn symbols(&self) -> Result<Vec<String>, CacheError> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.root)(e)),
        };

        let mut symbols = Vec::new();
        for item in dir {
            let item = item.map_err(Self::io_err(&self.root))?;
            let name = item.file_name();
            let Some(symbol) = name.to_str().and_then(|n| n.strip_suffix(".csv")) else {
                continue;
            };
            if validate_symbol(symbol).is_ok() && item.path().is_file() {
                symbols.push(symbol.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}
