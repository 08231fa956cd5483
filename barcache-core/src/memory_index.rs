//! Process-lifetime read-through cache in front of [`CacheStore::load`].
//!
//! The store stays authoritative: a slot is served only while its stamp
//! matches the file currently on disk, so writes by another process or
//! another store instance invalidate it.
//!
//! [`CacheStore::load`]: crate::cache::CacheStore::load

use crate::cache::{CacheEntry, FileStamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Slot {
    stamp: Option<FileStamp>,
    entry: Arc<CacheEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    slots: RwLock<HashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached entry if it was recorded at `stamp`. A mismatched slot is
    /// dropped.
    pub fn get(&self, symbol: &str, stamp: Option<FileStamp>) -> Option<Arc<CacheEntry>> {
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            match slots.get(symbol) {
                Some(slot) if slot.stamp == stamp => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(&slot.entry));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.get(symbol).is_some_and(|slot| slot.stamp != stamp) {
            slots.remove(symbol);
        }
        None
    }

    pub fn put(&self, symbol: &str, stamp: Option<FileStamp>, entry: Arc<CacheEntry>) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), Slot { stamp, entry });
    }

    pub fn invalidate(&self, symbol: &str) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol);
    }

    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .slots
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}
