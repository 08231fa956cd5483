//! Integration tests for the on-disk 4h cache.

use barcache_core::cache::{CacheStore, Inspection, LockPolicy};
use barcache_core::domain::{Candle4h, WindowAnchor, FULL_WINDOW_COUNT};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fs;

fn day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn bar(window: i64, close: Decimal) -> Candle4h {
    Candle4h {
        period_start: day() + Duration::hours(4 * window),
        open: dec!(100.5),
        high: dec!(103),
        low: dec!(99.25),
        close,
        volume: dec!(1234.5),
        record_count: FULL_WINDOW_COUNT,
    }
}

#[test]
fn merging_twice_leaves_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    let bars: Vec<_> = (0..6).map(|w| bar(w, dec!(102))).collect();

    store.merge("BTCUSDT", &bars).unwrap();
    let path = store.dir().join("BTCUSDT.csv");
    let first = fs::read(&path).unwrap();

    let report = store.merge("BTCUSDT", &bars).unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.unchanged, 6);
    assert_eq!(fs::read(&path).unwrap(), first);
}

#[test]
fn fresh_store_reads_back_merged_bars() {
    let dir = tempfile::tempdir().unwrap();
    let bars = vec![
        bar(0, dec!(101.123456789)),
        bar(1, dec!(0.00000001)),
        bar(5, dec!(98765432.1)),
    ];
    CacheStore::new(dir.path()).merge("ETHUSDT", &bars).unwrap();

    let loaded = CacheStore::new(dir.path()).load("ETHUSDT").unwrap();
    assert!(loaded.quarantined.is_none());
    assert_eq!(loaded.entry.bars(), bars.as_slice());
}

#[test]
fn file_is_plain_csv() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    store.merge("BTCUSDT", &[bar(0, dec!(102))]).unwrap();

    let text = fs::read_to_string(dir.path().join("4h").join("BTCUSDT.csv")).unwrap();
    assert_eq!(
        text,
        "period_start,open,high,low,close,volume\n\
         2024-03-01T00:00:00Z,100.5,103,99.25,102,1234.5\n"
    );
}

#[test]
fn correction_replaces_without_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    store.merge("BTCUSDT", &[bar(0, dec!(102)), bar(1, dec!(104))]).unwrap();

    let report = store.merge("BTCUSDT", &[bar(1, dec!(104.5))]).unwrap();
    assert_eq!(report.corrections.len(), 1);
    assert_eq!(report.corrections[0].previous.close, dec!(104));
    assert_eq!(report.corrections[0].replacement.close, dec!(104.5));

    let loaded = store.load("BTCUSDT").unwrap();
    assert_eq!(loaded.entry.len(), 2);
    assert_eq!(loaded.entry.bars()[1].close, dec!(104.5));
}

#[test]
fn corrupt_file_is_rebuilt_by_next_merge() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    fs::create_dir_all(store.dir()).unwrap();
    fs::write(
        store.dir().join("BTCUSDT.csv"),
        "period_start,open,high,low,close,volume\n2024-03-01T00:00:00Z,1,2\n",
    )
    .unwrap();

    let report = store.merge("BTCUSDT", &[bar(2, dec!(102))]).unwrap();
    let quarantined = report.quarantined.expect("corrupt file should be quarantined");
    assert!(quarantined.is_file());
    assert_eq!(report.inserted, 1);

    let loaded = store.load("BTCUSDT").unwrap();
    assert_eq!(loaded.entry.bars(), &[bar(2, dec!(102))]);
    assert!(loaded.quarantined.is_none());
}

#[test]
fn inspect_reports_corruption_without_moving_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    store.merge("ETHUSDT", &[bar(0, dec!(1))]).unwrap();
    let corrupt = store.dir().join("BTCUSDT.csv");
    fs::write(&corrupt, "garbage\n").unwrap();

    assert!(matches!(store.inspect("BTCUSDT").unwrap(), Inspection::Corrupt(_)));
    assert_eq!(fs::read_to_string(&corrupt).unwrap(), "garbage\n");
    assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 2);

    match store.inspect("ETHUSDT").unwrap() {
        Inspection::Valid(entry) => assert_eq!(entry.bars(), &[bar(0, dec!(1))]),
        other => panic!("expected a valid entry, got {other:?}"),
    }
    assert!(matches!(store.inspect("XRPUSDT").unwrap(), Inspection::Missing));
}

#[test]
fn anchor_change_quarantines_old_grid() {
    let dir = tempfile::tempdir().unwrap();
    CacheStore::new(dir.path())
        .merge("BTCUSDT", &[bar(0, dec!(102))])
        .unwrap();

    let shifted = CacheStore::new(dir.path())
        .with_anchor(WindowAnchor::from_offset_minutes(120).unwrap());
    let loaded = shifted.load("BTCUSDT").unwrap();
    assert!(loaded.entry.is_empty());
    assert!(loaded.quarantined.is_some());
}

#[test]
fn symbols_lists_only_cache_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path());
    store.merge("ETHUSDT", &[bar(0, dec!(1))]).unwrap();
    store.merge("BTCUSDT", &[bar(0, dec!(1))]).unwrap();
    fs::write(store.dir().join("XRPUSDT.csv.corrupt-1"), "x").unwrap();
    fs::write(store.dir().join("notes.txt"), "x").unwrap();

    assert_eq!(store.symbols().unwrap(), vec!["BTCUSDT", "ETHUSDT"]);
}

#[test]
fn held_lock_file_is_contention() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path()).with_lock_policy(LockPolicy {
        retries: 1,
        backoff: std::time::Duration::from_millis(1),
        stale_after: std::time::Duration::from_secs(3600),
    });
    fs::create_dir_all(store.dir()).unwrap();
    fs::write(store.dir().join("BTCUSDT.lock"), "pid=0").unwrap();

    let err = store.merge("BTCUSDT", &[bar(0, dec!(1))]).unwrap_err();
    assert!(matches!(
        err,
        barcache_core::CacheError::LockContention { attempts: 2, .. }
    ));
    assert!(!store.dir().join("BTCUSDT.csv").exists());
}
