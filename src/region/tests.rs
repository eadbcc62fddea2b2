use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::tempdir;

use super::info::{RegionInfo, RegionState};
use super::split::{merge_regions, split_region};
use super::*;
use crate::cache::BlockCache;
use crate::cell::{Cell, CellType};
use crate::config::{EngineConfig, FamilyConfig};
use crate::fs;
use crate::hooks::{ObserverChain, ObserverContext, RegionObserver};
use crate::wal::{Durability, Wal, WalReplayer};

struct Fixture {
    _dir: tempfile::TempDir,
    config: Arc<EngineConfig>,
    cache: Arc<BlockCache>,
    wal: Arc<Wal>,
    memory: Arc<MemoryAccountant>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let config = Arc::new(EngineConfig::new(dir.path()));
        let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), config.wal_roll_size).unwrap());
        Self {
            _dir: dir,
            config,
            cache: Arc::new(BlockCache::new(8 << 20)),
            wal,
            memory: Arc::new(MemoryAccountant::new(1 << 30)),
        }
    }

    fn create_region(&self, info: RegionInfo, hooks: ObserverChain) -> Arc<Region> {
        Region::create(
            info,
            vec![FamilyConfig::new("f").max_versions(u32::MAX)],
            self.config.clone(),
            self.cache.clone(),
            self.wal.clone(),
            self.memory.clone(),
            hooks,
        )
        .unwrap()
    }

    fn whole_table_region(&self) -> Arc<Region> {
        self.create_region(
            RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1),
            ObserverChain::new(false),
        )
    }
}

fn put(region: &Arc<Region>, row: &str, qual: &str, ts: u64, value: &str) {
    region
        .put(
            row.as_bytes(),
            vec![Cell::put(row, "f", qual, ts, value)],
            Durability::SyncWal,
        )
        .unwrap();
}

fn get_values(region: &Arc<Region>, row: &str, qual: &str) -> Vec<Vec<u8>> {
    region
        .get(
            row.as_bytes(),
            &GetOptions {
                qualifier: Some(qual.as_bytes().to_vec()),
                max_versions: u32::MAX,
                ..Default::default()
            },
        )
        .unwrap()
        .into_iter()
        .map(|c| c.value)
        .collect()
}

fn count_rows(region: &Arc<Region>) -> usize {
    let mut scanner = region.scan(ScanOptions::default()).unwrap();
    let mut count = 0;
    loop {
        let rows = region.scanner_next(&mut scanner, 64).unwrap();
        if rows.is_empty() {
            break;
        }
        count += rows.len();
    }
    count
}

#[test]
fn test_put_get_read_your_writes() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    put(&region, "row1", "q", 10, "hello");
    assert_eq!(get_values(&region, "row1", "q"), vec![b"hello".to_vec()]);
    assert!(get_values(&region, "row2", "q").is_empty());
    assert!(region.exists(b"row1").unwrap());
    assert!(!region.exists(b"row2").unwrap());
}

#[test]
fn test_multi_cell_put_is_atomic_per_row() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    region
        .put(
            b"row1",
            vec![
                Cell::put("row1", "f", "q1", 1, "a"),
                Cell::put("row1", "f", "q2", 1, "b"),
            ],
            Durability::SyncWal,
        )
        .unwrap();

    let cells = region
        .get(b"row1", &GetOptions {
            max_versions: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cells.len(), 2);

    // A mutation mixing rows is rejected whole.
    let result = region.put(
        b"row1",
        vec![
            Cell::put("row1", "f", "q1", 2, "x"),
            Cell::put("row2", "f", "q1", 2, "y"),
        ],
        Durability::SyncWal,
    );
    assert!(result.is_err());
    assert_eq!(get_values(&region, "row1", "q1"), vec![b"a".to_vec()]);
}

#[test]
fn test_delete_semantics() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    let t = 1000u64;

    // Three versions, newest first on read.
    put(&region, "r", "r", t, "v1");
    put(&region, "r", "r", t + 1, "v2");
    put(&region, "r", "r", t + 2, "v3");
    assert_eq!(
        get_values(&region, "r", "r"),
        vec![b"v3".to_vec(), b"v2".to_vec(), b"v1".to_vec()]
    );

    // Delete-Cell at t masks exactly v1.
    region
        .delete(
            b"r",
            vec![Cell::delete("r", "f", "r", t, CellType::Delete)],
            Durability::SyncWal,
        )
        .unwrap();
    assert_eq!(
        get_values(&region, "r", "r"),
        vec![b"v3".to_vec(), b"v2".to_vec()]
    );

    // Delete-Column at t+2 masks everything at or below.
    region
        .delete(
            b"r",
            vec![Cell::delete("r", "f", "r", t + 2, CellType::DeleteColumn)],
            Durability::SyncWal,
        )
        .unwrap();
    assert!(get_values(&region, "r", "r").is_empty());
}

#[test]
fn test_delete_family() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    put(&region, "r", "q1", 5, "a");
    put(&region, "r", "q2", 5, "b");
    put(&region, "r", "q2", 9, "survives");

    region
        .delete(
            b"r",
            vec![Cell::delete("r", "f", "", 7, CellType::DeleteFamily)],
            Durability::SyncWal,
        )
        .unwrap();

    let cells = region
        .get(b"r", &GetOptions {
            max_versions: u32::MAX,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].value, b"survives");
}

#[test]
fn test_deletes_apply_across_flush_boundaries() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    put(&region, "r", "q", 10, "old");
    region.flush().unwrap();
    region
        .delete(
            b"r",
            vec![Cell::delete("r", "f", "q", 10, CellType::Delete)],
            Durability::SyncWal,
        )
        .unwrap();

    assert!(get_values(&region, "r", "q").is_empty());
    region.flush().unwrap();
    assert!(get_values(&region, "r", "q").is_empty());
}

#[test]
fn test_batch_partial_failures() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    let results = region.batch(vec![
        Mutation {
            row: b"row1".to_vec(),
            cells: vec![Cell::put("row1", "f", "q", 1, "ok")],
            durability: Durability::SyncWal,
        },
        Mutation {
            row: b"row2".to_vec(),
            cells: vec![Cell::put("row2", "nope", "q", 1, "bad family")],
            durability: Durability::SyncWal,
        },
        Mutation {
            row: b"row3".to_vec(),
            cells: vec![Cell::put("row3", "f", "q", 1, "ok")],
            durability: Durability::SyncWal,
        },
    ]);

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::NoSuchFamily(_))));
    assert!(results[2].is_ok());

    assert_eq!(get_values(&region, "row1", "q"), vec![b"ok".to_vec()]);
    assert!(get_values(&region, "row2", "q").is_empty());
    assert_eq!(get_values(&region, "row3", "q"), vec![b"ok".to_vec()]);
}

#[test]
fn test_check_and_mutate() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    put(&region, "r", "q", 1, "alpha");

    let mutation = |value: &str| Mutation {
        row: b"r".to_vec(),
        cells: vec![Cell::put("r", "f", "q", 2, value)],
        durability: Durability::SyncWal,
    };

    // Wrong expectation fails and mutates nothing.
    let passed = region
        .check_and_mutate(b"r", b"f", b"q", CompareOp::Equal, b"beta", mutation("x"))
        .unwrap();
    assert!(!passed);
    assert_eq!(get_values(&region, "r", "q"), vec![b"alpha".to_vec()]);

    // Matching expectation applies the mutation.
    let passed = region
        .check_and_mutate(b"r", b"f", b"q", CompareOp::Equal, b"alpha", mutation("beta"))
        .unwrap();
    assert!(passed);
    assert_eq!(get_values(&region, "r", "q")[0], b"beta");

    // Ordering comparators work on raw bytes.
    let passed = region
        .check_and_mutate(b"r", b"f", b"q", CompareOp::Greater, b"alpha", mutation("gamma"))
        .unwrap();
    assert!(passed);

    assert_eq!(region.metrics.check_mutate_passed.load(Ordering::SeqCst), 2);
    assert_eq!(region.metrics.check_mutate_failed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_increment_and_append() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    let cells = region
        .increment(b"ctr", vec![(b"f".to_vec(), b"hits".to_vec(), 5)], Durability::SyncWal)
        .unwrap();
    assert_eq!(cells[0].value, 5i64.to_be_bytes());
    let cells = region
        .increment(b"ctr", vec![(b"f".to_vec(), b"hits".to_vec(), -2)], Durability::SyncWal)
        .unwrap();
    assert_eq!(cells[0].value, 3i64.to_be_bytes());

    // Increment on a non-numeric column is an input error.
    put(&region, "ctr", "text", 1, "words");
    assert!(matches!(
        region.increment(b"ctr", vec![(b"f".to_vec(), b"text".to_vec(), 1)], Durability::SyncWal),
        Err(Error::InvalidInput(_))
    ));

    region
        .append(
            b"log",
            vec![(b"f".to_vec(), b"line".to_vec(), b"hello ".to_vec())],
            Durability::SyncWal,
        )
        .unwrap();
    let cells = region
        .append(
            b"log",
            vec![(b"f".to_vec(), b"line".to_vec(), b"world".to_vec())],
            Durability::SyncWal,
        )
        .unwrap();
    assert_eq!(cells[0].value, b"hello world");
}

#[test]
fn test_state_errors() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    // Row outside the range.
    let bounded = fixture.create_region(
        RegionInfo::new("default", "t2", b"m".to_vec(), b"z".to_vec(), 2),
        ObserverChain::new(false),
    );
    assert!(matches!(
        bounded.put(b"a", vec![Cell::put("a", "f", "q", 1, "v")], Durability::SyncWal),
        Err(Error::InvalidInput(_))
    ));

    // Unknown family.
    assert!(matches!(
        region.put(b"r", vec![Cell::put("r", "ghost", "q", 1, "v")], Durability::SyncWal),
        Err(Error::NoSuchFamily(_))
    ));

    // Writes to a closed region.
    region.close().unwrap();
    assert_eq!(region.state(), RegionState::Closed);
    assert!(matches!(
        region.put(b"r", vec![Cell::put("r", "f", "q", 1, "v")], Durability::SyncWal),
        Err(Error::RegionNotOnline(_))
    ));
}

#[test]
fn test_scan_end_row_batch_and_reverse() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    for i in 0..10 {
        put(&region, &format!("row{i}"), "q1", 1, "a");
        put(&region, &format!("row{i}"), "q2", 1, "b");
    }

    // End row is exclusive.
    let mut scanner = region
        .scan(ScanOptions {
            start_row: b"row2".to_vec(),
            end_row: b"row5".to_vec(),
            ..Default::default()
        })
        .unwrap();
    let rows = region.scanner_next(&mut scanner, 100).unwrap();
    let names: Vec<Vec<u8>> = rows.iter().map(|r| r.row.clone()).collect();
    assert_eq!(names, vec![b"row2".to_vec(), b"row3".to_vec(), b"row4".to_vec()]);

    // Batch splits rows into cell chunks.
    let mut scanner = region
        .scan(ScanOptions {
            batch: Some(1),
            ..Default::default()
        })
        .unwrap();
    let chunks = region.scanner_next(&mut scanner, 4).unwrap();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.cells.len() == 1));

    // Reversed order.
    let mut scanner = region
        .scan(ScanOptions {
            reversed: true,
            ..Default::default()
        })
        .unwrap();
    let rows = region.scanner_next(&mut scanner, 3).unwrap();
    let names: Vec<Vec<u8>> = rows.iter().map(|r| r.row.clone()).collect();
    assert_eq!(names, vec![b"row9".to_vec(), b"row8".to_vec(), b"row7".to_vec()]);
}

#[test]
fn test_small_scan_does_not_cache_data_blocks() {
    let dir = tempdir().unwrap();
    let config = Arc::new(EngineConfig::new(dir.path()));
    let cache = Arc::new(BlockCache::new(8 << 20));
    let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), u64::MAX).unwrap());
    let region = Region::create(
        RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1),
        vec![FamilyConfig::new("f").block_size(256)],
        config,
        cache.clone(),
        wal,
        Arc::new(MemoryAccountant::new(1 << 30)),
        ObserverChain::new(false),
    )
    .unwrap();

    for i in 0..200 {
        put(&region, &format!("row{i:04}"), "q", 1, "some value payload");
    }
    region.flush().unwrap();

    let data_before = cache.count_category(crate::cache::BlockCategory::Data, None);
    let mut scanner = region
        .scan(ScanOptions {
            small: true,
            ..Default::default()
        })
        .unwrap();
    region.scanner_next(&mut scanner, 10).unwrap();
    assert_eq!(
        cache.count_category(crate::cache::BlockCategory::Data, None),
        data_before
    );
}

#[test]
fn test_skip_wal_tracked_separately() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    region
        .put(b"r1", vec![Cell::put("r1", "f", "q", 1, "durable")], Durability::SyncWal)
        .unwrap();
    assert_eq!(region.mutations_without_wal_size(), 0);

    region
        .put(b"r2", vec![Cell::put("r2", "f", "q", 1, "volatile")], Durability::SkipWal)
        .unwrap();
    assert!(region.mutations_without_wal_size() > 0);
}

#[test]
fn test_crash_recovery_replays_unflushed_edits() {
    let dir = tempdir().unwrap();
    let config = Arc::new(EngineConfig::new(dir.path()));
    let cache = Arc::new(BlockCache::new(8 << 20));
    let memory = Arc::new(MemoryAccountant::new(1 << 30));
    let info = RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1);
    let families = vec![FamilyConfig::new("f").max_versions(u32::MAX)];

    let wal_dir = fs::wals_dir(dir.path());
    {
        let wal = Arc::new(Wal::open(&wal_dir, u64::MAX).unwrap());
        let region = Region::create(
            info.clone(),
            families.clone(),
            config.clone(),
            cache.clone(),
            wal,
            memory.clone(),
            ObserverChain::new(false),
        )
        .unwrap();

        put(&region, "flushed", "q", 1, "on disk");
        region.flush().unwrap();
        put(&region, "resident1", "q", 1, "wal only");
        put(&region, "resident2", "q", 1, "wal only");
        // Crash: the region and wal are dropped without a close.
    }

    // Recovery: fresh WAL handle, re-open the region, replay every log
    // file in id order.
    let wal = Arc::new(Wal::open(&wal_dir, u64::MAX).unwrap());
    let region = Region::open(
        info,
        families,
        config,
        cache,
        wal.clone(),
        memory,
        ObserverChain::new(false),
    )
    .unwrap();

    let mut applied = 0;
    for path in wal.rolled_files().unwrap() {
        applied += region.replay_edits(WalReplayer::open(&path).unwrap()).unwrap();
    }
    // Already-flushed edits are skipped; the two resident rows return.
    assert_eq!(applied, 2);
    assert_eq!(count_rows(&region), 3);
    assert_eq!(get_values(&region, "resident1", "q"), vec![b"wal only".to_vec()]);

    // New writes sequence above the replayed ones.
    put(&region, "after", "q", 1, "new");
    assert_eq!(count_rows(&region), 4);
}

#[test]
fn test_split_lifecycle() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    for i in 0..100 {
        put(&region, &format!("row{i:03}"), "q", 1, "v");
    }

    let (a, b) = split_region(&region, b"row050".to_vec()).unwrap();

    // The parent is terminal and refuses writes.
    assert_eq!(region.state(), RegionState::Split);
    assert!(region.state().is_terminal());
    assert!(matches!(
        region.put(b"row001", vec![Cell::put("row001", "f", "q", 2, "x")], Durability::SyncWal),
        Err(Error::RegionNotOnline(_))
    ));

    // Daughters cover the halves through references.
    assert_eq!(a.info().end_key, b"row050");
    assert_eq!(b.info().start_key, b"row050");
    assert!(a.has_references(b"f").unwrap());
    assert!(b.has_references(b"f").unwrap());
    assert_eq!(count_rows(&a), 50);
    assert_eq!(count_rows(&b), 50);

    // Daughters keep serving writes in their ranges.
    put(&a, "row010", "q", 2, "updated");
    assert!(matches!(
        a.put(b"row060", vec![Cell::put("row060", "f", "q", 2, "x")], Durability::SyncWal),
        Err(Error::InvalidInput(_))
    ));

    // Compaction rewrites references into concrete files.
    a.compact(true).unwrap();
    assert!(!a.has_references(b"f").unwrap());
    assert_eq!(count_rows(&a), 50);
}

#[test]
fn test_split_key_validation() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    put(&region, "row1", "q", 1, "v");

    assert!(matches!(
        split_region(&region, b"".to_vec()),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(region.state(), RegionState::Open);
}

#[test]
fn test_merge_lifecycle() {
    let fixture = Fixture::new();
    let a = fixture.create_region(
        RegionInfo::new("default", "t", b"".to_vec(), b"m".to_vec(), 10),
        ObserverChain::new(false),
    );
    let b = fixture.create_region(
        RegionInfo::new("default", "t", b"m".to_vec(), b"".to_vec(), 11),
        ObserverChain::new(false),
    );
    for i in 0..30 {
        put(&a, &format!("a{i:02}"), "q", 1, "left");
        put(&b, &format!("m{i:02}"), "q", 1, "right");
    }

    let merged = merge_regions(&a, &b).unwrap();
    assert_eq!(a.state(), RegionState::Merged);
    assert_eq!(b.state(), RegionState::Merged);
    assert_eq!(merged.info().start_key, b"");
    assert_eq!(merged.info().end_key, b"");

    // Until compaction runs, the merged region reads through references
    // and the parents' directories still exist.
    assert!(merged.has_references(b"f").unwrap());
    assert!(a.filesystem().region_dir().exists());
    assert!(b.filesystem().region_dir().exists());
    assert_eq!(count_rows(&merged), 60);

    // A major compaction rewrites everything; the union survives exactly
    // once.
    merged.compact(true).unwrap();
    assert!(!merged.has_references(b"f").unwrap());
    assert_eq!(count_rows(&merged), 60);
}

#[test]
fn test_merge_errors() {
    let fixture = Fixture::new();
    let a = fixture.create_region(
        RegionInfo::new("default", "t", b"".to_vec(), b"m".to_vec(), 10),
        ObserverChain::new(false),
    );
    let b = fixture.create_region(
        RegionInfo::new("default", "t", b"m".to_vec(), b"".to_vec(), 11),
        ObserverChain::new(false),
    );

    assert!(matches!(
        merge_regions(&a, &a),
        Err(Error::MergeRegion(_))
    ));

    b.close().unwrap();
    assert!(matches!(
        merge_regions(&a, &b),
        Err(Error::MergeRegion(_))
    ));
}

#[test]
fn test_updates_blocked_time_accumulates() {
    let dir = tempdir().unwrap();
    let config = Arc::new(EngineConfig::new(dir.path()));
    let cache = Arc::new(BlockCache::new(1 << 20));
    let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), u64::MAX).unwrap());
    let memory = Arc::new(MemoryAccountant::new(64));
    let region = Region::create(
        RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1),
        vec![FamilyConfig::new("f")],
        config,
        cache,
        wal,
        memory.clone(),
        ObserverChain::new(false),
    )
    .unwrap();

    // Drive usage over the cap, then release it from another thread.
    memory.add(1000);
    let releaser = {
        let memory = memory.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            memory.sub(1000);
        })
    };

    put(&region, "r", "q", 1, "v");
    releaser.join().unwrap();
    assert!(memory.updates_blocked_time() >= std::time::Duration::from_millis(20));
}

#[derive(Default)]
struct CountingObserver {
    pre_puts: AtomicUsize,
    post_puts: AtomicUsize,
    flushes: AtomicUsize,
    filtered_rows: AtomicUsize,
}

impl RegionObserver for CountingObserver {
    fn pre_put(&self, _ctx: &mut ObserverContext, _row: &[u8], _cells: &[Cell]) -> crate::error::Result<()> {
        self.pre_puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn post_put(&self, _ctx: &mut ObserverContext, _row: &[u8], _cells: &[Cell]) -> crate::error::Result<()> {
        self.post_puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn post_flush(&self, _ctx: &mut ObserverContext, _family: &[u8], _file_id: u64) -> crate::error::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn post_filter_row(&self, _ctx: &mut ObserverContext, _row: &[u8]) -> crate::error::Result<()> {
        self.filtered_rows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_observer_hooks_fire() {
    let fixture = Fixture::new();
    let observer = Arc::new(CountingObserver::default());
    let mut hooks = ObserverChain::new(false);
    hooks.register(observer.clone());
    let region = fixture.create_region(
        RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1),
        hooks,
    );

    put(&region, "apple", "q", 1, "v");
    put(&region, "banana", "q", 1, "v");
    region.flush().unwrap();

    assert_eq!(observer.pre_puts.load(Ordering::SeqCst), 2);
    assert_eq!(observer.post_puts.load(Ordering::SeqCst), 2);
    assert_eq!(observer.flushes.load(Ordering::SeqCst), 1);

    // A filter veto fires the post-filter-row hook.
    let mut scanner = region
        .scan(ScanOptions {
            filter: Some(Box::new(scanner::PrefixFilter::new("apple"))),
            ..Default::default()
        })
        .unwrap();
    region.scanner_next(&mut scanner, 10).unwrap();
    assert!(observer.filtered_rows.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_scan_sees_consistent_mvcc_snapshot() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();

    put(&region, "row1", "q", 1, "before");
    let mut scanner = region.scan(ScanOptions::default()).unwrap();

    // A write after the scanner opened is invisible to it.
    put(&region, "row2", "q", 1, "after");
    let rows = region.scanner_next(&mut scanner, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row, b"row1");

    // A fresh scanner sees both.
    assert_eq!(count_rows(&region), 2);
}

#[test]
fn test_scanner_cancellation() {
    let fixture = Fixture::new();
    let region = fixture.whole_table_region();
    for i in 0..10 {
        put(&region, &format!("row{i}"), "q", 1, "v");
    }

    let mut scanner = region.scan(ScanOptions::default()).unwrap();
    let rows = region.scanner_next(&mut scanner, 2).unwrap();
    assert_eq!(rows.len(), 2);

    scanner.cancel();
    let rows = region.scanner_next(&mut scanner, 2).unwrap();
    assert!(rows.is_empty());

    region.scanner_close(&mut scanner).unwrap();
    assert!(scanner.next_rows(1).is_err());
}
