//! In-memory sorted cell buffer, one per store.
//!
//! Writers insert under the region's row latch while readers iterate
//! concurrently; the skip list makes both lock-free at this layer. Size is
//! accounted per cell including overhead, with bytes written under
//! `SKIP_WAL` tracked separately so operators can see how much resident
//! data has no durable backing.
//!
//! `snapshot_for_flush` atomically swaps in an empty active section and
//! parks the old one as an immutable snapshot the flush iterates; reads
//! consult both sections until the flush completes and drops the snapshot.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::cell::{Cell, CellKey, Tag};
use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone)]
struct StoredCell {
    value: Vec<u8>,
    tags: Vec<Tag>,
    mvcc: u64,
    sequence: u64,
}

/// One immutable-after-swap section of the buffer.
pub struct Section {
    cells: SkipMap<CellKey, StoredCell>,
    heap_size: AtomicUsize,
    no_wal_size: AtomicUsize,
    cell_count: AtomicUsize,
    min_sequence: AtomicU64,
    max_sequence: AtomicU64,
}

impl Section {
    fn new() -> Self {
        Self {
            cells: SkipMap::new(),
            heap_size: AtomicUsize::new(0),
            no_wal_size: AtomicUsize::new(0),
            cell_count: AtomicUsize::new(0),
            min_sequence: AtomicU64::new(u64::MAX),
            max_sequence: AtomicU64::new(0),
        }
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size.load(Ordering::SeqCst)
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count.load(Ordering::SeqCst)
    }

    pub fn max_sequence(&self) -> u64 {
        self.max_sequence.load(Ordering::SeqCst)
    }

    pub fn min_sequence(&self) -> u64 {
        self.min_sequence.load(Ordering::SeqCst)
    }

    fn insert(&self, cell: Cell, mvcc: u64, sequence: u64, skip_wal: bool) {
        let size = cell.heap_size();
        let stored = StoredCell {
            value: cell.value,
            tags: cell.tags,
            mvcc,
            sequence,
        };
        self.cells.insert(cell.key, stored);
        self.heap_size.fetch_add(size, Ordering::SeqCst);
        if skip_wal {
            self.no_wal_size.fetch_add(size, Ordering::SeqCst);
        }
        self.cell_count.fetch_add(1, Ordering::SeqCst);
        self.min_sequence.fetch_min(sequence, Ordering::SeqCst);
        self.max_sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    fn materialize(key: &CellKey, stored: &StoredCell) -> Cell {
        let mut cell = Cell {
            key: key.clone(),
            value: stored.value.clone(),
            tags: stored.tags.clone(),
        };
        if stored.mvcc > 0 {
            cell.set_mvcc(stored.mvcc);
        }
        cell
    }

    /// Owning cursor over the section from `start`. Safe under concurrent
    /// inserts: each step re-seeks past the last returned key.
    pub fn scan_from(self: &Arc<Self>, start: &CellKey) -> SectionScanner {
        SectionScanner {
            section: self.clone(),
            next_bound: Bound::Included(start.clone()),
        }
    }
}

/// Iterator over one section's cells in key order.
pub struct SectionScanner {
    section: Arc<Section>,
    next_bound: Bound<CellKey>,
}

impl Iterator for SectionScanner {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        let bound = std::mem::replace(&mut self.next_bound, Bound::Unbounded);
        let entry = self
            .section
            .cells
            .range((bound, Bound::Unbounded))
            .next()?;
        let cell = Section::materialize(entry.key(), entry.value());
        self.next_bound = Bound::Excluded(entry.key().clone());
        Some(Ok(cell))
    }
}

pub struct MemBuffer {
    active: RwLock<Arc<Section>>,
    snapshot: RwLock<Option<Arc<Section>>>,
}

impl MemBuffer {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(Section::new())),
            snapshot: RwLock::new(None),
        }
    }

    /// Inserts one cell. `sequence` is its WAL sequence (also assigned for
    /// skip-WAL writes), `mvcc` the write number readers gate on.
    pub fn insert(&self, cell: Cell, mvcc: u64, sequence: u64, skip_wal: bool) {
        let active = self.active.read().expect("membuffer lock");
        active.insert(cell, mvcc, sequence, skip_wal);
    }

    /// Total heap footprint across active and snapshot sections.
    pub fn heap_size(&self) -> usize {
        let active = self.active.read().expect("membuffer lock").heap_size();
        let snapshot = self
            .snapshot
            .read()
            .expect("membuffer lock")
            .as_ref()
            .map_or(0, |s| s.heap_size());
        active + snapshot
    }

    /// Bytes resident in memory with no WAL backing.
    pub fn mutations_without_wal_size(&self) -> usize {
        let active = self
            .active
            .read()
            .expect("membuffer lock")
            .no_wal_size
            .load(Ordering::SeqCst);
        let snapshot = self
            .snapshot
            .read()
            .expect("membuffer lock")
            .as_ref()
            .map_or(0, |s| s.no_wal_size.load(Ordering::SeqCst));
        active + snapshot
    }

    pub fn cell_count(&self) -> usize {
        let active = self.active.read().expect("membuffer lock").cell_count();
        let snapshot = self
            .snapshot
            .read()
            .expect("membuffer lock")
            .as_ref()
            .map_or(0, |s| s.cell_count());
        active + snapshot
    }

    /// Smallest unflushed WAL sequence resident in the buffer, or
    /// `u64::MAX` when everything has been flushed.
    pub fn min_unflushed_sequence(&self) -> u64 {
        let active = self.active.read().expect("membuffer lock").min_sequence();
        let snapshot = self
            .snapshot
            .read()
            .expect("membuffer lock")
            .as_ref()
            .map_or(u64::MAX, |s| s.min_sequence());
        active.min(snapshot)
    }

    /// Atomically parks the active section as the flush snapshot and
    /// installs a fresh active section. Writers never block on the flush.
    pub fn snapshot_for_flush(&self) -> Result<Arc<Section>> {
        let mut snapshot = self.snapshot.write().expect("membuffer lock");
        if snapshot.is_some() {
            return Err(Error::InvalidData(
                "a flush snapshot is already pending".to_string(),
            ));
        }
        let mut active = self.active.write().expect("membuffer lock");
        let section = std::mem::replace(&mut *active, Arc::new(Section::new()));
        *snapshot = Some(section.clone());
        Ok(section)
    }

    /// Drops the flush snapshot once its file is published.
    pub fn clear_snapshot(&self) {
        *self.snapshot.write().expect("membuffer lock") = None;
    }

    /// Restores the snapshot into the read path after a failed flush. The
    /// cells are still durable in the WAL; this keeps them readable until
    /// the region aborts or the flush retries.
    pub fn restore_snapshot(&self) -> Option<Arc<Section>> {
        self.snapshot.write().expect("membuffer lock").take()
    }

    /// Scanners over the sections readers must consult, newest first.
    pub fn scanners(&self, start: &CellKey) -> Vec<SectionScanner> {
        let mut scanners = Vec::with_capacity(2);
        scanners.push(self.active.read().expect("membuffer lock").scan_from(start));
        if let Some(snapshot) = self.snapshot.read().expect("membuffer lock").as_ref() {
            scanners.push(snapshot.scan_from(start));
        }
        scanners
    }
}

impl Default for MemBuffer {
    fn default() -> Self {
        Self::new()
    }
}
