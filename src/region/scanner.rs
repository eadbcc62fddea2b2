//! Merge and version-policy scanning.
//!
//! A read draws from every live source of a store (MemBuffer sections,
//! sorted files) through a k-way heap merge, then applies the multi-version
//! policy in a single pass:
//!
//! - cells above the MVCC read point are invisible,
//! - tombstones mask the puts they cover (the comparator guarantees a
//!   marker sorts before everything it masks),
//! - at most `max_versions` puts survive per column,
//! - TTL-expired and out-of-time-range puts are dropped.
//!
//! The same machinery drives user scans, gets, flushes (raw mode), and
//! compactions (which may retain tombstones for older files' sake).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cell::{Cell, CellKey, CellType};
use crate::error::Result;

/// Boxed source iterator; sources are ordered newest-first by index.
pub type CellIter = Box<dyn Iterator<Item = Result<Cell>> + Send>;

struct HeapEntry {
    cell: Cell,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cell.key == other.cell.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; ties break toward the newer
        // (lower-indexed) source.
        match self.cell.key.cmp(&other.cell.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ordering => ordering.reverse(),
        }
    }
}

/// K-way merge across sorted cell sources with exact-key deduplication and
/// MVCC read-point filtering.
pub struct MergeScanner {
    sources: Vec<CellIter>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<CellKey>,
    read_point: Option<u64>,
    failed: bool,
}

impl MergeScanner {
    pub fn new(mut sources: Vec<CellIter>, read_point: Option<u64>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(first) = iter.next() {
                heap.push(HeapEntry {
                    cell: first?,
                    source,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            last_key: None,
            read_point,
            failed: false,
        })
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                cell: next?,
                source,
            });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Cell>> {
        while let Some(entry) = self.heap.pop() {
            self.refill(entry.source)?;

            // The same key can surface from several sources after a flush
            // briefly overlaps a file; the newest source already won.
            if self.last_key.as_ref() == Some(&entry.cell.key) {
                continue;
            }
            // Writes beyond the read point are not yet visible.
            if let Some(read_point) = self.read_point {
                if entry.cell.mvcc().is_some_and(|m| m > read_point) {
                    continue;
                }
            }
            self.last_key = Some(entry.cell.key.clone());
            return Ok(Some(entry.cell));
        }
        Ok(None)
    }
}

impl Iterator for MergeScanner {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(cell)) => Some(Ok(cell)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Multi-version read policy.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    /// Versions returned per column; `u32::MAX` means all.
    pub max_versions: u32,
    /// Cells with timestamp below this are expired. 0 disables TTL.
    pub ttl_floor: u64,
    /// Half-open [min, max) timestamp filter on returned puts.
    pub time_range: Option<(u64, u64)>,
    /// Keep tombstones in the output (minor compactions need them to keep
    /// masking cells in files outside the selection).
    pub retain_deletes: bool,
}

impl VersionPolicy {
    pub fn read(max_versions: u32) -> Self {
        Self {
            max_versions,
            ttl_floor: 0,
            time_range: None,
            retain_deletes: false,
        }
    }
}

#[derive(Default)]
struct ColumnState {
    qualifier: Option<Vec<u8>>,
    delete_column_floor: Option<u64>,
    point_deletes: Vec<u64>,
    versions_emitted: u32,
}

#[derive(Default)]
struct FamilyState {
    row: Option<Vec<u8>>,
    family: Option<Vec<u8>>,
    /// DeleteFamily markers: mask puts at or below the timestamp.
    family_floors: Vec<u64>,
    /// DeleteFamilyVersion markers: mask the exact timestamp family-wide.
    family_versions: Vec<u64>,
}

/// Applies the version policy over a merged, key-ordered cell stream.
pub struct PolicyScanner<I> {
    inner: I,
    policy: VersionPolicy,
    family_state: FamilyState,
    column_state: ColumnState,
}

impl<I: Iterator<Item = Result<Cell>>> PolicyScanner<I> {
    pub fn new(inner: I, policy: VersionPolicy) -> Self {
        Self {
            inner,
            policy,
            family_state: FamilyState::default(),
            column_state: ColumnState::default(),
        }
    }

    fn on_boundaries(&mut self, key: &CellKey) {
        let family_changed = self.family_state.row.as_deref() != Some(key.row.as_slice())
            || self.family_state.family.as_deref() != Some(key.family.as_slice());
        if family_changed {
            self.family_state = FamilyState {
                row: Some(key.row.clone()),
                family: Some(key.family.clone()),
                ..Default::default()
            };
            self.column_state = ColumnState::default();
        }
        if self.column_state.qualifier.as_deref() != Some(key.qualifier.as_slice()) {
            self.column_state = ColumnState {
                qualifier: Some(key.qualifier.clone()),
                ..Default::default()
            };
        }
    }

    fn is_masked(&self, key: &CellKey) -> bool {
        if self
            .family_state
            .family_floors
            .iter()
            .any(|floor| key.timestamp <= *floor)
        {
            return true;
        }
        if self.family_state.family_versions.contains(&key.timestamp) {
            return true;
        }
        if self
            .column_state
            .delete_column_floor
            .is_some_and(|floor| key.timestamp <= floor)
        {
            return true;
        }
        self.column_state.point_deletes.contains(&key.timestamp)
    }

    fn step(&mut self) -> Result<Option<Cell>> {
        loop {
            let Some(cell) = self.inner.next().transpose()? else {
                return Ok(None);
            };
            self.on_boundaries(&cell.key);

            match cell.key.kind {
                CellType::DeleteFamily => {
                    self.family_state.family_floors.push(cell.key.timestamp);
                    if self.policy.retain_deletes {
                        return Ok(Some(cell));
                    }
                }
                CellType::DeleteFamilyVersion => {
                    self.family_state.family_versions.push(cell.key.timestamp);
                    if self.policy.retain_deletes {
                        return Ok(Some(cell));
                    }
                }
                CellType::DeleteColumn => {
                    let floor = self.column_state.delete_column_floor.get_or_insert(0);
                    *floor = (*floor).max(cell.key.timestamp);
                    if self.policy.retain_deletes {
                        return Ok(Some(cell));
                    }
                }
                CellType::Delete => {
                    self.column_state.point_deletes.push(cell.key.timestamp);
                    if self.policy.retain_deletes {
                        return Ok(Some(cell));
                    }
                }
                CellType::Put => {
                    if self.is_masked(&cell.key) {
                        continue;
                    }
                    if self.policy.ttl_floor > 0 && cell.key.timestamp < self.policy.ttl_floor {
                        continue;
                    }
                    if let Some((min, max)) = self.policy.time_range {
                        if cell.key.timestamp < min || cell.key.timestamp >= max {
                            continue;
                        }
                    }
                    if self.column_state.versions_emitted >= self.policy.max_versions {
                        continue;
                    }
                    self.column_state.versions_emitted += 1;
                    return Ok(Some(cell));
                }
            }
        }
    }
}

impl<I: Iterator<Item = Result<Cell>>> Iterator for PolicyScanner<I> {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Verdicts a cell-level filter can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Include,
    Skip,
    NextRow,
    Stop,
}

/// Server-side scan filter. `filter_row_key` returning true vetoes the
/// whole row; observers are notified through the post-filter-row hook.
pub trait ScanFilter: Send {
    fn filter_row_key(&self, _row: &[u8]) -> bool {
        false
    }

    fn filter_cell(&self, _cell: &Cell) -> FilterVerdict {
        FilterVerdict::Include
    }
}

/// Keeps rows starting with a prefix and stops the scan once past them.
pub struct PrefixFilter {
    prefix: Vec<u8>,
}

impl PrefixFilter {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl ScanFilter for PrefixFilter {
    fn filter_row_key(&self, row: &[u8]) -> bool {
        !row.starts_with(&self.prefix)
    }

    fn filter_cell(&self, cell: &Cell) -> FilterVerdict {
        if cell.key.row.starts_with(&self.prefix) {
            FilterVerdict::Include
        } else if cell.key.row.as_slice() > self.prefix.as_slice() {
            FilterVerdict::Stop
        } else {
            FilterVerdict::NextRow
        }
    }
}

/// One row of results.
#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    pub row: Vec<u8>,
    pub cells: Vec<Cell>,
}

/// Groups a policy-filtered cell stream into rows, applying filters, the
/// end-row bound, and cancellation.
pub struct RowScanner {
    inner: std::iter::Peekable<Box<dyn Iterator<Item = Result<Cell>> + Send>>,
    end_row: Option<Vec<u8>>,
    filter: Option<Box<dyn ScanFilter>>,
    cancelled: Arc<AtomicBool>,
    stopped: bool,
    /// Rows vetoed by the filter, reported to the post-filter-row hook.
    filtered_rows: Vec<Vec<u8>>,
}

impl RowScanner {
    pub fn new(
        cells: Box<dyn Iterator<Item = Result<Cell>> + Send>,
        end_row: Option<Vec<u8>>,
        filter: Option<Box<dyn ScanFilter>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: cells.peekable(),
            end_row,
            filter,
            cancelled,
            stopped: false,
            filtered_rows: Vec::new(),
        }
    }

    pub fn take_filtered_rows(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.filtered_rows)
    }

    fn past_end(&self, row: &[u8]) -> bool {
        self.end_row
            .as_deref()
            .is_some_and(|end| !end.is_empty() && row >= end)
    }

    /// The next whole row, or None at the end of the range.
    pub fn next_row(&mut self) -> Result<Option<RowResult>> {
        use std::sync::atomic::Ordering;

        'rows: loop {
            if self.stopped || self.cancelled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let row = match self.inner.peek() {
                Some(Ok(cell)) => cell.key.row.clone(),
                Some(Err(_)) => {
                    // Surface the stored error.
                    return Err(self.inner.next().expect("peeked").unwrap_err());
                }
                None => return Ok(None),
            };
            if self.past_end(&row) {
                return Ok(None);
            }

            if let Some(filter) = &self.filter {
                if filter.filter_row_key(&row) {
                    self.filtered_rows.push(row.clone());
                    self.skip_row(&row)?;
                    continue 'rows;
                }
            }

            let mut cells = Vec::new();
            while let Some(Ok(cell)) = self.inner.peek() {
                if cell.key.row != row {
                    break;
                }
                let cell = self.inner.next().expect("peeked").expect("checked ok");
                match self.filter.as_ref().map_or(FilterVerdict::Include, |f| {
                    f.filter_cell(&cell)
                }) {
                    FilterVerdict::Include => cells.push(cell),
                    FilterVerdict::Skip => {}
                    FilterVerdict::NextRow => {
                        self.skip_row(&row)?;
                        break;
                    }
                    FilterVerdict::Stop => {
                        self.stopped = true;
                        break;
                    }
                }
            }
            if let Some(Err(_)) = self.inner.peek() {
                return Err(self.inner.next().expect("peeked").unwrap_err());
            }

            if cells.is_empty() {
                if self.stopped {
                    return Ok(None);
                }
                continue 'rows;
            }
            return Ok(Some(RowResult { row, cells }));
        }
    }

    fn skip_row(&mut self, row: &[u8]) -> Result<()> {
        while let Some(Ok(cell)) = self.inner.peek() {
            if cell.key.row != row {
                break;
            }
            self.inner.next();
        }
        Ok(())
    }
}
