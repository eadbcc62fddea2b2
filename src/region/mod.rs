//! Region: request-level orchestration for one row-range.
//!
//! A region owns one store per column family and drives the write path
//! (row latch → WAL append → MemBuffer insert → MVCC commit), the read path
//! (merge across stores under an MVCC read point), flushes, compactions,
//! and the split/merge transactions in [`split`].
//!
//! # Write path
//!
//! ```text
//! request ─▶ hooks.pre ─▶ row latch ─▶ WAL append (per durability)
//!         ─▶ MemBuffer insert ─▶ MVCC complete ─▶ hooks.post ─▶ ack
//! ```
//!
//! Writes block while the node is over its global memstore cap; the time
//! spent blocked is accumulated in `updates_blocked_time`.

pub mod info;
pub mod mvcc;
pub mod rowlock;
pub mod scanner;
pub mod split;
pub mod store;
pub mod tasks;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::cache::BlockCache;
use crate::cell::{Cell, CellKey};
use crate::config::{EngineConfig, FamilyConfig};
use crate::error::Result;
use crate::fs::RegionFileSystem;
use crate::hooks::ObserverChain;
use crate::wal::{Durability, Wal, WalRecord};
use crate::Error;

use info::{RegionInfo, RegionState};
use mvcc::Mvcc;
use rowlock::RowLocks;
use scanner::{
    CellIter, MergeScanner, PolicyScanner, RowResult, RowScanner, ScanFilter, VersionPolicy,
};
use store::{Store, StoreContext};

/// Node-wide memstore accounting shared by all regions.
pub struct MemoryAccountant {
    used: AtomicUsize,
    hard_cap: usize,
    blocked_millis: AtomicU64,
}

impl MemoryAccountant {
    pub fn new(hard_cap: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            hard_cap,
            blocked_millis: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn add(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn sub(&self, bytes: usize) {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn over_hard_cap(&self) -> bool {
        self.used() > self.hard_cap
    }

    /// Total time writes have spent blocked on the hard cap.
    pub fn updates_blocked_time(&self) -> Duration {
        Duration::from_millis(self.blocked_millis.load(Ordering::SeqCst))
    }

    /// Spins (politely) until usage drops under the cap, accumulating the
    /// blocked time. Writes are delayed, never dropped.
    fn block_while_over_cap(&self) {
        if !self.over_hard_cap() {
            return;
        }
        let started = Instant::now();
        while self.over_hard_cap() {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.blocked_millis
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::SeqCst);
    }
}

/// Comparators for conditional mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl CompareOp {
    fn evaluate(self, current: Option<&[u8]>, expected: &[u8]) -> bool {
        match current {
            None => {
                // Only an equality check against "absent" can pass.
                self == CompareOp::Equal && expected.is_empty()
            }
            Some(current) => match self {
                CompareOp::Equal => current == expected,
                CompareOp::NotEqual => current != expected,
                CompareOp::Less => current < expected,
                CompareOp::LessOrEqual => current <= expected,
                CompareOp::Greater => current > expected,
                CompareOp::GreaterOrEqual => current >= expected,
            },
        }
    }
}

/// One entry of a batch mutation.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub row: Vec<u8>,
    pub cells: Vec<Cell>,
    pub durability: Durability,
}

/// Read options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Restrict to these families; None reads all.
    pub families: Option<Vec<Vec<u8>>>,
    /// Restrict to one qualifier.
    pub qualifier: Option<Vec<u8>>,
    pub max_versions: u32,
    pub time_range: Option<(u64, u64)>,
}

/// Scan options.
#[derive(Default)]
pub struct ScanOptions {
    pub start_row: Vec<u8>,
    /// Exclusive; empty scans to the region end.
    pub end_row: Vec<u8>,
    pub families: Option<Vec<Vec<u8>>>,
    pub max_versions: u32,
    pub time_range: Option<(u64, u64)>,
    pub filter: Option<Box<dyn ScanFilter>>,
    /// Cells per `next` result instead of whole rows, when set.
    pub batch: Option<usize>,
    pub reversed: bool,
    /// Hint: in-memory-sized retrieval; disables data block caching.
    pub small: bool,
}

/// Region metrics counters.
#[derive(Debug, Default)]
pub struct RegionMetrics {
    pub check_mutate_passed: AtomicU64,
    pub check_mutate_failed: AtomicU64,
}

pub struct Region {
    info: RegionInfo,
    state: RwLock<RegionState>,
    stores: BTreeMap<Vec<u8>, Arc<Store>>,
    fs: RegionFileSystem,
    cache: Arc<BlockCache>,
    config: Arc<EngineConfig>,
    wal: Arc<Wal>,
    memory: Arc<MemoryAccountant>,
    mvcc: Mvcc,
    locks: RowLocks,
    hooks: ObserverChain,
    next_file_id: AtomicU64,
    next_scanner_id: AtomicU64,
    pub metrics: RegionMetrics,
    aborted: AtomicBool,
}

impl Region {
    /// Creates a brand-new region on disk and opens it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        info: RegionInfo,
        families: Vec<FamilyConfig>,
        config: Arc<EngineConfig>,
        cache: Arc<BlockCache>,
        wal: Arc<Wal>,
        memory: Arc<MemoryAccountant>,
        hooks: ObserverChain,
    ) -> Result<Arc<Self>> {
        let fs = RegionFileSystem::new(&config.root_dir, &info);
        let family_names: Vec<Vec<u8>> = families.iter().map(|f| f.name.clone()).collect();
        fs.create(&info, &family_names)?;
        Self::open(info, families, config, cache, wal, memory, hooks)
    }

    /// Opens an existing region: loads stores, restores sequence counters.
    /// WAL replay happens separately via [`Region::replay_edits`] before the
    /// region is declared OPEN to traffic.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        info: RegionInfo,
        families: Vec<FamilyConfig>,
        config: Arc<EngineConfig>,
        cache: Arc<BlockCache>,
        wal: Arc<Wal>,
        memory: Arc<MemoryAccountant>,
        hooks: ObserverChain,
    ) -> Result<Arc<Self>> {
        hooks.invoke(|obs, ctx| obs.pre_open(ctx))?;

        let fs = RegionFileSystem::new(&config.root_dir, &info);
        fs.write_region_info(&info)?;

        let next_file_id = AtomicU64::new(1);
        let mut stores = BTreeMap::new();
        {
            let ctx = StoreContext {
                fs: &fs,
                cache: &cache,
                config: &config,
                next_file_id: &next_file_id,
            };
            for family in families {
                let name = family.name.clone();
                let store = Store::open(family, &ctx)?;
                stores.insert(name, Arc::new(store));
            }
        }

        let region = Arc::new(Self {
            info,
            state: RwLock::new(RegionState::Opening),
            stores,
            fs,
            cache,
            config,
            wal,
            memory,
            mvcc: Mvcc::new(),
            locks: RowLocks::new(),
            hooks,
            next_file_id,
            next_scanner_id: AtomicU64::new(1),
            metrics: RegionMetrics::default(),
            aborted: AtomicBool::new(false),
        });

        // New writes must sequence above everything already flushed.
        let max_flushed = region
            .stores
            .values()
            .map(|s| s.max_flushed_sequence())
            .max()
            .unwrap_or(0);
        region.wal.advance_sequence(&region.name(), max_flushed);
        region.mvcc.advance_to(max_flushed);

        *region.state.write().expect("state lock") = RegionState::Open;
        region.hooks.invoke(|obs, ctx| obs.post_open(ctx))?;
        Ok(region)
    }

    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    pub fn name(&self) -> Vec<u8> {
        self.info.name()
    }

    pub fn state(&self) -> RegionState {
        *self.state.read().expect("state lock")
    }

    pub(crate) fn set_state(&self, state: RegionState) {
        *self.state.write().expect("state lock") = state;
    }

    pub fn filesystem(&self) -> &RegionFileSystem {
        &self.fs
    }

    pub fn store(&self, family: &[u8]) -> Result<&Arc<Store>> {
        self.stores
            .get(family)
            .ok_or_else(|| Error::NoSuchFamily(String::from_utf8_lossy(family).into_owned()))
    }

    pub fn stores(&self) -> impl Iterator<Item = (&Vec<u8>, &Arc<Store>)> {
        self.stores.iter()
    }

    fn store_ctx(&self) -> StoreContext<'_> {
        StoreContext {
            fs: &self.fs,
            cache: &self.cache,
            config: &self.config,
            next_file_id: &self.next_file_id,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        if state != RegionState::Open {
            return Err(Error::RegionNotOnline(format!(
                "{} is {state:?}",
                String::from_utf8_lossy(&self.name())
            )));
        }
        if self.aborted.load(Ordering::SeqCst) || self.wal.is_aborted() {
            return Err(Error::RegionNotOnline("region aborted".to_string()));
        }
        Ok(())
    }

    fn check_cells(&self, row: &[u8], cells: &[Cell]) -> Result<()> {
        if !self.info.contains_row(row) {
            return Err(Error::InvalidInput(format!(
                "row {:?} outside region range",
                String::from_utf8_lossy(row)
            )));
        }
        for cell in cells {
            if cell.key.row.as_slice() != row {
                return Err(Error::InvalidInput(
                    "all cells in a mutation must share the row".to_string(),
                ));
            }
            self.store(&cell.key.family)?;
        }
        Ok(())
    }

    /// Applies one row's cells: WAL, MemBuffer, MVCC. Caller holds the row
    /// latch.
    fn apply_row(&self, cells: Vec<Cell>, durability: Durability) -> Result<u64> {
        let sequence = self.wal.append(&self.name(), &cells, durability)?;
        let write = self.mvcc.begin_write();
        let skip_wal = durability == Durability::SkipWal;
        let mut added = 0usize;
        for cell in cells {
            added += cell.heap_size();
            let store = self.store(&cell.key.family)?;
            store.insert(cell, write.number, sequence, skip_wal);
        }
        self.memory.add(added);
        self.mvcc.complete_write(write);
        Ok(sequence)
    }

    /// Single-row put: atomic across all its cells.
    pub fn put(&self, row: &[u8], cells: Vec<Cell>, durability: Durability) -> Result<()> {
        self.ensure_open()?;
        self.check_cells(row, &cells)?;
        if self
            .hooks
            .invoke(|obs, ctx| obs.pre_put(ctx, row, &cells))?
        {
            return Ok(());
        }
        self.memory.block_while_over_cap();

        {
            let _latch = self.locks.lock_row(row);
            self.apply_row(cells.clone(), durability)?;
        }

        self.hooks
            .invoke(|obs, ctx| obs.post_put(ctx, row, &cells))?;
        Ok(())
    }

    /// Single-row delete: the cells must be delete markers.
    pub fn delete(&self, row: &[u8], cells: Vec<Cell>, durability: Durability) -> Result<()> {
        self.ensure_open()?;
        if cells.iter().any(|c| !c.key.kind.is_delete()) {
            return Err(Error::InvalidInput(
                "delete cells must carry delete types".to_string(),
            ));
        }
        self.check_cells(row, &cells)?;
        if self
            .hooks
            .invoke(|obs, ctx| obs.pre_delete(ctx, row, &cells))?
        {
            return Ok(());
        }
        self.memory.block_while_over_cap();

        {
            let _latch = self.locks.lock_row(row);
            self.apply_row(cells.clone(), durability)?;
        }

        self.hooks
            .invoke(|obs, ctx| obs.post_delete(ctx, row, &cells))?;
        Ok(())
    }

    /// Batch of single-row mutations. Each row is atomic; failures surface
    /// per entry. Valid entries share one WAL append.
    pub fn batch(&self, mutations: Vec<Mutation>) -> Vec<Result<()>> {
        let count = mutations.len();
        let mut results: Vec<Result<()>> = Vec::with_capacity(count);

        if let Err(e) = self.ensure_open() {
            return mutations.iter().map(|_| Err(e.clone())).collect();
        }
        if let Err(e) = self.hooks.invoke(|obs, ctx| obs.pre_batch_mutate(ctx, count)) {
            return mutations.iter().map(|_| Err(e.clone())).collect();
        }
        self.memory.block_while_over_cap();

        // Validate every entry first; only valid ones are applied.
        let mut valid: Vec<&Mutation> = Vec::with_capacity(count);
        for mutation in &mutations {
            match self.check_cells(&mutation.row, &mutation.cells) {
                Ok(()) => {
                    valid.push(mutation);
                    results.push(Ok(()));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        let success = if !valid.is_empty() {
            let _latch = self
                .locks
                .lock_rows(valid.iter().map(|m| m.row.as_slice()));
            // One WAL append covers the whole batch at the strongest
            // durability any entry asked for.
            let durability = valid
                .iter()
                .map(|m| m.durability)
                .max_by_key(|d| match d {
                    Durability::SkipWal => 0,
                    Durability::AsyncWal => 1,
                    Durability::SyncWal => 2,
                    Durability::FsyncWal => 3,
                })
                .unwrap_or(Durability::SyncWal);
            let all_cells: Vec<Cell> = valid
                .iter()
                .flat_map(|m| m.cells.iter().cloned())
                .collect();

            match self.wal.append(&self.name(), &all_cells, durability) {
                Ok(sequence) => {
                    let write = self.mvcc.begin_write();
                    let skip_wal = durability == Durability::SkipWal;
                    let mut added = 0usize;
                    for mutation in &valid {
                        for cell in &mutation.cells {
                            added += cell.heap_size();
                            if let Ok(store) = self.store(&cell.key.family) {
                                store.insert(cell.clone(), write.number, sequence, skip_wal);
                            }
                        }
                    }
                    self.memory.add(added);
                    self.mvcc.complete_write(write);
                    true
                }
                Err(e) => {
                    for result in results.iter_mut() {
                        if result.is_ok() {
                            *result = Err(e.clone());
                        }
                    }
                    false
                }
            }
        } else {
            false
        };

        let _ = self
            .hooks
            .invoke(|obs, ctx| obs.post_batch_mutate(ctx, count));
        // The indispensable hook always runs, even on failure.
        let _ = self
            .hooks
            .invoke(|obs, ctx| obs.post_batch_mutate_indispensably(ctx, count, success));
        results
    }

    /// Newest visible value of one column, under the current read point.
    fn current_value(&self, row: &[u8], family: &[u8], qualifier: &[u8]) -> Result<Option<Cell>> {
        let cells = self.get(
            row,
            &GetOptions {
                families: Some(vec![family.to_vec()]),
                qualifier: Some(qualifier.to_vec()),
                max_versions: 1,
                time_range: None,
            },
        )?;
        Ok(cells.into_iter().next())
    }

    /// Conditional mutation: applies `mutation` iff the comparator accepts
    /// the column's current value. Atomic under the row latch.
    pub fn check_and_mutate(
        &self,
        row: &[u8],
        family: &[u8],
        qualifier: &[u8],
        op: CompareOp,
        expected: &[u8],
        mutation: Mutation,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.store(family)?;
        if mutation.row != row {
            return Err(Error::InvalidInput(
                "conditional mutation must target the checked row".to_string(),
            ));
        }
        self.check_cells(row, &mutation.cells)?;

        let deleting = mutation.cells.iter().all(|c| c.key.kind.is_delete());
        let bypass = if deleting {
            self.hooks
                .invoke(|obs, ctx| obs.pre_check_and_delete(ctx, row))?
        } else {
            self.hooks
                .invoke(|obs, ctx| obs.pre_check_and_put(ctx, row))?
        };
        if bypass {
            return Ok(false);
        }
        self.memory.block_while_over_cap();

        let passed = {
            let _latch = self.locks.lock_row(row);
            let current = self.current_value(row, family, qualifier)?;
            let passed = op.evaluate(current.as_ref().map(|c| c.value.as_slice()), expected);
            if passed {
                self.apply_row(mutation.cells.clone(), mutation.durability)?;
            }
            passed
        };

        if passed {
            self.metrics.check_mutate_passed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.metrics.check_mutate_failed.fetch_add(1, Ordering::SeqCst);
        }
        if deleting {
            self.hooks
                .invoke(|obs, ctx| obs.post_check_and_delete(ctx, row, passed))?;
        } else {
            self.hooks
                .invoke(|obs, ctx| obs.post_check_and_put(ctx, row, passed))?;
        }
        Ok(passed)
    }

    /// Atomic read-modify-write add. Values are 8-byte big-endian signed
    /// integers; each column gains a new version at the current time.
    pub fn increment(
        &self,
        row: &[u8],
        deltas: Vec<(Vec<u8>, Vec<u8>, i64)>,
        durability: Durability,
    ) -> Result<Vec<Cell>> {
        self.ensure_open()?;
        self.hooks.invoke(|obs, ctx| obs.pre_increment(ctx, row))?;
        self.memory.block_while_over_cap();

        let results = {
            let _latch = self.locks.lock_row(row);
            let mut new_cells = Vec::with_capacity(deltas.len());
            for (family, qualifier, delta) in &deltas {
                let current = self.current_value(row, family, qualifier)?;
                let base = match &current {
                    None => 0i64,
                    Some(cell) => {
                        let bytes: [u8; 8] = cell.value.as_slice().try_into().map_err(|_| {
                            Error::InvalidInput(format!(
                                "increment on non-numeric column {:?}",
                                String::from_utf8_lossy(qualifier)
                            ))
                        })?;
                        i64::from_be_bytes(bytes)
                    }
                };
                let updated = base.wrapping_add(*delta);
                new_cells.push(Cell::put(
                    row.to_vec(),
                    family.clone(),
                    qualifier.clone(),
                    now_millis(),
                    updated.to_be_bytes().to_vec(),
                ));
            }
            self.check_cells(row, &new_cells)?;
            self.apply_row(new_cells.clone(), durability)?;
            new_cells
        };

        self.hooks.invoke(|obs, ctx| obs.post_increment(ctx, row))?;
        Ok(results)
    }

    /// Atomic read-modify-write append of bytes to each column's newest
    /// value.
    pub fn append(
        &self,
        row: &[u8],
        appends: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
        durability: Durability,
    ) -> Result<Vec<Cell>> {
        self.ensure_open()?;
        self.hooks.invoke(|obs, ctx| obs.pre_append(ctx, row))?;
        self.memory.block_while_over_cap();

        let results = {
            let _latch = self.locks.lock_row(row);
            let mut new_cells = Vec::with_capacity(appends.len());
            for (family, qualifier, suffix) in &appends {
                let mut value = self
                    .current_value(row, family, qualifier)?
                    .map(|c| c.value)
                    .unwrap_or_default();
                value.extend_from_slice(suffix);
                new_cells.push(Cell::put(
                    row.to_vec(),
                    family.clone(),
                    qualifier.clone(),
                    now_millis(),
                    value,
                ));
            }
            self.check_cells(row, &new_cells)?;
            self.apply_row(new_cells.clone(), durability)?;
            new_cells
        };

        self.hooks.invoke(|obs, ctx| obs.post_append(ctx, row))?;
        Ok(results)
    }

    fn selected_stores(&self, families: &Option<Vec<Vec<u8>>>) -> Result<Vec<Arc<Store>>> {
        match families {
            None => Ok(self.stores.values().cloned().collect()),
            Some(names) => names
                .iter()
                .map(|name| self.store(name).cloned())
                .collect(),
        }
    }

    fn cell_stream(
        &self,
        start: &CellKey,
        families: &Option<Vec<Vec<u8>>>,
        policy: VersionPolicy,
        caching: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<Cell>> + Send>> {
        let mut sources: Vec<CellIter> = Vec::new();
        for store in self.selected_stores(families)? {
            sources.extend(store.scanners(start, caching)?);
        }
        let merge = MergeScanner::new(sources, Some(self.mvcc.read_point()))?;
        let policy_scan = PolicyScanner::new(merge, policy);
        // MVCC tags are an implementation detail; strip them from results.
        Ok(Box::new(policy_scan.map(|r| {
            r.map(|mut cell| {
                cell.strip_mvcc();
                cell
            })
        })))
    }

    /// Point read of one row. Read-your-writes for committed mutations,
    /// consistent under the MVCC read point.
    pub fn get(&self, row: &[u8], options: &GetOptions) -> Result<Vec<Cell>> {
        self.ensure_open()?;
        if !self.info.contains_row(row) {
            return Err(Error::InvalidInput(format!(
                "row {:?} outside region range",
                String::from_utf8_lossy(row)
            )));
        }
        self.hooks.invoke(|obs, ctx| obs.pre_get(ctx, row))?;

        let policy = VersionPolicy {
            max_versions: options.max_versions.max(1),
            ttl_floor: 0,
            time_range: options.time_range,
            retain_deletes: false,
        };
        let start = CellKey::first_on_row(row.to_vec());
        let stream = self.cell_stream(&start, &options.families, policy, true)?;

        let mut results = Vec::new();
        for cell in stream {
            let cell = cell?;
            if cell.key.row.as_slice() != row {
                break;
            }
            if let Some(qualifier) = &options.qualifier {
                if &cell.key.qualifier != qualifier {
                    continue;
                }
            }
            results.push(cell);
        }

        self.hooks
            .invoke(|obs, ctx| obs.post_get(ctx, row, &mut results))?;
        Ok(results)
    }

    /// True when the row has any visible cell.
    pub fn exists(&self, row: &[u8]) -> Result<bool> {
        self.hooks.invoke(|obs, ctx| obs.pre_exists(ctx, row))?;
        let found = !self
            .get(
                row,
                &GetOptions {
                    max_versions: 1,
                    ..Default::default()
                },
            )?
            .is_empty();
        self.hooks
            .invoke(|obs, ctx| obs.post_exists(ctx, row, found))?;
        Ok(found)
    }

    /// Opens a region scanner.
    pub fn scan(&self, options: ScanOptions) -> Result<RegionScanner> {
        self.ensure_open()?;
        self.hooks.invoke(|obs, ctx| obs.pre_scanner_open(ctx))?;

        let start_row = if options.start_row.is_empty() {
            self.info.start_key.clone()
        } else {
            options.start_row.clone()
        };
        let end_row = if options.end_row.is_empty() {
            self.info.end_key.clone()
        } else {
            options.end_row.clone()
        };

        let policy = VersionPolicy {
            max_versions: options.max_versions.max(1),
            ttl_floor: 0,
            time_range: options.time_range,
            retain_deletes: false,
        };
        // Small scans skip data block caching so they do not pollute it.
        let caching = !options.small;
        let start = CellKey::first_on_row(start_row);
        let stream = self.cell_stream(&start, &options.families, policy, caching)?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let rows = RowScanner::new(
            stream,
            (!end_row.is_empty()).then_some(end_row),
            options.filter,
            cancelled.clone(),
        );

        let id = self.next_scanner_id.fetch_add(1, Ordering::SeqCst);
        self.hooks
            .invoke(|obs, ctx| obs.post_scanner_open(ctx, id))?;

        Ok(RegionScanner {
            id,
            rows,
            batch: options.batch,
            reversed_buffer: if options.reversed { Some(None) } else { None },
            cancelled,
            closed: false,
        })
    }

    /// Drives a scanner's `next`, firing the scanner hooks.
    pub fn scanner_next(
        &self,
        scanner: &mut RegionScanner,
        n: usize,
    ) -> Result<Vec<RowResult>> {
        self.hooks
            .invoke(|obs, ctx| obs.pre_scanner_next(ctx, scanner.id))?;
        let results = scanner.next_rows(n)?;
        for row in scanner.rows.take_filtered_rows() {
            self.hooks
                .invoke(|obs, ctx| obs.post_filter_row(ctx, &row))?;
        }
        self.hooks
            .invoke(|obs, ctx| obs.post_scanner_next(ctx, scanner.id, results.len()))?;
        Ok(results)
    }

    pub fn scanner_close(&self, scanner: &mut RegionScanner) -> Result<()> {
        self.hooks
            .invoke(|obs, ctx| obs.pre_scanner_close(ctx, scanner.id))?;
        scanner.close();
        self.hooks
            .invoke(|obs, ctx| obs.post_scanner_close(ctx, scanner.id))?;
        Ok(())
    }

    /// Flushes every store, returning the number that produced a file.
    pub fn flush(&self) -> Result<usize> {
        let mut flushed = 0;
        for (name, store) in &self.stores {
            if self
                .hooks
                .invoke(|obs, ctx| obs.pre_flush(ctx, name))?
            {
                continue;
            }
            self.hooks
                .invoke(|obs, ctx| obs.pre_flush_scanner_open(ctx, name))?;

            let before = store.buffer().heap_size();
            match store.flush(&self.store_ctx()) {
                Ok(Some(file_id)) => {
                    self.memory.sub(before);
                    flushed += 1;
                    self.hooks
                        .invoke(|obs, ctx| obs.post_flush(ctx, name, file_id))?;
                }
                Ok(None) => {}
                Err(e) => {
                    self.aborted.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(flushed)
    }

    /// Compacts every store that has (or is forced to have) a selection.
    /// Returns the per-family new file ids.
    pub fn compact(&self, major: bool) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut outputs = Vec::new();
        for (name, store) in &self.stores {
            let Some(_guard) = store.begin_compaction() else {
                continue;
            };
            let selection = if major {
                store.files()
            } else {
                store.select_compaction(&self.config)
            };
            if selection.is_empty() {
                continue;
            }

            let mut candidates: Vec<u64> = selection.iter().map(|f| f.id).collect();
            if self.hooks.invoke(|obs, ctx| {
                obs.pre_compact_selection(ctx, name, &mut candidates)
            })? {
                continue;
            }
            let selection: Vec<_> = selection
                .into_iter()
                .filter(|f| candidates.contains(&f.id))
                .collect();
            if selection.is_empty() {
                continue;
            }
            self.hooks
                .invoke(|obs, ctx| obs.post_compact_selection(ctx, name, &candidates))?;
            if self
                .hooks
                .invoke(|obs, ctx| obs.pre_compact(ctx, name, major))?
            {
                continue;
            }
            self.hooks
                .invoke(|obs, ctx| obs.pre_compact_scanner_open(ctx, name))?;

            let (new_file, replaced) = store.compact(&self.store_ctx(), selection, major)?;
            self.wal
                .append_compaction_marker(&self.name(), name, &replaced)?;
            self.hooks
                .invoke(|obs, ctx| obs.post_compact(ctx, name, new_file))?;
            outputs.push((name.clone(), new_file));
        }
        Ok(outputs)
    }

    /// Applies one replayed WAL record during recovery. Edits at or below
    /// what the stores already flushed are skipped.
    pub fn replay_record(&self, record: &WalRecord) -> Result<bool> {
        if record.kind != crate::wal::RECORD_EDIT {
            return Ok(false);
        }
        if record.region != self.name() {
            return Ok(false);
        }
        self.hooks
            .invoke(|obs, ctx| obs.pre_wal_restore(ctx, record.sequence))?;

        let mut applied = false;
        for cell in &record.cells {
            let store = match self.store(&cell.key.family) {
                Ok(store) => store,
                Err(_) => continue,
            };
            if record.sequence <= store.max_flushed_sequence() {
                continue;
            }
            let write = self.mvcc.begin_write();
            self.memory.add(cell.heap_size());
            store.insert(cell.clone(), write.number, record.sequence, false);
            self.mvcc.complete_write(write);
            applied = true;
        }
        self.wal.advance_sequence(&self.name(), record.sequence);

        self.hooks
            .invoke(|obs, ctx| obs.post_wal_restore(ctx, record.sequence))?;
        Ok(applied)
    }

    /// Replays a stream of records (node recovery).
    pub fn replay_edits<I: IntoIterator<Item = Result<WalRecord>>>(
        &self,
        records: I,
    ) -> Result<usize> {
        self.hooks.invoke(|obs, ctx| obs.pre_log_replay(ctx))?;
        let mut applied = 0;
        for record in records {
            if self.replay_record(&record?)? {
                applied += 1;
            }
        }
        self.hooks
            .invoke(|obs, ctx| obs.post_log_replay(ctx, applied))?;
        Ok(applied)
    }

    /// Total MemBuffer bytes across stores.
    pub fn memstore_size(&self) -> usize {
        self.stores.values().map(|s| s.buffer().heap_size()).sum()
    }

    /// Bytes resident with no WAL backing.
    pub fn mutations_without_wal_size(&self) -> usize {
        self.stores
            .values()
            .map(|s| s.buffer().mutations_without_wal_size())
            .sum()
    }

    /// Smallest unflushed sequence across stores; WAL files whose last
    /// sequence is below this are archivable for this region.
    pub fn min_unflushed_sequence(&self) -> u64 {
        self.stores
            .values()
            .map(|s| s.min_unflushed_sequence())
            .min()
            .unwrap_or(u64::MAX)
    }

    pub fn has_references(&self, family: &[u8]) -> Result<bool> {
        Ok(self.store(family)?.has_references())
    }

    /// Graceful close: flush, then CLOSED.
    pub fn close(&self) -> Result<()> {
        self.hooks.invoke(|obs, ctx| obs.pre_close(ctx))?;
        self.set_state(RegionState::Closing);
        self.flush()?;
        self.set_state(RegionState::Closed);
        self.hooks.invoke(|obs, ctx| obs.post_close(ctx))?;
        Ok(())
    }

    pub(crate) fn hooks(&self) -> &ObserverChain {
        &self.hooks
    }

    pub(crate) fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub(crate) fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub(crate) fn wal_handle(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub(crate) fn memory_handle(&self) -> &Arc<MemoryAccountant> {
        &self.memory
    }
}

/// A server-side scanner over a region's row-range.
pub struct RegionScanner {
    pub id: u64,
    rows: RowScanner,
    batch: Option<usize>,
    /// Reversed scans materialize the range once, then drain backward.
    reversed_buffer: Option<Option<Vec<RowResult>>>,
    cancelled: Arc<AtomicBool>,
    closed: bool,
}

impl RegionScanner {
    /// Up to `n` results, ordered by row (descending when reversed). With
    /// `batch` set, each result carries at most that many cells.
    pub fn next_rows(&mut self, n: usize) -> Result<Vec<RowResult>> {
        if self.closed {
            return Err(Error::ReadOnly);
        }

        if let Some(buffer) = &mut self.reversed_buffer {
            if buffer.is_none() {
                let mut all = Vec::new();
                while let Some(row) = self.rows.next_row()? {
                    all.push(row);
                }
                all.reverse();
                *buffer = Some(all);
            }
            let buffered = buffer.as_mut().expect("just filled");
            let take = n.min(buffered.len());
            return Ok(buffered.drain(..take).collect());
        }

        let mut results = Vec::with_capacity(n);
        while results.len() < n {
            match self.rows.next_row()? {
                Some(row) => match self.batch {
                    None => results.push(row),
                    Some(batch) => {
                        for chunk in row.cells.chunks(batch) {
                            results.push(RowResult {
                                row: row.row.clone(),
                                cells: chunk.to_vec(),
                            });
                        }
                    }
                },
                None => break,
            }
        }
        Ok(results)
    }

    /// Requests cancellation; checked at `next` boundaries.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn close(&mut self) {
        self.cancel();
        self.closed = true;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests;
