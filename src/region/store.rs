//! Per-family store: one MemBuffer plus the immutable sorted file set.
//!
//! Files are held newest-first by max WAL sequence. Flush turns the
//! buffer's snapshot into a new file committed through the region file
//! system; compaction merges a ratio-bounded suffix of the file set (minor)
//! or everything (major, which alone may drop tombstones).
//!
//! The store borrows its surroundings through [`StoreContext`] at call time
//! and keeps no pointer back to the region.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::BlockCache;
use crate::cell::{Cell, CellKey};
use crate::config::{EngineConfig, FamilyConfig};
use crate::error::Result;
use crate::fs::{ReferenceFile, ReferenceSide, RegionFileSystem};
use crate::membuffer::MemBuffer;
use crate::region::scanner::{CellIter, MergeScanner, PolicyScanner, VersionPolicy};
use crate::sortedfile::{SortedFileReader, SortedFileWriter};
use crate::Error;

/// Call-time surroundings a store operation needs.
pub struct StoreContext<'a> {
    pub fs: &'a RegionFileSystem,
    pub cache: &'a Arc<BlockCache>,
    pub config: &'a EngineConfig,
    pub next_file_id: &'a AtomicU64,
}

/// One member of the file set: a concrete file, or a reference to half of a
/// parent region's file left behind by a split or merge.
pub struct StoreFile {
    pub id: u64,
    pub reader: Arc<SortedFileReader>,
    pub path: PathBuf,
    pub reference: Option<ReferenceFile>,
}

impl StoreFile {
    pub fn max_sequence(&self) -> u64 {
        self.reader.max_sequence()
    }

    pub fn file_size(&self) -> u64 {
        self.reader.file_size()
    }
}

pub struct Store {
    family: FamilyConfig,
    buffer: MemBuffer,
    /// Newest first by max sequence.
    files: RwLock<Vec<Arc<StoreFile>>>,
    compacting: AtomicBool,
}

/// At most one compaction runs per store at a time.
pub struct CompactionGuard<'a> {
    store: &'a Store,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.store.compacting.store(false, Ordering::SeqCst);
    }
}

impl Store {
    pub fn new(family: FamilyConfig) -> Self {
        Self {
            family,
            buffer: MemBuffer::new(),
            files: RwLock::new(Vec::new()),
            compacting: AtomicBool::new(false),
        }
    }

    /// Opens the store from its family directory: concrete files and any
    /// reference files a split or merge left behind.
    pub fn open(family: FamilyConfig, ctx: &StoreContext) -> Result<Self> {
        let store = Self::new(family);
        {
            let mut files = store.files.write().expect("store lock");
            for (id, path) in ctx.fs.list_store_files(&store.family.name)? {
                let reader = Arc::new(SortedFileReader::open(
                    &path,
                    id,
                    &store.family,
                    ctx.cache.clone(),
                    ctx.config.cache_force_important,
                )?);
                ctx.next_file_id.fetch_max(id + 1, Ordering::SeqCst);
                files.push(Arc::new(StoreFile {
                    id,
                    reader,
                    path,
                    reference: None,
                }));
            }
            for (path, reference) in ctx.fs.list_reference_files(&store.family.name)? {
                let parent_path = reference.parent_path(ctx.fs.root(), &store.family.name);
                let reader = Arc::new(SortedFileReader::open(
                    &parent_path,
                    reference.parent_file_id,
                    &store.family,
                    ctx.cache.clone(),
                    ctx.config.cache_force_important,
                )?);
                files.push(Arc::new(StoreFile {
                    id: reference.parent_file_id,
                    reader,
                    path,
                    reference: Some(reference),
                }));
            }
            files.sort_by_key(|f| std::cmp::Reverse(f.max_sequence()));
        }
        Ok(store)
    }

    pub fn family(&self) -> &FamilyConfig {
        &self.family
    }

    pub fn buffer(&self) -> &MemBuffer {
        &self.buffer
    }

    pub fn insert(&self, cell: Cell, mvcc: u64, sequence: u64, skip_wal: bool) {
        self.buffer.insert(cell, mvcc, sequence, skip_wal);
    }

    pub fn file_count(&self) -> usize {
        self.files.read().expect("store lock").len()
    }

    pub fn files(&self) -> Vec<Arc<StoreFile>> {
        self.files.read().expect("store lock").clone()
    }

    pub fn has_references(&self) -> bool {
        self.files
            .read()
            .expect("store lock")
            .iter()
            .any(|f| f.reference.is_some())
    }

    /// Smallest WAL sequence still unflushed, `u64::MAX` when none.
    pub fn min_unflushed_sequence(&self) -> u64 {
        self.buffer.min_unflushed_sequence()
    }

    /// Largest WAL sequence already persisted in a file.
    pub fn max_flushed_sequence(&self) -> u64 {
        self.files
            .read()
            .expect("store lock")
            .iter()
            .map(|f| f.max_sequence())
            .max()
            .unwrap_or(0)
    }

    /// Publishes the MemBuffer snapshot as a new sorted file. Returns the
    /// new file id, or None when there was nothing to flush. A failed flush
    /// leaves the WAL as the source of truth and surfaces the error; the
    /// region aborts on it.
    pub fn flush(&self, ctx: &StoreContext) -> Result<Option<u64>> {
        let snapshot = self.buffer.snapshot_for_flush()?;
        if snapshot.cell_count() == 0 {
            self.buffer.clear_snapshot();
            return Ok(None);
        }

        let result = (|| {
            let file_id = ctx.next_file_id.fetch_add(1, Ordering::SeqCst);
            let staged = ctx.fs.staging_path(file_id);
            let mut writer = SortedFileWriter::new(
                &staged,
                file_id,
                &self.family,
                ctx.config.format_version,
                ctx.config.index_max_chunk_size,
            )?;
            writer.set_max_sequence(snapshot.max_sequence());
            for cell in snapshot.scan_from(&CellKey::first_on_row(vec![])) {
                writer.append(&cell?)?;
            }
            let finished = writer.finish()?;
            let path = ctx.fs.commit_store_file(&self.family.name, &staged, file_id)?;

            let reader = Arc::new(SortedFileReader::open(
                &path,
                file_id,
                &self.family,
                ctx.cache.clone(),
                ctx.config.cache_force_important,
            )?);
            Ok::<_, Error>((file_id, path, reader, finished.entry_count))
        })();

        match result {
            Ok((file_id, path, reader, cells)) => {
                let mut files = self.files.write().expect("store lock");
                files.insert(
                    0,
                    Arc::new(StoreFile {
                        id: file_id,
                        reader,
                        path,
                        reference: None,
                    }),
                );
                files.sort_by_key(|f| std::cmp::Reverse(f.max_sequence()));
                drop(files);
                self.buffer.clear_snapshot();
                tracing::info!(
                    family = %String::from_utf8_lossy(&self.family.name),
                    file_id,
                    cells,
                    "flushed membuffer"
                );
                Ok(Some(file_id))
            }
            Err(e) => {
                // Keep the snapshot readable until the region aborts.
                self.buffer.restore_snapshot();
                Err(e)
            }
        }
    }

    /// Minor compaction selection: a contiguous suffix (newest toward
    /// older) where no file exceeds `ratio` times the sum of the smaller
    /// selected files, within the count bounds. Reference files force a
    /// full selection so they get rewritten into concrete files.
    pub fn select_compaction(&self, config: &EngineConfig) -> Vec<Arc<StoreFile>> {
        let files = self.files.read().expect("store lock");
        if files.iter().any(|f| f.reference.is_some()) {
            return files.clone();
        }
        if files.len() < config.compaction_threshold.max(2) {
            return Vec::new();
        }

        // Suffixes start at each position and run to the oldest file.
        for start in 0..files.len() {
            let mut window: Vec<Arc<StoreFile>> = files[start..].to_vec();
            if window.len() > config.compaction_max_files {
                // Clip toward the oldest end.
                let excess = window.len() - config.compaction_max_files;
                window.drain(..excess);
            }
            if window.len() < config.compaction_threshold.max(2) {
                break;
            }
            let fits = window.iter().all(|file| {
                let smaller_sum: u64 = window
                    .iter()
                    .filter(|other| other.file_size() < file.file_size())
                    .map(|other| other.file_size())
                    .sum();
                window.len() == 1
                    || file.file_size() as f64 <= config.compaction_ratio * smaller_sum as f64
                    || file.file_size()
                        <= window
                            .iter()
                            .map(|f| f.file_size())
                            .min()
                            .unwrap_or(0)
            });
            if fits {
                return window;
            }
        }
        Vec::new()
    }

    /// Tries to claim the store's single compaction slot.
    pub fn begin_compaction(&self) -> Option<CompactionGuard<'_>> {
        if self.compacting.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(CompactionGuard { store: self })
        }
    }

    /// Merges `selection` into one new file. Minor compactions retain
    /// tombstones (an older, unselected file may still hold cells they
    /// mask); a major compaction covers every file and drops them.
    ///
    /// Returns (new file id, replaced file ids).
    pub fn compact(
        &self,
        ctx: &StoreContext,
        selection: Vec<Arc<StoreFile>>,
        major: bool,
    ) -> Result<(u64, Vec<u64>)> {
        if selection.is_empty() {
            return Err(Error::InvalidInput("empty compaction selection".to_string()));
        }
        let all_files = selection.len() == self.file_count();
        let drops_tombstones = major && all_files;

        let mut sources: Vec<CellIter> = Vec::with_capacity(selection.len());
        for file in &selection {
            sources.push(file_scanner(file, &CellKey::first_on_row(vec![]), true)?);
        }
        let merge = MergeScanner::new(sources, None)?;
        let policy = VersionPolicy {
            max_versions: self.family.max_versions.max(1),
            ttl_floor: self.ttl_floor(),
            time_range: None,
            retain_deletes: !drops_tombstones,
        };
        let mut cells = PolicyScanner::new(merge, policy);

        let file_id = ctx.next_file_id.fetch_add(1, Ordering::SeqCst);
        let staged = ctx.fs.staging_path(file_id);
        let result = (|| {
            let mut writer = SortedFileWriter::new(
                &staged,
                file_id,
                &self.family,
                ctx.config.format_version,
                ctx.config.index_max_chunk_size,
            )?;
            let max_sequence = selection.iter().map(|f| f.max_sequence()).max().unwrap_or(0);
            writer.set_max_sequence(max_sequence);
            for cell in &mut cells {
                writer.append(&cell?)?;
            }
            writer.finish()?;
            ctx.fs.commit_store_file(&self.family.name, &staged, file_id)
        })();

        let path = match result {
            Ok(path) => path,
            Err(e) => {
                // Recoverable: discard partial output, leave the set as-is.
                let _ = std::fs::remove_file(&staged);
                return Err(e);
            }
        };

        let reader = Arc::new(SortedFileReader::open(
            &path,
            file_id,
            &self.family,
            ctx.cache.clone(),
            ctx.config.cache_force_important,
        )?);

        let replaced: Vec<u64> = selection.iter().map(|f| f.id).collect();
        {
            let mut files = self.files.write().expect("store lock");
            files.retain(|f| !selection.iter().any(|s| Arc::ptr_eq(f, s)));
            files.push(Arc::new(StoreFile {
                id: file_id,
                reader,
                path,
                reference: None,
            }));
            files.sort_by_key(|f| std::cmp::Reverse(f.max_sequence()));
        }

        // Retire the replaced files: references are just unlinked (the
        // parent's file stays until the janitor archives the parent),
        // concrete files move to the archive. Cached blocks die with them.
        for file in &selection {
            ctx.cache.invalidate_file(file.id);
            if file.reference.is_some() {
                let _ = std::fs::remove_file(&file.path);
            } else {
                ctx.fs.archive_store_file(&self.family.name, &file.path)?;
            }
        }

        tracing::info!(
            family = %String::from_utf8_lossy(&self.family.name),
            new_file = file_id,
            replaced = replaced.len(),
            major,
            "compacted store"
        );
        Ok((file_id, replaced))
    }

    fn ttl_floor(&self) -> u64 {
        match self.family.ttl {
            Some(ttl) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_millis() as u64);
                now.saturating_sub(ttl.as_millis() as u64)
            }
            None => 0,
        }
    }

    /// Source iterators for a read starting at `start`: MemBuffer sections
    /// first (newest), then files newest-first.
    pub fn scanners(&self, start: &CellKey, caching: bool) -> Result<Vec<CellIter>> {
        let mut sources: Vec<CellIter> = Vec::new();
        for scanner in self.buffer.scanners(start) {
            sources.push(Box::new(scanner));
        }
        for file in self.files.read().expect("store lock").iter() {
            sources.push(file_scanner(file, start, caching)?);
        }
        Ok(sources)
    }
}

/// A file scanner honoring the reference boundary when the file is a
/// split/merge reference.
fn file_scanner(file: &Arc<StoreFile>, start: &CellKey, caching: bool) -> Result<CellIter> {
    match &file.reference {
        None => Ok(Box::new(file.reader.scan_from(start, caching)?)),
        Some(reference) => {
            let split_row = reference.split_row.clone();
            let side = reference.side;
            let start = match side {
                // The top half begins at the split row.
                ReferenceSide::Top if start.row.as_slice() < split_row.as_slice() => {
                    CellKey::first_on_row(split_row.clone())
                }
                _ => start.clone(),
            };
            let inner = file.reader.scan_from(&start, caching)?;
            Ok(Box::new(inner.filter(move |cell| match cell {
                Ok(cell) => match side {
                    ReferenceSide::Top => cell.key.row.as_slice() >= split_row.as_slice(),
                    ReferenceSide::Bottom => cell.key.row.as_slice() < split_row.as_slice(),
                },
                Err(_) => true,
            })))
        }
    }
}
