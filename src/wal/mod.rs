//! Node-wide write-ahead log.
//!
//! All regions on a node append to one log. Each record carries the region's
//! encoded name, a per-region strictly increasing sequence number, and the
//! edit's cells. Files roll on size, on a period (even with zero write
//! traffic), or on request; rolled files become archivable once every region
//! whose edits they hold has flushed past the file's last sequence.
//!
//! # File format
//!
//! ```text
//! +--------------------------+
//! | Header (28 bytes)        |  magic, version, writer id, created-at
//! +--------------------------+
//! | Record 1                 |
//! +--------------------------+
//! | ...                      |
//! +--------------------------+
//! ```
//!
//! ## Record format
//!
//! ```text
//! +-----------+---------------------------------------------+-----------+
//! |len:u32    | payload                                     | crc32:u32 |
//! +-----------+---------------------------------------------+-----------+
//!             | kind:u8 | region_len:u16 | region | seq:u64 |
//!             | write_time:u64 | cell_count:u32 | cells...  |
//! ```
//!
//! Readers skip record kinds they do not recognize (compaction markers are
//! one such kind), so scope computation never trips over control records.

pub mod replay;

pub use replay::{WalReplayer, WalRecord};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::cell::Cell;
use crate::error::Result;
use crate::Error;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const WAL_MAGIC: &[u8; 8] = b"MESAWAL\0";
pub const WAL_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 28;

/// Record kinds. Unknown codes are skipped by readers.
pub const RECORD_EDIT: u8 = 1;
pub const RECORD_COMPACTION_MARKER: u8 = 2;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// How durable an acknowledged write is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Not appended to the log at all. The write survives only in memory.
    SkipWal,
    /// Appended to the writer buffer; no sync before the ack.
    AsyncWal,
    /// Appended and flushed with a data sync.
    SyncWal,
    /// Appended and flushed with a data+metadata sync.
    FsyncWal,
}

/// Callbacks around log lifecycle events. The replication tap and tests
/// register here.
pub trait WalActionsListener: Send + Sync {
    fn pre_roll(&self, _old: &Path, _new: &Path) {}
    fn post_roll(&self, _old: &Path, _new: &Path) {}
    fn post_append(&self, _record: &WalRecord) {}
}

struct CurrentFile {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    id: u64,
    size: u64,
}

impl CurrentFile {
    fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(format!("{id}.wal"));
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file.try_clone()?);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(WAL_MAGIC);
        header.write_u32::<BigEndian>(WAL_VERSION)?;
        header.write_u64::<BigEndian>(id)?;
        header.write_u64::<BigEndian>(unix_millis())?;
        writer.write_all(&header)?;
        writer.flush()?;
        file.sync_all()?;

        Ok(Self {
            file,
            writer,
            path,
            id,
            size: HEADER_SIZE as u64,
        })
    }
}

pub struct Wal {
    dir: PathBuf,
    current: Mutex<CurrentFile>,
    next_id: AtomicU64,
    /// Last assigned sequence per region, strictly increasing across files.
    sequences: Mutex<HashMap<Vec<u8>, u64>>,
    listeners: RwLock<Vec<std::sync::Arc<dyn WalActionsListener>>>,
    last_roll: Mutex<Instant>,
    roll_count: AtomicU64,
    roll_size: u64,
    aborted: AtomicBool,
}

impl Wal {
    pub fn open(dir: &Path, roll_size: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        // Resume after the highest existing file id.
        let mut max_id = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(id) = wal_file_id(&entry.path()) {
                max_id = max_id.max(id);
            }
        }
        let id = max_id + 1;
        let current = CurrentFile::create(dir, id)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            current: Mutex::new(current),
            next_id: AtomicU64::new(id + 1),
            sequences: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            last_roll: Mutex::new(Instant::now()),
            roll_count: AtomicU64::new(0),
            roll_size,
            aborted: AtomicBool::new(false),
        })
    }

    pub fn register_listener(&self, listener: std::sync::Arc<dyn WalActionsListener>) {
        self.listeners.write().expect("listener lock").push(listener);
    }

    /// True after an append failure; the node must abort affected regions.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn roll_count(&self) -> u64 {
        self.roll_count.load(Ordering::SeqCst)
    }

    pub fn current_path(&self) -> PathBuf {
        self.current.lock().expect("wal lock").path.clone()
    }

    /// Restores a region's sequence counter during recovery so new writes
    /// continue above everything already on disk.
    pub fn advance_sequence(&self, region: &[u8], sequence: u64) {
        let mut sequences = self.sequences.lock().expect("sequence lock");
        let entry = sequences.entry(region.to_vec()).or_insert(0);
        *entry = (*entry).max(sequence);
    }

    /// Appends one edit, returning its sequence. With `SkipWal` the sequence
    /// advances but nothing is written; the caller tracks the non-durable
    /// bytes. The ack only happens after the promised durability.
    pub fn append(
        &self,
        region: &[u8],
        cells: &[Cell],
        durability: Durability,
    ) -> Result<u64> {
        if self.is_aborted() {
            return Err(Error::Io("wal is aborted".to_string()));
        }

        let sequence = {
            let mut sequences = self.sequences.lock().expect("sequence lock");
            let entry = sequences.entry(region.to_vec()).or_insert(0);
            *entry += 1;
            *entry
        };

        if durability == Durability::SkipWal {
            return Ok(sequence);
        }

        let record = WalRecord {
            kind: RECORD_EDIT,
            region: region.to_vec(),
            sequence,
            write_time: unix_millis(),
            cells: cells.to_vec(),
            payload: Vec::new(),
        };

        let result = self.write_record(&record, durability);
        if let Err(e) = &result {
            // A failed append means edits of unknown durability; fatal.
            self.aborted.store(true, Ordering::SeqCst);
            tracing::error!(error = %e, "wal append failed, aborting");
            return result.map(|_| sequence);
        }

        for listener in self.listeners.read().expect("listener lock").iter() {
            listener.post_append(&record);
        }

        self.maybe_roll_for_size()?;
        Ok(sequence)
    }

    /// Appends a compaction marker naming the store and the replaced files.
    /// Markers are control records: replication and scope computation skip
    /// them.
    pub fn append_compaction_marker(
        &self,
        region: &[u8],
        family: &[u8],
        replaced_file_ids: &[u64],
    ) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u16::<BigEndian>(family.len() as u16)?;
        payload.extend_from_slice(family);
        payload.write_u32::<BigEndian>(replaced_file_ids.len() as u32)?;
        for id in replaced_file_ids {
            payload.write_u64::<BigEndian>(*id)?;
        }
        let record = WalRecord {
            kind: RECORD_COMPACTION_MARKER,
            region: region.to_vec(),
            sequence: 0,
            write_time: unix_millis(),
            cells: Vec::new(),
            payload,
        };
        self.write_record(&record, Durability::AsyncWal)
    }

    fn write_record(&self, record: &WalRecord, durability: Durability) -> Result<()> {
        let payload = record.encode()?;
        let checksum = CRC32.checksum(&payload);

        let mut current = self.current.lock().expect("wal lock");
        current.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        current.writer.write_all(&payload)?;
        current.writer.write_u32::<BigEndian>(checksum)?;
        current.size += 4 + payload.len() as u64 + 4;

        match durability {
            Durability::SkipWal | Durability::AsyncWal => {}
            Durability::SyncWal => {
                current.writer.flush()?;
                current.file.sync_data()?;
            }
            Durability::FsyncWal => {
                current.writer.flush()?;
                current.file.sync_all()?;
            }
        }
        Ok(())
    }

    /// Blocks until everything appended so far is durable.
    pub fn sync(&self) -> Result<()> {
        let mut current = self.current.lock().expect("wal lock");
        current.writer.flush()?;
        current.file.sync_all()?;
        Ok(())
    }

    /// Closes the current file and opens a new one. Returns (old, new).
    pub fn roll(&self) -> Result<(PathBuf, PathBuf)> {
        let next_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let new_path = self.dir.join(format!("{next_id}.wal"));

        let old_path = {
            let current = self.current.lock().expect("wal lock");
            current.path.clone()
        };
        for listener in self.listeners.read().expect("listener lock").iter() {
            listener.pre_roll(&old_path, &new_path);
        }

        {
            let mut current = self.current.lock().expect("wal lock");
            current.writer.flush()?;
            current.file.sync_all()?;
            *current = CurrentFile::create(&self.dir, next_id)?;
        }
        *self.last_roll.lock().expect("roll lock") = Instant::now();
        self.roll_count.fetch_add(1, Ordering::SeqCst);

        for listener in self.listeners.read().expect("listener lock").iter() {
            listener.post_roll(&old_path, &new_path);
        }
        tracing::info!(old = %old_path.display(), new = %new_path.display(), "rolled wal");
        Ok((old_path, new_path))
    }

    fn maybe_roll_for_size(&self) -> Result<()> {
        let over = {
            let current = self.current.lock().expect("wal lock");
            current.size >= self.roll_size
        };
        if over {
            self.roll()?;
        }
        Ok(())
    }

    /// Rolls when the configured period has elapsed since the last roll.
    /// The background ticker calls this so idle nodes still roll.
    pub fn roll_if_due(&self, period: std::time::Duration) -> Result<bool> {
        let due = {
            let last = self.last_roll.lock().expect("roll lock");
            last.elapsed() >= period
        };
        if due {
            self.roll()?;
        }
        Ok(due)
    }

    /// Rolled files whose every region has flushed past the file's last
    /// sequence. A file holding only control records has no sequences and is
    /// immediately archivable.
    pub fn archivable_files(
        &self,
        min_unflushed: &HashMap<Vec<u8>, u64>,
    ) -> Result<Vec<PathBuf>> {
        let current_id = self.current.lock().expect("wal lock").id;
        let mut archivable = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(id) = wal_file_id(&path) else {
                continue;
            };
            if id >= current_id {
                continue;
            }
            let scope = scope_of(&path)?;
            let done = scope.iter().all(|(region, last_seq)| {
                min_unflushed.get(region).is_some_and(|min| *min > *last_seq)
            });
            if done {
                archivable.push(path);
            }
        }
        Ok(archivable)
    }

    /// Paths of every rolled (non-current) file, oldest first.
    pub fn rolled_files(&self) -> Result<Vec<PathBuf>> {
        let current_id = self.current.lock().expect("wal lock").id;
        let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let id = wal_file_id(&path)?;
                (id < current_id).then_some((id, path))
            })
            .collect();
        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }
}

/// Largest edit sequence per region in one file. Control records and
/// unrecognized kinds are skipped.
pub fn scope_of(path: &Path) -> Result<HashMap<Vec<u8>, u64>> {
    let mut scope = HashMap::new();
    for record in WalReplayer::open(path)? {
        let record = record?;
        if record.kind != RECORD_EDIT {
            continue;
        }
        let entry = scope.entry(record.region.clone()).or_insert(0u64);
        *entry = (*entry).max(record.sequence);
    }
    Ok(scope)
}

fn wal_file_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_suffix(".wal")?;
    id.parse().ok()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn edit(row: &str, value: &str) -> Vec<Cell> {
        vec![Cell::put(row, "f", "q", 1, value)]
    }

    #[test]
    fn test_append_assigns_increasing_sequences() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        let s1 = wal.append(b"region-a", &edit("r1", "v1"), Durability::AsyncWal).unwrap();
        let s2 = wal.append(b"region-a", &edit("r2", "v2"), Durability::AsyncWal).unwrap();
        let s3 = wal.append(b"region-b", &edit("r1", "v1"), Durability::AsyncWal).unwrap();

        assert_eq!((s1, s2), (1, 2));
        assert_eq!(s3, 1);
    }

    #[test]
    fn test_skip_wal_not_written() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        wal.append(b"r", &edit("r1", "v1"), Durability::SkipWal).unwrap();
        wal.append(b"r", &edit("r2", "v2"), Durability::SyncWal).unwrap();

        let records: Vec<WalRecord> = WalReplayer::open(&wal.current_path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cells[0].key.row, b"r2");
        // The skipped write still consumed a sequence.
        assert_eq!(records[0].sequence, 2);
    }

    #[test]
    fn test_replay_roundtrip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        for i in 0..10 {
            wal.append(
                b"region-a",
                &edit(&format!("row{i}"), &format!("v{i}")),
                Durability::AsyncWal,
            )
            .unwrap();
        }
        wal.sync().unwrap();

        let records: Vec<WalRecord> = WalReplayer::open(&wal.current_path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, i as u64 + 1);
            assert_eq!(record.cells[0].key.row, format!("row{i}").as_bytes());
        }
    }

    struct CountingListener {
        pre: AtomicUsize,
        post: AtomicUsize,
        appends: AtomicUsize,
    }

    impl WalActionsListener for CountingListener {
        fn pre_roll(&self, _old: &Path, _new: &Path) {
            self.pre.fetch_add(1, Ordering::SeqCst);
        }
        fn post_roll(&self, _old: &Path, _new: &Path) {
            self.post.fetch_add(1, Ordering::SeqCst);
        }
        fn post_append(&self, _record: &WalRecord) {
            self.appends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_roll_notifies_listeners() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();
        let listener = Arc::new(CountingListener {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
        });
        wal.register_listener(listener.clone());

        wal.append(b"r", &edit("a", "1"), Durability::AsyncWal).unwrap();
        let (old, new) = wal.roll().unwrap();
        assert_ne!(old, new);
        wal.append(b"r", &edit("b", "2"), Durability::AsyncWal).unwrap();

        assert_eq!(listener.pre.load(Ordering::SeqCst), 1);
        assert_eq!(listener.post.load(Ordering::SeqCst), 1);
        assert_eq!(listener.appends.load(Ordering::SeqCst), 2);
        assert_eq!(wal.roll_count(), 1);

        // Sequences keep increasing across the roll.
        let records: Vec<WalRecord> = WalReplayer::open(&wal.current_path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records[0].sequence, 2);
    }

    #[test]
    fn test_size_roll() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), 256).unwrap();
        for i in 0..20 {
            wal.append(b"r", &edit(&format!("row{i}"), "some value bytes"), Durability::AsyncWal)
                .unwrap();
        }
        assert!(wal.roll_count() > 0);
    }

    #[test]
    fn test_period_roll_when_idle() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        assert!(!wal.roll_if_due(std::time::Duration::from_secs(3600)).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(wal.roll_if_due(std::time::Duration::from_millis(10)).unwrap());
        assert_eq!(wal.roll_count(), 1);
    }

    #[test]
    fn test_archival_scope() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        for _ in 0..5 {
            wal.append(b"region-a", &edit("r", "v"), Durability::SyncWal).unwrap();
        }
        let (old, _) = wal.roll().unwrap();

        // Not archivable while region-a has unflushed edits at or below 5.
        let mut min_unflushed = HashMap::new();
        min_unflushed.insert(b"region-a".to_vec(), 5u64);
        assert!(wal.archivable_files(&min_unflushed).unwrap().is_empty());

        // Flushed past sequence 5: the rolled file is archivable.
        min_unflushed.insert(b"region-a".to_vec(), 6u64);
        let archivable = wal.archivable_files(&min_unflushed).unwrap();
        assert_eq!(archivable, vec![old]);
    }

    #[test]
    fn test_marker_only_file_immediately_archivable() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        wal.append_compaction_marker(b"region-a", b"f", &[1, 2, 3]).unwrap();
        wal.sync().unwrap();
        let (old, _) = wal.roll().unwrap();

        let archivable = wal.archivable_files(&HashMap::new()).unwrap();
        assert_eq!(archivable, vec![old]);
    }

    #[test]
    fn test_compaction_marker_skipped_by_scope() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();

        wal.append(b"region-a", &edit("r", "v"), Durability::AsyncWal).unwrap();
        wal.append_compaction_marker(b"region-a", b"f", &[9]).unwrap();
        wal.sync().unwrap();

        let scope = scope_of(&wal.current_path()).unwrap();
        assert_eq!(scope.get(b"region-a".as_slice()), Some(&1));
    }
}
