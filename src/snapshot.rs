//! Region snapshots: an immutable reference set, no data copy.
//!
//! Taking a snapshot flushes the region and records its current file ids
//! in a checksummed manifest under `snapshots/<name>/`. Clone and restore
//! materialize a new region whose stores reference the snapshot's files;
//! the first compaction rewrites them into concrete files, exactly like a
//! split daughter.
//!
//! A manifest that fails its checksum, or that references files no longer
//! present, surfaces as `CorruptedSnapshot` and leaves nothing behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::{snapshots_dir, ReferenceFile, ReferenceSide, RegionFileSystem};
use crate::region::info::RegionInfo;
use crate::region::Region;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MANIFEST_FILE: &str = "manifest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyFiles {
    pub family: Vec<u8>,
    pub file_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub name: String,
    pub region: RegionInfo,
    pub families: Vec<FamilyFiles>,
    pub created_at: u64,
}

fn manifest_path(root: &Path, name: &str) -> PathBuf {
    snapshots_dir(root).join(name).join(MANIFEST_FILE)
}

fn write_manifest(root: &Path, manifest: &SnapshotManifest) -> Result<()> {
    use std::io::Write;
    let dir = snapshots_dir(root).join(&manifest.name);
    std::fs::create_dir_all(&dir)?;
    let bytes = bincode::serialize(manifest)?;
    let mut framed = Vec::with_capacity(bytes.len() + 8);
    framed.write_u32::<BigEndian>(bytes.len() as u32)?;
    framed.extend_from_slice(&bytes);
    framed.write_u32::<BigEndian>(CRC32.checksum(&bytes))?;

    let staged = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let mut file = std::fs::File::create(&staged)?;
    file.write_all(&framed)?;
    file.sync_all()?;
    std::fs::rename(&staged, dir.join(MANIFEST_FILE))?;
    Ok(())
}

fn read_manifest(root: &Path, name: &str) -> Result<SnapshotManifest> {
    let path = manifest_path(root, name);
    let bytes = std::fs::read(&path)
        .map_err(|_| Error::CorruptedSnapshot(format!("missing manifest for {name:?}")))?;
    let mut cursor = std::io::Cursor::new(bytes.as_slice());
    let corrupt = || Error::CorruptedSnapshot(format!("truncated manifest for {name:?}"));

    let len = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
    if bytes.len() < 4 + len + 4 {
        return Err(corrupt());
    }
    let payload = &bytes[4..4 + len];
    let stored_crc = (&bytes[4 + len..]).read_u32::<BigEndian>().map_err(|_| corrupt())?;
    let computed = CRC32.checksum(payload);
    if computed != stored_crc {
        return Err(Error::CorruptedSnapshot(format!(
            "manifest checksum mismatch for {name:?}"
        )));
    }
    bincode::deserialize(payload)
        .map_err(|e| Error::CorruptedSnapshot(format!("undecodable manifest for {name:?}: {e}")))
}

/// Flushes the region and records its file set under `name`.
pub fn take_snapshot(region: &Arc<Region>, name: &str) -> Result<SnapshotManifest> {
    if !region.config().snapshot_enabled {
        return Err(Error::InvalidInput("snapshots are disabled".to_string()));
    }
    region.flush()?;

    let mut families = Vec::new();
    for (family, store) in region.stores() {
        if store.has_references() {
            return Err(Error::InvalidInput(
                "cannot snapshot a region that still has references".to_string(),
            ));
        }
        families.push(FamilyFiles {
            family: family.clone(),
            file_ids: store.files().iter().map(|f| f.id).collect(),
        });
    }

    let manifest = SnapshotManifest {
        name: name.to_string(),
        region: region.info().clone(),
        families,
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64),
    };
    write_manifest(region.config().root_dir.as_path(), &manifest)?;
    tracing::info!(snapshot = name, "took region snapshot");
    Ok(manifest)
}

/// Verifies a snapshot: manifest checksum and presence of every referenced
/// file.
pub fn verify_snapshot(root: &Path, name: &str) -> Result<SnapshotManifest> {
    let manifest = read_manifest(root, name)?;
    let source_fs = RegionFileSystem::new(root, &manifest.region);
    for family in &manifest.families {
        for file_id in &family.file_ids {
            let path = source_fs.store_file_path(&family.family, *file_id);
            if !path.exists() {
                return Err(Error::CorruptedSnapshot(format!(
                    "snapshot {name:?} references missing file {file_id}"
                )));
            }
        }
    }
    Ok(manifest)
}

/// Materializes a snapshot as a new region of `table`. The new region
/// holds references into the snapshot's files; nothing is copied. On any
/// failure no region directory survives.
pub fn clone_snapshot(root: &Path, name: &str, table: &str) -> Result<RegionInfo> {
    let manifest = verify_snapshot(root, name)?;
    let source = &manifest.region;

    let cloned_info = RegionInfo::new(
        source.namespace.clone(),
        table,
        source.start_key.clone(),
        source.end_key.clone(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64),
    );
    let cloned_fs = RegionFileSystem::new(root, &cloned_info);

    let result = (|| {
        let family_names: Vec<Vec<u8>> =
            manifest.families.iter().map(|f| f.family.clone()).collect();
        cloned_fs.create(&cloned_info, &family_names)?;
        for family in &manifest.families {
            for file_id in &family.file_ids {
                cloned_fs.create_reference_file(
                    &family.family,
                    &ReferenceFile {
                        parent_namespace: source.namespace.clone(),
                        parent_table: source.table.clone(),
                        parent_region: source.encoded_name(),
                        parent_file_id: *file_id,
                        split_row: source.start_key.clone(),
                        side: ReferenceSide::Top,
                    },
                )?;
            }
        }
        Ok::<_, Error>(())
    })();

    if let Err(e) = result {
        let _ = cloned_fs.remove_region_dir();
        return Err(e);
    }
    tracing::info!(snapshot = name, table, "cloned snapshot");
    Ok(cloned_info)
}

/// Restores a snapshot under its original table: a fresh region built from
/// the recorded file set, superseding the current one.
pub fn restore_snapshot(root: &Path, name: &str) -> Result<RegionInfo> {
    let table = read_manifest(root, name)?.region.table.clone();
    clone_snapshot(root, name, &table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::cell::Cell;
    use crate::config::{EngineConfig, FamilyConfig};
    use crate::fs;
    use crate::hooks::ObserverChain;
    use crate::region::{GetOptions, MemoryAccountant, ScanOptions};
    use crate::wal::{Durability, Wal};
    use tempfile::tempdir;

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
            let wal =
                Arc::new(Wal::open(&fs::wals_dir(dir.path()), config.wal_roll_size).unwrap());
            Self {
                _dir: dir,
                config,
                cache: Arc::new(BlockCache::new(4 << 20)),
                wal,
                memory: Arc::new(MemoryAccountant::new(1 << 30)),
            }
        }

        fn region(&self, info: RegionInfo) -> Arc<Region> {
            Region::create(
                info,
                vec![FamilyConfig::new("f")],
                self.config.clone(),
                self.cache.clone(),
                self.wal.clone(),
                self.memory.clone(),
                ObserverChain::new(false),
            )
            .unwrap()
        }

        fn open_region(&self, info: RegionInfo) -> Arc<Region> {
            Region::open(
                info,
                vec![FamilyConfig::new("f")],
                self.config.clone(),
                self.cache.clone(),
                self.wal.clone(),
                self.memory.clone(),
                ObserverChain::new(false),
            )
            .unwrap()
        }
    }

    fn load_rows(region: &Arc<Region>, count: usize, offset: usize) {
        for i in 0..count {
            let row = format!("row{:05}", i + offset);
            region
                .put(
                    row.as_bytes(),
                    vec![Cell::put(row.clone(), "f", "q", 1, "v")],
                    Durability::SyncWal,
                )
                .unwrap();
        }
    }

    fn count_rows(region: &Arc<Region>) -> usize {
        let mut scanner = region.scan(ScanOptions::default()).unwrap();
        let mut count = 0;
        loop {
            let rows = region.scanner_next(&mut scanner, 100).unwrap();
            if rows.is_empty() {
                break;
            }
            count += rows.len();
        }
        count
    }

    #[test]
    fn test_snapshot_clone_counts() {
        let fixture = Fixture::new();
        let info = RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1);
        let region = fixture.region(info);

        // Empty snapshot.
        take_snapshot(&region, "s0").unwrap();

        // 500 rows, snapshot, then 500 more.
        load_rows(&region, 500, 0);
        take_snapshot(&region, "s1").unwrap();
        load_rows(&region, 500, 500);
        assert_eq!(count_rows(&region), 1000);

        // Restore S0: empty.
        let restored0 = restore_snapshot(fixture.config.root_dir.as_path(), "s0").unwrap();
        let restored0 = fixture.open_region(restored0);
        assert_eq!(count_rows(&restored0), 0);

        // Restore S1: exactly the first load.
        let restored1 = restore_snapshot(fixture.config.root_dir.as_path(), "s1").unwrap();
        let restored1 = fixture.open_region(restored1);
        assert_eq!(count_rows(&restored1), 500);

        // Clone S1 under a new table name: same count.
        let cloned = clone_snapshot(fixture.config.root_dir.as_path(), "s1", "t_clone").unwrap();
        assert_eq!(cloned.table, "t_clone");
        let cloned = fixture.open_region(cloned);
        assert_eq!(count_rows(&cloned), 500);
        assert!(cloned.has_references(b"f").unwrap());

        // The clone reads its own data after compaction too.
        cloned.compact(true).unwrap();
        assert!(!cloned.has_references(b"f").unwrap());
        assert_eq!(count_rows(&cloned), 500);
    }

    #[test]
    fn test_corrupt_manifest_rejected_and_no_clone_left() {
        let fixture = Fixture::new();
        let info = RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1);
        let region = fixture.region(info);
        load_rows(&region, 10, 0);
        take_snapshot(&region, "s1").unwrap();

        // Corrupt the manifest payload.
        let path = manifest_path(fixture.config.root_dir.as_path(), "s1");
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = clone_snapshot(fixture.config.root_dir.as_path(), "s1", "t_clone");
        assert!(matches!(result, Err(Error::CorruptedSnapshot(_))));

        // No cloned table directory survives.
        let table_dir = fixture.config.root_dir.join("data").join("default").join("t_clone");
        assert!(!table_dir.exists());
    }

    #[test]
    fn test_snapshot_disabled() {
        let dir = tempdir().unwrap();
        let mut engine_config = EngineConfig::new(dir.path());
        engine_config.snapshot_enabled = false;
        let config = Arc::new(engine_config);
        let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), u64::MAX).unwrap());
        let region = Region::create(
            RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1),
            vec![FamilyConfig::new("f")],
            config,
            Arc::new(BlockCache::new(1 << 20)),
            wal,
            Arc::new(MemoryAccountant::new(1 << 30)),
            ObserverChain::new(false),
        )
        .unwrap();
        assert!(matches!(
            take_snapshot(&region, "s"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_referenced_file_is_corrupt() {
        let fixture = Fixture::new();
        let info = RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1);
        let region = fixture.region(info);
        load_rows(&region, 10, 0);
        take_snapshot(&region, "s1").unwrap();

        // Delete the flushed file out from under the snapshot.
        let (_, store) = region.stores().next().unwrap();
        for file in store.files() {
            std::fs::remove_file(&file.path).unwrap();
        }

        assert!(matches!(
            verify_snapshot(fixture.config.root_dir.as_path(), "s1"),
            Err(Error::CorruptedSnapshot(_))
        ));
    }
}
