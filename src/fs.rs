//! Region directory layout and atomic file placement.
//!
//! ```text
//! <root>/data/<namespace>/<table>/<regionEncodedName>/.regioninfo
//! <root>/data/<namespace>/<table>/<regionEncodedName>/.tmp/<fileId>.mf
//! <root>/data/<namespace>/<table>/<regionEncodedName>/<family>/<fileId>.mf
//! <root>/data/<namespace>/<table>/<regionEncodedName>/<family>/<parentId>.<side>.ref
//! <root>/archive/<namespace>/<table>/<regionEncodedName>/<family>/...
//! <root>/wals/<id>.wal
//! <root>/oldWALs/<id>.wal
//! <root>/snapshots/<name>/...
//! ```
//!
//! Every store file readers can see has passed through a rename from the
//! region's staging directory; partially written files live only under
//! `.tmp`. `.regioninfo` is written once: re-opening a region must not touch
//! it, so its mtime is stable across opens.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::info::RegionInfo;
use crate::Error;

pub const REGION_INFO_FILE: &str = ".regioninfo";
pub const STAGING_DIR: &str = ".tmp";
pub const STORE_FILE_SUFFIX: &str = "mf";
pub const REFERENCE_SUFFIX: &str = "ref";

/// Which half of the parent a reference file covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceSide {
    /// Rows below the split key.
    Bottom,
    /// Rows at or above the split key.
    Top,
}

impl ReferenceSide {
    fn as_str(self) -> &'static str {
        match self {
            ReferenceSide::Bottom => "bottom",
            ReferenceSide::Top => "top",
        }
    }
}

/// A placeholder pointing at half of a parent region's file. Carries the
/// full parent coordinates so a clone under another table still resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFile {
    pub parent_namespace: String,
    pub parent_table: String,
    pub parent_region: String,
    pub parent_file_id: u64,
    pub split_row: Vec<u8>,
    pub side: ReferenceSide,
}

impl ReferenceFile {
    /// The referenced file's concrete path under `root`.
    pub fn parent_path(&self, root: &Path, family: &[u8]) -> PathBuf {
        RegionFileSystem::open(
            root,
            &self.parent_namespace,
            &self.parent_table,
            &self.parent_region,
        )
        .store_file_path(family, self.parent_file_id)
    }
}

pub struct RegionFileSystem {
    root: PathBuf,
    namespace: String,
    table: String,
    encoded_name: String,
}

impl RegionFileSystem {
    pub fn new(root: &Path, info: &RegionInfo) -> Self {
        Self {
            root: root.to_path_buf(),
            namespace: info.namespace.clone(),
            table: info.table.clone(),
            encoded_name: info.encoded_name(),
        }
    }

    pub fn open(root: &Path, namespace: &str, table: &str, encoded_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            namespace: namespace.to_string(),
            table: table.to_string(),
            encoded_name: encoded_name.to_string(),
        }
    }

    pub fn table_dir(&self) -> PathBuf {
        self.root
            .join("data")
            .join(&self.namespace)
            .join(&self.table)
    }

    pub fn region_dir(&self) -> PathBuf {
        self.table_dir().join(&self.encoded_name)
    }

    pub fn family_dir(&self, family: &[u8]) -> PathBuf {
        self.region_dir().join(String::from_utf8_lossy(family).as_ref())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.region_dir().join(STAGING_DIR)
    }

    pub fn archive_family_dir(&self, family: &[u8]) -> PathBuf {
        self.root
            .join("archive")
            .join(&self.namespace)
            .join(&self.table)
            .join(&self.encoded_name)
            .join(String::from_utf8_lossy(family).as_ref())
    }

    pub fn region_info_path(&self) -> PathBuf {
        self.region_dir().join(REGION_INFO_FILE)
    }

    /// Creates the region directory tree and writes `.regioninfo`.
    pub fn create(&self, info: &RegionInfo, families: &[Vec<u8>]) -> Result<()> {
        std::fs::create_dir_all(self.region_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        for family in families {
            std::fs::create_dir_all(self.family_dir(family))?;
        }
        self.write_region_info(info)
    }

    /// Writes the descriptor at most once. Re-opening a region finds the
    /// file present and leaves it alone, keeping its mtime unchanged.
    pub fn write_region_info(&self, info: &RegionInfo) -> Result<()> {
        let path = self.region_info_path();
        if path.exists() {
            return Ok(());
        }
        let staged = self.staging_dir().join(REGION_INFO_FILE);
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::write(&staged, info.encode()?)?;
        std::fs::rename(&staged, &path)?;
        Ok(())
    }

    pub fn read_region_info(&self) -> Result<RegionInfo> {
        let bytes = std::fs::read(self.region_info_path())
            .map_err(|e| Error::Io(format!("read .regioninfo: {e}")))?;
        RegionInfo::decode(&bytes)
    }

    /// Where a writer builds a file before it is committed.
    pub fn staging_path(&self, file_id: u64) -> PathBuf {
        self.staging_dir()
            .join(format!("{file_id}.{STORE_FILE_SUFFIX}"))
    }

    pub fn store_file_path(&self, family: &[u8], file_id: u64) -> PathBuf {
        self.family_dir(family)
            .join(format!("{file_id}.{STORE_FILE_SUFFIX}"))
    }

    /// Publishes a staged file with one atomic rename. The file becomes
    /// visible to readers only after this returns.
    pub fn commit_store_file(&self, family: &[u8], staged: &Path, file_id: u64) -> Result<PathBuf> {
        let target = self.store_file_path(family, file_id);
        std::fs::create_dir_all(self.family_dir(family))?;
        std::fs::rename(staged, &target)
            .map_err(|e| Error::Io(format!("commit {}: {e}", target.display())))?;
        Ok(target)
    }

    /// Concrete store files in a family, (file id, path), unordered.
    pub fn list_store_files(&self, family: &[u8]) -> Result<Vec<(u64, PathBuf)>> {
        let dir = self.family_dir(family);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(&format!(".{STORE_FILE_SUFFIX}")) {
                if let Ok(id) = stem.parse::<u64>() {
                    files.push((id, path));
                }
            }
        }
        Ok(files)
    }

    /// Writes a reference file into this region's family directory.
    pub fn create_reference_file(
        &self,
        family: &[u8],
        reference: &ReferenceFile,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(self.family_dir(family))?;
        let name = format!(
            "{}.{}.{REFERENCE_SUFFIX}",
            reference.parent_file_id,
            reference.side.as_str()
        );
        let path = self.family_dir(family).join(name);
        let staged = self
            .staging_dir()
            .join(format!("{}.{}", reference.parent_file_id, REFERENCE_SUFFIX));
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::write(&staged, bincode::serialize(reference)?)?;
        std::fs::rename(&staged, &path)?;
        Ok(path)
    }

    pub fn list_reference_files(&self, family: &[u8]) -> Result<Vec<(PathBuf, ReferenceFile)>> {
        let dir = self.family_dir(family);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut references = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{REFERENCE_SUFFIX}")) {
                let bytes = std::fs::read(&path)?;
                let reference: ReferenceFile = bincode::deserialize(&bytes)
                    .map_err(|e| Error::InvalidData(format!("bad reference file: {e}")))?;
                references.push((path, reference));
            }
        }
        Ok(references)
    }

    /// True while any family still holds reference files. The parent region
    /// cannot be archived until this is false everywhere.
    pub fn has_references(&self, family: &[u8]) -> Result<bool> {
        Ok(!self.list_reference_files(family)?.is_empty())
    }

    /// Moves a retired file under the archive tree.
    pub fn archive_store_file(&self, family: &[u8], path: &Path) -> Result<PathBuf> {
        let archive_dir = self.archive_family_dir(family);
        std::fs::create_dir_all(&archive_dir)?;
        let name = path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("bad path {}", path.display())))?;
        let target = archive_dir.join(name);
        std::fs::rename(path, &target)?;
        Ok(target)
    }

    pub fn list_families(&self) -> Result<Vec<Vec<u8>>> {
        let mut families = Vec::new();
        for entry in std::fs::read_dir(self.region_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == STAGING_DIR {
                continue;
            }
            families.push(name.as_bytes().to_vec());
        }
        families.sort();
        Ok(families)
    }

    /// Removes the whole region directory. Used by split rollback and by
    /// the janitor once a parent's references are gone.
    pub fn remove_region_dir(&self) -> Result<()> {
        if self.region_dir().exists() {
            std::fs::remove_dir_all(self.region_dir())?;
        }
        Ok(())
    }

    pub fn encoded_name(&self) -> &str {
        &self.encoded_name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Node-level directories.
pub fn wals_dir(root: &Path) -> PathBuf {
    root.join("wals")
}

pub fn old_wals_dir(root: &Path) -> PathBuf {
    root.join("oldWALs")
}

pub fn snapshots_dir(root: &Path) -> PathBuf {
    root.join("snapshots")
}

/// Moves a rolled, fully-flushed WAL file into `oldWALs/`.
pub fn archive_wal(root: &Path, path: &Path) -> Result<PathBuf> {
    let dir = old_wals_dir(root);
    std::fs::create_dir_all(&dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("bad wal path {}", path.display())))?;
    let target = dir.join(name);
    std::fs::rename(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn region_info() -> RegionInfo {
        RegionInfo::new("default", "t1", b"".to_vec(), b"".to_vec(), 100)
    }

    #[test]
    fn test_create_and_layout() {
        let dir = tempdir().unwrap();
        let info = region_info();
        let fs = RegionFileSystem::new(dir.path(), &info);
        fs.create(&info, &[b"f1".to_vec(), b"f2".to_vec()]).unwrap();

        assert!(fs.region_dir().exists());
        assert!(fs.family_dir(b"f1").exists());
        assert!(fs.family_dir(b"f2").exists());
        assert!(fs.region_info_path().exists());
        assert_eq!(fs.list_families().unwrap(), vec![b"f1".to_vec(), b"f2".to_vec()]);

        let read = fs.read_region_info().unwrap();
        assert_eq!(read, info);
    }

    #[test]
    fn test_region_info_written_at_most_once() {
        let dir = tempdir().unwrap();
        let info = region_info();
        let fs = RegionFileSystem::new(dir.path(), &info);
        fs.create(&info, &[b"f".to_vec()]).unwrap();

        let mtime = std::fs::metadata(fs.region_info_path()).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        // Re-opening writes again; the file must be untouched.
        fs.write_region_info(&info).unwrap();
        let mtime_after = std::fs::metadata(fs.region_info_path()).unwrap().modified().unwrap();
        assert_eq!(mtime, mtime_after);
    }

    #[test]
    fn test_commit_store_file_is_rename() {
        let dir = tempdir().unwrap();
        let info = region_info();
        let fs = RegionFileSystem::new(dir.path(), &info);
        fs.create(&info, &[b"f".to_vec()]).unwrap();

        let staged = fs.staging_path(7);
        std::fs::write(&staged, b"file bytes").unwrap();
        // Invisible to listing while staged.
        assert!(fs.list_store_files(b"f").unwrap().is_empty());

        let committed = fs.commit_store_file(b"f", &staged, 7).unwrap();
        assert!(!staged.exists());
        assert!(committed.exists());
        assert_eq!(fs.list_store_files(b"f").unwrap(), vec![(7, committed)]);
    }

    #[test]
    fn test_reference_files() {
        let dir = tempdir().unwrap();
        let info = region_info();
        let fs = RegionFileSystem::new(dir.path(), &info);
        fs.create(&info, &[b"f".to_vec()]).unwrap();

        assert!(!fs.has_references(b"f").unwrap());
        let reference = ReferenceFile {
            parent_namespace: "default".to_string(),
            parent_table: "t1".to_string(),
            parent_region: "abcd1234".to_string(),
            parent_file_id: 42,
            split_row: b"mmm".to_vec(),
            side: ReferenceSide::Top,
        };
        fs.create_reference_file(b"f", &reference).unwrap();

        assert!(fs.has_references(b"f").unwrap());
        let listed = fs.list_reference_files(b"f").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, reference);
        // References never show up as concrete store files.
        assert!(fs.list_store_files(b"f").unwrap().is_empty());
    }

    #[test]
    fn test_archive_store_file() {
        let dir = tempdir().unwrap();
        let info = region_info();
        let fs = RegionFileSystem::new(dir.path(), &info);
        fs.create(&info, &[b"f".to_vec()]).unwrap();

        let staged = fs.staging_path(3);
        std::fs::write(&staged, b"bytes").unwrap();
        let committed = fs.commit_store_file(b"f", &staged, 3).unwrap();

        let archived = fs.archive_store_file(b"f", &committed).unwrap();
        assert!(!committed.exists());
        assert!(archived.exists());
        assert!(archived.starts_with(dir.path().join("archive")));
    }

    #[test]
    fn test_archive_wal() {
        let dir = tempdir().unwrap();
        let wal_path = wals_dir(dir.path()).join("5.wal");
        std::fs::create_dir_all(wals_dir(dir.path())).unwrap();
        std::fs::write(&wal_path, b"log").unwrap();

        let target = archive_wal(dir.path(), &wal_path).unwrap();
        assert!(!wal_path.exists());
        assert_eq!(target, old_wals_dir(dir.path()).join("5.wal"));
    }
}
