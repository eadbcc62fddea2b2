//! Sorted file reader.
//!
//! Opening a file loads the trailer, the root index block, and the bloom
//! meta block. Root index and bloom meta are the *important blocks*: they
//! are inserted into the block cache at pinned priority even when the
//! family has data block caching disabled, because every access needs them.
//! Data blocks honor the family flag and the caller's caching hint.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};

use super::block::{decode_block, Block, BlockIterator};
use super::bloom::{self, BloomMeta};
use super::index::{decode_entries, locate, IndexEntry};
use super::{BlockType, Trailer, FILE_MAGIC};
use crate::cache::{BlockCache, BlockCacheKey, BlockCategory, CachePriority};
use crate::cell::{Cell, CellKey, CellType};
use crate::config::{DataBlockEncoding, FamilyConfig};
use crate::error::Result;
use crate::Error;

pub struct SortedFileReader {
    file: File,
    path: PathBuf,
    file_id: u64,
    trailer: Trailer,
    family: FamilyConfig,
    encoding: DataBlockEncoding,
    cache: Arc<BlockCache>,
    force_important: bool,
    root_entries: Vec<IndexEntry>,
    bloom_meta: Option<BloomMeta>,
    file_info: HashMap<String, String>,
}

impl std::fmt::Debug for SortedFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedFileReader")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .field("trailer", &self.trailer)
            .finish_non_exhaustive()
    }
}

impl SortedFileReader {
    pub fn open(
        path: &Path,
        file_id: u64,
        family: &FamilyConfig,
        cache: Arc<BlockCache>,
        force_important: bool,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("no such file {}", path.display()))
            } else {
                Error::Io(format!("open {}: {e}", path.display()))
            }
        })?;
        let file_size = file.metadata()?.len();
        if file_size < 12 {
            return Err(Error::CorruptFile(format!(
                "{} too short for a trailer",
                path.display()
            )));
        }

        let mut tail = [0u8; 12];
        file.read_exact_at(&mut tail, file_size - 12)?;
        if &tail[4..] != FILE_MAGIC {
            return Err(Error::CorruptFile(format!(
                "{} has a bad file magic",
                path.display()
            )));
        }
        let trailer_len = (&tail[..4]).read_u32::<BigEndian>().unwrap() as u64;
        if trailer_len + 12 > file_size {
            return Err(Error::CorruptFile("trailer length out of bounds".to_string()));
        }
        let mut trailer_bytes = vec![0u8; trailer_len as usize];
        file.read_exact_at(&mut trailer_bytes, file_size - 12 - trailer_len)?;
        let trailer = Trailer::decode(&trailer_bytes)?;

        if trailer.root_index_offset + trailer.root_index_size as u64 > file_size {
            return Err(Error::CorruptFile(
                "root index location out of bounds".to_string(),
            ));
        }

        let mut reader = Self {
            file,
            path: path.to_path_buf(),
            file_id,
            trailer,
            family: family.clone(),
            encoding: family.encoding,
            cache,
            force_important,
            root_entries: Vec::new(),
            bloom_meta: None,
            file_info: HashMap::new(),
        };

        let info_payload = reader.read_block_raw(
            reader.trailer.file_info_offset,
            reader.trailer.file_info_size,
            BlockType::FileInfo,
        )?;
        reader.file_info = decode_file_info(&info_payload)?;
        if let Some(encoding) = reader.file_info.get("encoding") {
            reader.encoding = match encoding.as_str() {
                "None" => DataBlockEncoding::None,
                "Prefix" => DataBlockEncoding::Prefix,
                "Diff" => DataBlockEncoding::Diff,
                "FastDiff" => DataBlockEncoding::FastDiff,
                other => {
                    return Err(Error::CorruptFile(format!(
                        "unknown encoding {other:?} in file info"
                    )))
                }
            };
        }

        let root_payload = reader.read_block_cached(
            reader.trailer.root_index_offset,
            reader.trailer.root_index_size,
            BlockType::RootIndex,
            BlockCategory::Index,
            true,
        )?;
        reader.root_entries = decode_entries(&root_payload)?;

        if reader.trailer.bloom_meta_size > 0 {
            let bloom_payload = reader.read_block_cached(
                reader.trailer.bloom_meta_offset,
                reader.trailer.bloom_meta_size,
                BlockType::BloomMeta,
                BlockCategory::Bloom,
                true,
            )?;
            reader.bloom_meta = Some(BloomMeta::decode(&bloom_payload)?);
        }

        Ok(reader)
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.trailer.entry_count
    }

    pub fn max_sequence(&self) -> u64 {
        self.trailer.max_sequence
    }

    pub fn file_size(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }

    pub fn first_key(&self) -> Result<Option<CellKey>> {
        if self.trailer.first_key.is_empty() {
            return Ok(None);
        }
        CellKey::decode(&self.trailer.first_key).map(Some)
    }

    pub fn last_key(&self) -> Result<Option<CellKey>> {
        if self.trailer.last_key.is_empty() {
            return Ok(None);
        }
        CellKey::decode(&self.trailer.last_key).map(Some)
    }

    fn read_raw(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size as usize];
        self.file
            .read_exact_at(&mut bytes, offset)
            .map_err(|e| Error::Io(format!("read block at {offset}: {e}")))?;
        Ok(bytes)
    }

    /// Reads and decodes a block without touching the cache.
    fn read_block_raw(&self, offset: u64, size: u32, expected: BlockType) -> Result<Vec<u8>> {
        let bytes = self.read_raw(offset, size)?;
        decode_block(
            &bytes,
            expected,
            self.trailer.version,
            self.trailer.checksum_type,
        )
    }

    /// Reads a block through the cache. Important categories (index, bloom)
    /// are admitted at pinned priority whenever force-important is set,
    /// regardless of the family's data caching flag.
    fn read_block_cached(
        &self,
        offset: u64,
        size: u32,
        expected: BlockType,
        category: BlockCategory,
        caching: bool,
    ) -> Result<Arc<Vec<u8>>> {
        let key = BlockCacheKey {
            file_id: self.file_id,
            offset,
        };
        let important = matches!(category, BlockCategory::Index | BlockCategory::Bloom);
        let admit = if important {
            self.force_important || self.family.block_cache_enabled
        } else {
            self.family.block_cache_enabled && caching
        };

        if let Some(payload) = self.cache.get(&key, admit) {
            return Ok(payload);
        }

        let payload = self.read_block_raw(offset, size, expected)?;
        if admit {
            let priority = if important {
                CachePriority::InMemory
            } else {
                CachePriority::Single
            };
            self.cache.insert(key, category, priority, payload.clone());
            // Serve from the cache copy so repeated readers share one buffer.
            if let Some(shared) = self.cache.get(&key, false) {
                return Ok(shared);
            }
        }
        Ok(Arc::new(payload))
    }

    /// Peeks a block's type from its magic without reading the payload.
    fn peek_block_type(&self, offset: u64) -> Result<BlockType> {
        let mut magic = [0u8; 8];
        self.file
            .read_exact_at(&mut magic, offset)
            .map_err(|e| Error::Io(format!("read block magic at {offset}: {e}")))?;
        BlockType::from_magic(&magic)
    }

    fn open_data_block(&self, offset: u64, size: u32, caching: bool) -> Result<Block> {
        let expected = if self.encoding == DataBlockEncoding::None {
            BlockType::Data
        } else {
            BlockType::EncodedData
        };
        let payload =
            self.read_block_cached(offset, size, expected, BlockCategory::Data, caching)?;
        Block::new(payload, self.encoding)
    }

    fn bloom_rejects(&self, bloom_key: &[u8]) -> Result<bool> {
        let Some(meta) = &self.bloom_meta else {
            return Ok(false);
        };
        let Some(chunk_ref) = meta.chunk_for(bloom_key) else {
            return Ok(true);
        };
        let chunk = self.read_block_cached(
            chunk_ref.offset,
            chunk_ref.on_disk_size,
            BlockType::BloomChunk,
            BlockCategory::Bloom,
            true,
        )?;
        Ok(!bloom::may_contain(&chunk, bloom_key))
    }

    /// Point lookup: the newest cell of (row, family, qualifier) whose MVCC
    /// number is at or below `read_point`. Cells without an MVCC tag are
    /// treated as already visible.
    pub fn get(
        self: &Arc<Self>,
        row: &[u8],
        qualifier: &[u8],
        read_point: u64,
    ) -> Result<Option<Cell>> {
        if let Some(meta) = &self.bloom_meta {
            let bloom_key = if meta.granularity == 0 {
                row.to_vec()
            } else {
                let mut key = Vec::with_capacity(row.len() + 1 + qualifier.len());
                key.extend_from_slice(row);
                key.push(0);
                key.extend_from_slice(qualifier);
                key
            };
            if self.bloom_rejects(&bloom_key)? {
                return Ok(None);
            }
        }

        let probe = CellKey::new(
            row,
            self.family.name.clone(),
            qualifier,
            u64::MAX,
            CellType::DeleteFamily,
        );
        let mut scanner = self.scan_from(&probe, true)?;
        for cell in &mut scanner {
            let cell = cell?;
            if cell.key.row.as_slice() != row {
                return Ok(None);
            }
            if cell.key.qualifier.as_slice() != qualifier {
                // Qualifiers sort after (row, family); once past it, stop.
                if cell.key.qualifier.as_slice() > qualifier {
                    return Ok(None);
                }
                continue;
            }
            if cell.mvcc().map_or(true, |m| m <= read_point) {
                return Ok(Some(cell));
            }
        }
        Ok(None)
    }

    /// Lazy scan of all cells with key >= `start`. `caching` controls data
    /// block admission; small scans pass false to avoid cache pollution.
    pub fn scan_from(self: &Arc<Self>, start: &CellKey, caching: bool) -> Result<FileScanner> {
        let start_slot = match locate(&self.root_entries, start)? {
            Some(slot) => slot,
            None => 0,
        };
        Ok(FileScanner {
            reader: self.clone(),
            levels: vec![LevelCursor {
                entries: self.root_entries.clone(),
                next: start_slot,
            }],
            block_iter: None,
            start: Some(start.clone()),
            caching,
            done: self.root_entries.is_empty(),
        })
    }

    /// Scan from the beginning of the file.
    pub fn scan(self: &Arc<Self>, caching: bool) -> Result<FileScanner> {
        Ok(FileScanner {
            reader: self.clone(),
            levels: vec![LevelCursor {
                entries: self.root_entries.clone(),
                next: 0,
            }],
            block_iter: None,
            start: None,
            caching,
            done: self.root_entries.is_empty(),
        })
    }
}

struct LevelCursor {
    entries: Vec<IndexEntry>,
    next: usize,
}

/// Iterator over a file's cells in key order.
pub struct FileScanner {
    reader: Arc<SortedFileReader>,
    levels: Vec<LevelCursor>,
    block_iter: Option<BlockIterator>,
    start: Option<CellKey>,
    caching: bool,
    done: bool,
}

impl FileScanner {
    /// Advances to the next data block, descending index levels as needed.
    fn next_block(&mut self) -> Result<Option<Block>> {
        loop {
            let Some(cursor) = self.levels.last_mut() else {
                return Ok(None);
            };
            if cursor.next >= cursor.entries.len() {
                self.levels.pop();
                continue;
            }
            let entry = cursor.entries[cursor.next].clone();
            cursor.next += 1;

            let block_type = self.reader.peek_block_type(entry.offset)?;
            match block_type {
                BlockType::Data | BlockType::EncodedData => {
                    return self
                        .reader
                        .open_data_block(entry.offset, entry.on_disk_size, self.caching)
                        .map(Some);
                }
                BlockType::LeafIndex | BlockType::IntermediateIndex => {
                    let payload = self.reader.read_block_cached(
                        entry.offset,
                        entry.on_disk_size,
                        block_type,
                        BlockCategory::Index,
                        true,
                    )?;
                    let entries = decode_entries(&payload)?;
                    let next = match &self.start {
                        Some(start) => locate(&entries, start)?.unwrap_or(0),
                        None => 0,
                    };
                    self.levels.push(LevelCursor { entries, next });
                }
                other => {
                    return Err(Error::CorruptFile(format!(
                        "index points at a {other:?} block"
                    )))
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Cell>> {
        loop {
            if let Some(iter) = &mut self.block_iter {
                match iter.next() {
                    Some(Ok(cell)) => {
                        if let Some(start) = &self.start {
                            if cell.key < *start {
                                continue;
                            }
                            // Past the threshold, stop filtering.
                            self.start = None;
                        }
                        return Ok(Some(cell));
                    }
                    Some(Err(e)) => return Err(e),
                    None => self.block_iter = None,
                }
            }
            match self.next_block()? {
                Some(block) => {
                    let iter = match &self.start {
                        Some(start) => block.seek(start)?,
                        None => block.iter(),
                    };
                    self.block_iter = Some(iter);
                }
                None => return Ok(None),
            }
        }
    }
}

impl Iterator for FileScanner {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(cell)) => Some(Ok(cell)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_file_info(payload: &[u8]) -> Result<HashMap<String, String>> {
    use std::io::Read;
    let mut cursor = std::io::Cursor::new(payload);
    let corrupt = || Error::CorruptFile("truncated file info".to_string());

    let count = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
    let mut info = HashMap::with_capacity(count);
    for _ in 0..count {
        let key_len = cursor.read_u16::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).map_err(|_| corrupt())?;
        let value_len = cursor.read_u16::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value).map_err(|_| corrupt())?;
        info.insert(
            String::from_utf8_lossy(&key).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        );
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BloomKind;
    use crate::sortedfile::writer::SortedFileWriter;
    use crate::sortedfile::FORMAT_V3;
    use tempfile::tempdir;

    fn write_file(
        dir: &Path,
        file_id: u64,
        family: &FamilyConfig,
        rows: usize,
    ) -> std::path::PathBuf {
        let path = dir.join(format!("{file_id}.mf"));
        let mut writer =
            SortedFileWriter::new(&path, file_id, family, FORMAT_V3, 128 * 1024).unwrap();
        for i in 0..rows {
            let cell = Cell::put(format!("row_{i:05}"), "f", "q", 100, format!("value_{i:05}"));
            writer.append(&cell).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f").block_size(512);
        let path = write_file(dir.path(), 1, &family, 1000);

        let reader = Arc::new(SortedFileReader::open(&path, 1, &family, cache, true).unwrap());
        assert_eq!(reader.entry_count(), 1000);

        let cells: Vec<Cell> = reader.scan(true).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(cells.len(), 1000);
        assert_eq!(cells[0].key.row, b"row_00000");
        assert_eq!(cells[999].key.row, b"row_00999");
        assert!(cells.windows(2).all(|w| w[0].key <= w[1].key));
    }

    #[test]
    fn test_point_get() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f").block_size(256);
        let path = write_file(dir.path(), 2, &family, 500);

        let reader = Arc::new(SortedFileReader::open(&path, 2, &family, cache, true).unwrap());
        let cell = reader.get(b"row_00123", b"q", u64::MAX).unwrap().unwrap();
        assert_eq!(cell.value, b"value_00123");

        assert!(reader.get(b"row_99999", b"q", u64::MAX).unwrap().is_none());
        assert!(reader.get(b"row_00123", b"zz", u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_scan_from_midpoint() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f").block_size(256);
        let path = write_file(dir.path(), 3, &family, 500);

        let reader = Arc::new(SortedFileReader::open(&path, 3, &family, cache, true).unwrap());
        let start = CellKey::first_on_row("row_00400");
        let cells: Vec<Cell> = reader
            .scan_from(&start, true)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(cells.len(), 100);
        assert_eq!(cells[0].key.row, b"row_00400");
    }

    #[test]
    fn test_important_blocks_cached_when_family_caching_disabled() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        // Tiny blocks force a multi-block index; family data caching is off.
        let family = FamilyConfig::new("f")
            .block_size(256)
            .block_cache_enabled(false)
            .bloom(BloomKind::Row);
        let path = write_file(dir.path(), 4, &family, 2000);

        let reader = Arc::new(SortedFileReader::open(&path, 4, &family, cache.clone(), true).unwrap());
        reader.get(b"row_00100", b"q", u64::MAX).unwrap();

        assert!(cache.count_category(BlockCategory::Index, Some(4)) >= 1);
        assert!(cache.count_category(BlockCategory::Bloom, Some(4)) >= 1);
        assert_eq!(cache.count_category(BlockCategory::Data, Some(4)), 0);
    }

    #[test]
    fn test_corrupt_magic() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f");
        let path = write_file(dir.path(), 5, &family, 10);

        // Stomp the trailing magic.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        match SortedFileReader::open(&path, 5, &family, cache, true) {
            Err(Error::CorruptFile(_)) => {}
            other => panic!("expected CorruptFile, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f");
        let result = SortedFileReader::open(
            &dir.path().join("absent.mf"),
            9,
            &family,
            cache,
            true,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_bloom_rejects_absent_row() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20));
        let family = FamilyConfig::new("f").bloom(BloomKind::Row);
        let path = write_file(dir.path(), 6, &family, 100);

        let reader = Arc::new(SortedFileReader::open(&path, 6, &family, cache, true).unwrap());
        // A row before the first bloom chunk is rejected without disk reads.
        assert!(reader.get(b"aaaa", b"q", u64::MAX).unwrap().is_none());
    }
}
