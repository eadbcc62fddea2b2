//! Sorted file writer.
//!
//! Cells must arrive in cell order. Data blocks are cut at the family's
//! block size, the index is built bottom-up honoring the configured chunk
//! bound, and the optional bloom filter is chunked alongside. The file is
//! written to a staging path; `finish` syncs it and reports the summary the
//! caller needs to commit the file into its family directory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};

use super::block::{encode_block, BlockBuilder};
use super::bloom::{BloomChunkBuilder, BloomChunkRef, BloomMeta, KEYS_PER_CHUNK};
use super::index::{chunk_entries, encode_entries, IndexEntry};
use super::{BlockType, Trailer, CHECKSUM_CRC32, CHECKSUM_NONE, FILE_MAGIC, FORMAT_V3};
use crate::cell::{Cell, CellKey};
use crate::config::{BloomKind, DataBlockEncoding, FamilyConfig};
use crate::error::Result;
use crate::Error;

/// Summary of a finished file, used by the store to publish it.
#[derive(Debug, Clone)]
pub struct FinishedFile {
    pub file_id: u64,
    pub path: PathBuf,
    pub first_key: Option<CellKey>,
    pub last_key: Option<CellKey>,
    pub entry_count: u64,
    pub max_sequence: u64,
    pub file_size: u64,
}

struct BloomState {
    granularity: u8,
    builder: BloomChunkBuilder,
    chunk_first_key: Option<Vec<u8>>,
    finished_chunks: Vec<(Vec<u8>, Vec<u8>)>,
    last_key: Option<Vec<u8>>,
}

impl BloomState {
    fn add(&mut self, key: Vec<u8>) {
        // Consecutive duplicates collapse to one filter key.
        if self.last_key.as_deref() == Some(key.as_slice()) {
            return;
        }
        if self.builder.key_count() >= KEYS_PER_CHUNK {
            self.rotate();
        }
        if self.chunk_first_key.is_none() {
            self.chunk_first_key = Some(key.clone());
        }
        self.builder.add(&key);
        self.last_key = Some(key);
    }

    fn rotate(&mut self) {
        if self.builder.is_empty() {
            return;
        }
        let builder = std::mem::take(&mut self.builder);
        let first_key = self.chunk_first_key.take().expect("chunk has keys");
        self.finished_chunks.push((first_key, builder.finish()));
    }
}

pub struct SortedFileWriter {
    file: File,
    path: PathBuf,
    file_id: u64,
    version: u32,
    family: FamilyConfig,
    index_max_chunk_size: usize,
    block: BlockBuilder,
    leaf_entries: Vec<IndexEntry>,
    bloom: Option<BloomState>,
    offset: u64,
    prev_offset: u64,
    entry_count: u64,
    total_uncompressed: u64,
    first_key: Option<CellKey>,
    last_key: Option<CellKey>,
    max_sequence: u64,
    finished: bool,
}

impl SortedFileWriter {
    pub fn new(
        path: &Path,
        file_id: u64,
        family: &FamilyConfig,
        version: u32,
        index_max_chunk_size: usize,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let bloom = match family.bloom {
            BloomKind::None => None,
            BloomKind::Row => Some(0),
            BloomKind::RowCol => Some(1),
        }
        .map(|granularity| BloomState {
            granularity,
            builder: BloomChunkBuilder::new(),
            chunk_first_key: None,
            finished_chunks: Vec::new(),
            last_key: None,
        });

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_id,
            version,
            family: family.clone(),
            index_max_chunk_size,
            block: BlockBuilder::new(family.encoding),
            leaf_entries: Vec::new(),
            bloom,
            offset: 0,
            prev_offset: 0,
            entry_count: 0,
            total_uncompressed: 0,
            first_key: None,
            last_key: None,
            max_sequence: 0,
            finished: false,
        })
    }

    /// Largest WAL sequence among the cells this file will contain.
    /// Recorded in the trailer; the store uses it for WAL archival.
    pub fn set_max_sequence(&mut self, sequence: u64) {
        self.max_sequence = self.max_sequence.max(sequence);
    }

    pub fn append(&mut self, cell: &Cell) -> Result<()> {
        if self.finished {
            return Err(Error::ReadOnly);
        }
        if let Some(last) = &self.last_key {
            if &cell.key < last {
                return Err(Error::InvalidInput(
                    "cells must be appended in sort order".to_string(),
                ));
            }
        }

        let mut stored = cell.clone();
        if !self.family.includes_mvcc {
            stored.strip_mvcc();
        }
        if !self.family.includes_tags {
            stored.tags.clear();
        }

        if self.block.size_estimate() >= self.family.block_size && !self.block.is_empty() {
            self.flush_data_block()?;
        }
        self.block.add(&stored)?;

        if let Some(bloom) = &mut self.bloom {
            let key = if bloom.granularity == 0 {
                cell.bloom_row_key().to_vec()
            } else {
                cell.bloom_rowcol_key()
            };
            bloom.add(key);
        }

        if self.first_key.is_none() {
            self.first_key = Some(cell.key.clone());
        }
        self.last_key = Some(cell.key.clone());
        self.entry_count += 1;
        Ok(())
    }

    fn write_framed(&mut self, block_type: BlockType, payload: &[u8]) -> Result<(u64, u32)> {
        let framed = encode_block(
            block_type,
            payload,
            self.family.compression,
            self.version,
            self.prev_offset,
        )?;
        let offset = self.offset;
        self.file.write_all(&framed)?;
        self.prev_offset = offset;
        self.offset += framed.len() as u64;
        self.total_uncompressed += payload.len() as u64;
        Ok((offset, framed.len() as u32))
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let first_key = self
            .block
            .first_key()
            .expect("non-empty block has a first key")
            .encode();
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.family.encoding));
        let payload = block.finish();
        let block_type = if self.family.encoding == DataBlockEncoding::None {
            BlockType::Data
        } else {
            BlockType::EncodedData
        };
        let (offset, on_disk_size) = self.write_framed(block_type, &payload)?;
        self.leaf_entries.push(IndexEntry {
            first_key,
            offset,
            on_disk_size,
        });
        Ok(())
    }

    /// Writes index levels bottom-up until a single root block remains.
    /// Returns the root block's location.
    fn write_index(&mut self) -> Result<(u64, u32)> {
        let mut level = std::mem::take(&mut self.leaf_entries);
        let mut leaf_level = true;
        loop {
            let chunks = chunk_entries(level, self.index_max_chunk_size);
            if chunks.len() <= 1 {
                let entries = chunks.into_iter().next().unwrap_or_default();
                let payload = encode_entries(&entries);
                return self.write_framed(BlockType::RootIndex, &payload);
            }
            let block_type = if leaf_level {
                BlockType::LeafIndex
            } else {
                BlockType::IntermediateIndex
            };
            let mut parent = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let first_key = chunk[0].first_key.clone();
                let payload = encode_entries(&chunk);
                let (offset, on_disk_size) = self.write_framed(block_type, &payload)?;
                parent.push(IndexEntry {
                    first_key,
                    offset,
                    on_disk_size,
                });
            }
            level = parent;
            leaf_level = false;
        }
    }

    fn write_bloom(&mut self) -> Result<Option<(u64, u32)>> {
        let Some(mut bloom) = self.bloom.take() else {
            return Ok(None);
        };
        bloom.rotate();
        if bloom.finished_chunks.is_empty() {
            return Ok(None);
        }
        let mut refs = Vec::with_capacity(bloom.finished_chunks.len());
        for (first_key, payload) in bloom.finished_chunks {
            let (offset, on_disk_size) = self.write_framed(BlockType::BloomChunk, &payload)?;
            refs.push(BloomChunkRef {
                first_key,
                offset,
                on_disk_size,
            });
        }
        let meta = BloomMeta {
            granularity: bloom.granularity,
            chunks: refs,
        };
        let location = self.write_framed(BlockType::BloomMeta, &meta.encode())?;
        Ok(Some(location))
    }

    fn write_file_info(&mut self) -> Result<(u64, u32)> {
        let mut pairs: Vec<(&str, String)> = vec![
            ("encoding", format!("{:?}", self.family.encoding)),
            ("compression", format!("{:?}", self.family.compression)),
            ("bloom", format!("{:?}", self.family.bloom)),
            ("includes.mvcc", self.family.includes_mvcc.to_string()),
            ("includes.tags", self.family.includes_tags.to_string()),
            ("max.sequence", self.max_sequence.to_string()),
        ];
        pairs.sort();

        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(pairs.len() as u32).unwrap();
        for (key, value) in pairs {
            payload.write_u16::<BigEndian>(key.len() as u16).unwrap();
            payload.extend_from_slice(key.as_bytes());
            payload
                .write_u16::<BigEndian>(value.len() as u16)
                .unwrap();
            payload.extend_from_slice(value.as_bytes());
        }
        self.write_framed(BlockType::FileInfo, &payload)
    }

    /// Emits index, bloom, file info, and trailer, then syncs. The file is
    /// not visible to readers until the caller commits it into place.
    pub fn finish(mut self) -> Result<FinishedFile> {
        self.flush_data_block()?;

        let bloom_location = self.write_bloom()?;
        let (root_offset, root_size) = self.write_index()?;
        let (info_offset, info_size) = self.write_file_info()?;

        let trailer = Trailer {
            version: self.version,
            checksum_type: if self.version >= FORMAT_V3 {
                CHECKSUM_CRC32
            } else {
                CHECKSUM_NONE
            },
            root_index_offset: root_offset,
            root_index_size: root_size,
            bloom_meta_offset: bloom_location.map_or(0, |(o, _)| o),
            bloom_meta_size: bloom_location.map_or(0, |(_, s)| s),
            file_info_offset: info_offset,
            file_info_size: info_size,
            entry_count: self.entry_count,
            total_uncompressed_bytes: self.total_uncompressed,
            max_sequence: self.max_sequence,
            first_key: self.first_key.as_ref().map(CellKey::encode).unwrap_or_default(),
            last_key: self.last_key.as_ref().map(CellKey::encode).unwrap_or_default(),
        };
        let trailer_bytes = trailer.encode();
        self.file.write_all(&trailer_bytes)?;
        self.file
            .write_u32::<BigEndian>(trailer_bytes.len() as u32)?;
        self.file.write_all(FILE_MAGIC)?;
        self.file.sync_all()?;
        self.finished = true;

        let file_size = self.offset + trailer_bytes.len() as u64 + 4 + 8;
        Ok(FinishedFile {
            file_id: self.file_id,
            path: self.path.clone(),
            first_key: self.first_key.clone(),
            last_key: self.last_key.clone(),
            entry_count: self.entry_count,
            max_sequence: self.max_sequence,
            file_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_sorted_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.mf");
        let family = FamilyConfig::new("f");
        let mut writer = SortedFileWriter::new(&path, 1, &family, FORMAT_V3, 128 * 1024).unwrap();

        for i in 0..500 {
            let cell = Cell::put(format!("row_{i:04}"), "f", "q", 100, format!("v{i}"));
            writer.append(&cell).unwrap();
        }
        writer.set_max_sequence(77);
        let finished = writer.finish().unwrap();

        assert_eq!(finished.entry_count, 500);
        assert_eq!(finished.max_sequence, 77);
        assert_eq!(finished.first_key.as_ref().unwrap().row, b"row_0000");
        assert_eq!(finished.last_key.as_ref().unwrap().row, b"row_0499");
        assert_eq!(
            finished.file_size,
            std::fs::metadata(&path).unwrap().len()
        );
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2.mf");
        let family = FamilyConfig::new("f");
        let mut writer = SortedFileWriter::new(&path, 2, &family, FORMAT_V3, 128 * 1024).unwrap();

        writer.append(&Cell::put("b", "f", "q", 1, "")).unwrap();
        assert!(writer.append(&Cell::put("a", "f", "q", 1, "")).is_err());
    }

    #[test]
    fn test_append_after_finish_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3.mf");
        let family = FamilyConfig::new("f");
        let writer = SortedFileWriter::new(&path, 3, &family, FORMAT_V3, 128 * 1024).unwrap();
        // finish consumes the writer, so a second append cannot compile;
        // an empty file still finishes cleanly.
        let finished = writer.finish().unwrap();
        assert_eq!(finished.entry_count, 0);
    }
}
