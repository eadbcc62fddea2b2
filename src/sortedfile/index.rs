//! Multi-level block index.
//!
//! Each index entry maps a block's first cell key to its (offset, on-disk
//! size). The leaf level covers data blocks. When a level outgrows the
//! configured chunk size it is split into multiple blocks and a parent level
//! is built over them, up to a single root block the reader holds in memory.
//!
//! Lookup descends from the root: at each level, pick the greatest entry
//! whose first key is <= the probe key.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::cell::CellKey;
use crate::error::Result;
use crate::Error;

/// One index entry: first key of the child block and its location.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub first_key: Vec<u8>,
    pub offset: u64,
    pub on_disk_size: u32,
}

impl IndexEntry {
    pub fn decoded_key(&self) -> Result<CellKey> {
        CellKey::decode(&self.first_key)
            .map_err(|e| Error::CorruptFile(format!("undecodable index key: {e}")))
    }
}

/// Serializes one level chunk of entries into an index block payload.
pub fn encode_entries(entries: &[IndexEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    for entry in entries {
        buf.write_u32::<BigEndian>(entry.first_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&entry.first_key);
        buf.write_u64::<BigEndian>(entry.offset).unwrap();
        buf.write_u32::<BigEndian>(entry.on_disk_size).unwrap();
    }
    buf
}

pub fn decode_entries(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut cursor = std::io::Cursor::new(bytes);
    let corrupt = || Error::CorruptFile("truncated index block".to_string());

    let count = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut first_key = vec![0u8; key_len];
        cursor.read_exact(&mut first_key).map_err(|_| corrupt())?;
        let offset = cursor.read_u64::<BigEndian>().map_err(|_| corrupt())?;
        let on_disk_size = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())?;
        entries.push(IndexEntry {
            first_key,
            offset,
            on_disk_size,
        });
    }
    Ok(entries)
}

/// Index of the greatest entry whose first key is <= `target`, or None when
/// the target precedes every entry.
pub fn locate(entries: &[IndexEntry], target: &CellKey) -> Result<Option<usize>> {
    let mut left = 0usize;
    let mut right = entries.len();
    // partition point over decoded keys
    while left < right {
        let mid = (left + right) / 2;
        if &entries[mid].decoded_key()? <= target {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    Ok(left.checked_sub(1))
}

/// Splits a level's entries into chunks no larger than `max_chunk_size`
/// encoded bytes. Every chunk holds at least one entry.
pub fn chunk_entries(entries: Vec<IndexEntry>, max_chunk_size: usize) -> Vec<Vec<IndexEntry>> {
    let mut chunks = Vec::new();
    let mut current: Vec<IndexEntry> = Vec::new();
    let mut current_size = 4usize;
    for entry in entries {
        let entry_size = 4 + entry.first_key.len() + 8 + 4;
        if !current.is_empty() && current_size + entry_size > max_chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_size = 4;
        }
        current_size += entry_size;
        current.push(entry);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
