//! Block codec: groups sorted cells into blocks and frames them on disk.
//!
//! # Entry encodings
//!
//! Every entry is the encoded bytes of one cell. The block encoding decides
//! how much of those bytes are shared with the previous entry:
//!
//! - `NONE` — each entry stores its full bytes: `[len:u32][bytes]`.
//! - `PREFIX` — the run shares a leading prefix with the previous entry:
//!   `[shared_prefix:u16][len:u32][suffix bytes]`.
//! - `DIFF` — prefix plus a shared trailing suffix (catches equal
//!   timestamps, types, and values):
//!   `[shared_prefix:u16][shared_suffix:u16][len:u32][middle bytes]`.
//! - `FAST_DIFF` — `DIFF` with all three lengths written as one-byte deltas
//!   against the previous entry, escaping to the full width when the delta
//!   does not fit.
//!
//! Once every `RESTART_INTERVAL` entries the sharing resets and the entry is
//! stored whole; the offsets of these restart points trail the payload and
//! drive binary search.
//!
//! # Block framing
//!
//! `encode_block` prepends the fixed header (type magic, on-disk size,
//! uncompressed size, previous block offset and, for format v3, checksum
//! fields) and applies optional compression. `decode_block` reverses it,
//! failing with `ChecksumMismatch` or `CorruptFile`.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::{
    BlockType, BLOCK_HEADER_SIZE_V2, BLOCK_HEADER_SIZE_V3, BYTES_PER_CHECKSUM, CHECKSUM_CRC32,
    CHECKSUM_NONE, FORMAT_V3,
};
use crate::cell::{Cell, CellKey};
use crate::config::{Compression, DataBlockEncoding};
use crate::error::Result;
use crate::Error;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const RESTART_INTERVAL: usize = 16;

/// Escape marker for FAST_DIFF length deltas that do not fit in one byte.
const DELTA_ESCAPE: i8 = i8::MIN;

/// Builds one block's payload from cells arriving in sort order.
pub struct BlockBuilder {
    encoding: DataBlockEncoding,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    entry_count: usize,
    last_entry: Vec<u8>,
    first_key: Option<CellKey>,
    last_key: Option<CellKey>,
    // FAST_DIFF length-delta state.
    prev_prefix: u16,
    prev_suffix: u16,
    prev_middle: u32,
}

impl BlockBuilder {
    pub fn new(encoding: DataBlockEncoding) -> Self {
        Self {
            encoding,
            buffer: Vec::new(),
            restarts: Vec::new(),
            counter: 0,
            entry_count: 0,
            last_entry: Vec::new(),
            first_key: None,
            last_key: None,
            prev_prefix: 0,
            prev_suffix: 0,
            prev_middle: 0,
        }
    }

    pub fn add(&mut self, cell: &Cell) -> Result<()> {
        if let Some(last) = &self.last_key {
            if &cell.key < last {
                return Err(Error::InvalidInput(
                    "cells must be appended in sort order".to_string(),
                ));
            }
        }

        let bytes = cell.encode()?;
        let restart = self.counter % RESTART_INTERVAL == 0;
        if restart {
            self.restarts.push(self.buffer.len() as u32);
        }

        let (shared_prefix, shared_suffix) = if restart {
            (0, 0)
        } else {
            match self.encoding {
                DataBlockEncoding::None => (0, 0),
                DataBlockEncoding::Prefix => (shared_prefix_len(&self.last_entry, &bytes), 0),
                DataBlockEncoding::Diff | DataBlockEncoding::FastDiff => {
                    let prefix = shared_prefix_len(&self.last_entry, &bytes);
                    let suffix =
                        shared_suffix_len(&self.last_entry[prefix..], &bytes[prefix..]);
                    (prefix, suffix)
                }
            }
        };
        let middle = &bytes[shared_prefix..bytes.len() - shared_suffix];

        match self.encoding {
            DataBlockEncoding::None => {
                self.buffer
                    .write_u32::<BigEndian>(bytes.len() as u32)
                    .unwrap();
                self.buffer.extend_from_slice(&bytes);
            }
            DataBlockEncoding::Prefix => {
                self.buffer
                    .write_u16::<BigEndian>(shared_prefix as u16)
                    .unwrap();
                self.buffer
                    .write_u32::<BigEndian>(middle.len() as u32)
                    .unwrap();
                self.buffer.extend_from_slice(middle);
            }
            DataBlockEncoding::Diff => {
                self.buffer
                    .write_u16::<BigEndian>(shared_prefix as u16)
                    .unwrap();
                self.buffer
                    .write_u16::<BigEndian>(shared_suffix as u16)
                    .unwrap();
                self.buffer
                    .write_u32::<BigEndian>(middle.len() as u32)
                    .unwrap();
                self.buffer.extend_from_slice(middle);
            }
            DataBlockEncoding::FastDiff => {
                // Delta state resets at restart points so a reader entering
                // at any restart sees the same baseline.
                if restart {
                    self.prev_prefix = 0;
                    self.prev_suffix = 0;
                    self.prev_middle = 0;
                }
                let (prefix, suffix, middle_len) =
                    (shared_prefix as u16, shared_suffix as u16, middle.len() as u32);
                write_delta_u16(&mut self.buffer, self.prev_prefix, prefix);
                write_delta_u16(&mut self.buffer, self.prev_suffix, suffix);
                write_delta_u32(&mut self.buffer, self.prev_middle, middle_len);
                self.buffer.extend_from_slice(middle);
                self.prev_prefix = prefix;
                self.prev_suffix = suffix;
                self.prev_middle = middle_len;
            }
        }

        self.last_entry = bytes;
        if self.first_key.is_none() {
            self.first_key = Some(cell.key.clone());
        }
        self.last_key = Some(cell.key.clone());
        self.counter += 1;
        self.entry_count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Current payload size estimate including the restart array.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn first_key(&self) -> Option<&CellKey> {
        self.first_key.as_ref()
    }

    pub fn last_key(&self) -> Option<&CellKey> {
        self.last_key.as_ref()
    }

    /// Finishes the payload: entries followed by the restart array.
    pub fn finish(mut self) -> Vec<u8> {
        for restart in &self.restarts {
            self.buffer.write_u32::<BigEndian>(*restart).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

fn shared_suffix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|&(x, y)| x == y)
        .count()
}

fn write_delta_u16(buf: &mut Vec<u8>, prev: u16, current: u16) {
    let delta = current as i64 - prev as i64;
    if delta != DELTA_ESCAPE as i64 && (i8::MIN as i64 + 1..=i8::MAX as i64).contains(&delta) {
        buf.write_i8(delta as i8).unwrap();
    } else {
        buf.write_i8(DELTA_ESCAPE).unwrap();
        buf.write_u16::<BigEndian>(current).unwrap();
    }
}

fn write_delta_u32(buf: &mut Vec<u8>, prev: u32, current: u32) {
    let delta = current as i64 - prev as i64;
    if delta != DELTA_ESCAPE as i64 && (i8::MIN as i64 + 1..=i8::MAX as i64).contains(&delta) {
        buf.write_i8(delta as i8).unwrap();
    } else {
        buf.write_i8(DELTA_ESCAPE).unwrap();
        buf.write_u32::<BigEndian>(current).unwrap();
    }
}

fn read_delta_u16(cursor: &mut Cursor<&[u8]>, prev: u16) -> Result<u16> {
    let delta = cursor
        .read_i8()
        .map_err(|_| Error::CorruptFile("truncated length delta".to_string()))?;
    if delta == DELTA_ESCAPE {
        cursor
            .read_u16::<BigEndian>()
            .map_err(|_| Error::CorruptFile("truncated escaped length".to_string()))
    } else {
        Ok((prev as i64 + delta as i64) as u16)
    }
}

fn read_delta_u32(cursor: &mut Cursor<&[u8]>, prev: u32) -> Result<u32> {
    let delta = cursor
        .read_i8()
        .map_err(|_| Error::CorruptFile("truncated length delta".to_string()))?;
    if delta == DELTA_ESCAPE {
        cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::CorruptFile("truncated escaped length".to_string()))
    } else {
        Ok((prev as i64 + delta as i64) as u32)
    }
}

/// A decoded block payload ready for iteration.
#[derive(Clone)]
pub struct Block {
    payload: Arc<Vec<u8>>,
    encoding: DataBlockEncoding,
    restarts: Vec<u32>,
    data_end: usize,
}

impl Block {
    pub fn new(payload: Arc<Vec<u8>>, encoding: DataBlockEncoding) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::CorruptFile("block payload too short".to_string()));
        }
        let count_offset = payload.len() - 4;
        let restart_count =
            (&payload[count_offset..]).read_u32::<BigEndian>().unwrap() as usize;
        let restart_bytes = restart_count * 4;
        if count_offset < restart_bytes {
            return Err(Error::CorruptFile(
                "block restart array out of bounds".to_string(),
            ));
        }
        let data_end = count_offset - restart_bytes;
        let mut restarts = Vec::with_capacity(restart_count);
        let mut cursor = Cursor::new(&payload[data_end..count_offset]);
        for _ in 0..restart_count {
            restarts.push(cursor.read_u32::<BigEndian>().unwrap());
        }
        Ok(Self {
            payload,
            encoding,
            restarts,
            data_end,
        })
    }

    pub fn iter(&self) -> BlockIterator {
        BlockIterator {
            block: self.clone(),
            offset: 0,
            prev_entry: Vec::new(),
            prev_prefix: 0,
            prev_suffix: 0,
            prev_middle: 0,
            entries_read: 0,
            done: false,
        }
    }

    /// Iterator positioned at the first cell with key >= `target`.
    pub fn seek(&self, target: &CellKey) -> Result<BlockIterator> {
        // Binary search restart points for the last one whose key <= target.
        let mut left = 0usize;
        let mut right = self.restarts.len();
        while left + 1 < right {
            let mid = (left + right) / 2;
            let key = self.key_at_restart(mid)?;
            if &key <= target {
                left = mid;
            } else {
                right = mid;
            }
        }

        let mut iter = self.iter();
        if !self.restarts.is_empty() {
            iter.reposition_at_restart(left, self.restarts[left] as usize);
        }
        // Linear scan forward to the first key >= target.
        loop {
            let checkpoint = iter.clone();
            match iter.next() {
                Some(Ok(cell)) => {
                    if cell.key >= *target {
                        return Ok(checkpoint);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(iter),
            }
        }
    }

    fn key_at_restart(&self, index: usize) -> Result<CellKey> {
        let mut iter = self.iter();
        iter.reposition_at_restart(index, self.restarts[index] as usize);
        match iter.next() {
            Some(Ok(cell)) => Ok(cell.key),
            Some(Err(e)) => Err(e),
            None => Err(Error::CorruptFile("empty restart point".to_string())),
        }
    }
}

/// Sequential cell reader over a block.
#[derive(Clone)]
pub struct BlockIterator {
    block: Block,
    offset: usize,
    prev_entry: Vec<u8>,
    prev_prefix: u16,
    prev_suffix: u16,
    prev_middle: u32,
    entries_read: usize,
    done: bool,
}

impl BlockIterator {
    fn reposition_at_restart(&mut self, restart_index: usize, offset: usize) {
        self.offset = offset;
        self.prev_entry.clear();
        self.prev_prefix = 0;
        self.prev_suffix = 0;
        self.prev_middle = 0;
        self.entries_read = restart_index * RESTART_INTERVAL;
        self.done = false;
    }

    fn read_entry(&mut self) -> Result<Option<Cell>> {
        if self.offset >= self.block.data_end {
            return Ok(None);
        }
        let data = &self.block.payload[..self.block.data_end];
        let mut cursor = Cursor::new(data);
        cursor.set_position(self.offset as u64);

        let restart = self.entries_read % RESTART_INTERVAL == 0;
        let (shared_prefix, shared_suffix, middle_len) = match self.block.encoding {
            DataBlockEncoding::None => {
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated entry length".to_string()))?;
                (0u16, 0u16, len)
            }
            DataBlockEncoding::Prefix => {
                let prefix = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated shared prefix".to_string()))?;
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated entry length".to_string()))?;
                (prefix, 0, len)
            }
            DataBlockEncoding::Diff => {
                let prefix = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated shared prefix".to_string()))?;
                let suffix = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated shared suffix".to_string()))?;
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::CorruptFile("truncated entry length".to_string()))?;
                (prefix, suffix, len)
            }
            DataBlockEncoding::FastDiff => {
                if restart {
                    self.prev_prefix = 0;
                    self.prev_suffix = 0;
                    self.prev_middle = 0;
                }
                let prefix = read_delta_u16(&mut cursor, self.prev_prefix)?;
                let suffix = read_delta_u16(&mut cursor, self.prev_suffix)?;
                let len = read_delta_u32(&mut cursor, self.prev_middle)?;
                (prefix, suffix, len)
            }
        };

        let middle_start = cursor.position() as usize;
        let middle_end = middle_start + middle_len as usize;
        if middle_end > self.block.data_end {
            return Err(Error::CorruptFile("entry out of bounds".to_string()));
        }
        let middle = &data[middle_start..middle_end];

        if restart && (shared_prefix != 0 || shared_suffix != 0) {
            return Err(Error::CorruptFile(
                "restart entry shares bytes with predecessor".to_string(),
            ));
        }
        if (shared_prefix as usize + shared_suffix as usize) > self.prev_entry.len() && !restart {
            return Err(Error::CorruptFile(
                "shared bytes exceed previous entry".to_string(),
            ));
        }

        let mut entry =
            Vec::with_capacity(shared_prefix as usize + middle.len() + shared_suffix as usize);
        entry.extend_from_slice(&self.prev_entry[..shared_prefix as usize]);
        entry.extend_from_slice(middle);
        entry.extend_from_slice(&self.prev_entry[self.prev_entry.len() - shared_suffix as usize..]);

        let cell = Cell::decode(&entry)
            .map_err(|e| Error::CorruptFile(format!("undecodable block entry: {e}")))?;

        self.offset = middle_end;
        self.prev_entry = entry;
        self.prev_prefix = shared_prefix;
        self.prev_suffix = shared_suffix;
        self.prev_middle = middle_len;
        self.entries_read += 1;
        Ok(Some(cell))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(cell)) => Some(Ok(cell)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Frames a payload into an on-disk block: header, optional compression,
/// checksum. Returns the complete bytes to append to the file.
pub fn encode_block(
    block_type: BlockType,
    payload: &[u8],
    compression: Compression,
    version: u32,
    prev_offset: u64,
) -> Result<Vec<u8>> {
    let on_disk_payload = match compression {
        Compression::None => payload.to_vec(),
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(payload)
            .map_err(|e| Error::Io(format!("snappy compression failed: {e}")))?,
    };

    let header_size = if version >= FORMAT_V3 {
        BLOCK_HEADER_SIZE_V3
    } else {
        BLOCK_HEADER_SIZE_V2
    };
    let mut block = Vec::with_capacity(header_size + on_disk_payload.len());
    block.extend_from_slice(block_type.magic());
    block
        .write_u32::<BigEndian>(on_disk_payload.len() as u32)
        .unwrap();
    block.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    block.write_u64::<BigEndian>(prev_offset).unwrap();
    if version >= FORMAT_V3 {
        block.write_u8(CHECKSUM_CRC32).unwrap();
        block.write_u32::<BigEndian>(BYTES_PER_CHECKSUM).unwrap();
        block
            .write_u32::<BigEndian>(CRC32.checksum(&on_disk_payload))
            .unwrap();
    }
    block.extend_from_slice(&on_disk_payload);
    Ok(block)
}

/// Parses one framed block. `trailer_checksum` is the file-wide checksum
/// flag: a v3 reader honors a writer that recorded no checksums.
pub fn decode_block(
    bytes: &[u8],
    expected_type: BlockType,
    version: u32,
    trailer_checksum: u8,
) -> Result<Vec<u8>> {
    let header_size = if version >= FORMAT_V3 {
        BLOCK_HEADER_SIZE_V3
    } else {
        BLOCK_HEADER_SIZE_V2
    };
    if bytes.len() < header_size {
        return Err(Error::CorruptFile("truncated block header".to_string()));
    }

    let block_type = BlockType::from_magic(&bytes[..8])?;
    if block_type != expected_type {
        return Err(Error::CorruptFile(format!(
            "expected {expected_type:?} block, found {block_type:?}"
        )));
    }

    let mut cursor = Cursor::new(&bytes[8..header_size]);
    let on_disk_size = cursor.read_u32::<BigEndian>().unwrap() as usize;
    let uncompressed_size = cursor.read_u32::<BigEndian>().unwrap() as usize;
    let _prev_offset = cursor.read_u64::<BigEndian>().unwrap();

    if bytes.len() < header_size + on_disk_size {
        return Err(Error::CorruptFile("truncated block payload".to_string()));
    }
    let on_disk_payload = &bytes[header_size..header_size + on_disk_size];

    if version >= FORMAT_V3 && trailer_checksum != CHECKSUM_NONE {
        let checksum_type = cursor.read_u8().unwrap();
        let _bytes_per_checksum = cursor.read_u32::<BigEndian>().unwrap();
        let stored = cursor.read_u32::<BigEndian>().unwrap();
        if checksum_type == CHECKSUM_CRC32 {
            let actual = CRC32.checksum(on_disk_payload);
            if actual != stored {
                return Err(Error::ChecksumMismatch {
                    expected: stored,
                    actual,
                });
            }
        }
    }

    if on_disk_size == uncompressed_size {
        Ok(on_disk_payload.to_vec())
    } else {
        let payload = snap::raw::Decoder::new()
            .decompress_vec(on_disk_payload)
            .map_err(|e| Error::CorruptFile(format!("decompression failed: {e}")))?;
        if payload.len() != uncompressed_size {
            return Err(Error::CorruptFile(format!(
                "decompressed to {} bytes, header says {}",
                payload.len(),
                uncompressed_size
            )));
        }
        Ok(payload)
    }
}
