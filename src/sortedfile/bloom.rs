//! Bloom filters over the rows (or row+column pairs) present in a file.
//!
//! The filter is chunked: each chunk covers a contiguous run of keys and is
//! stored as its own block, so a point lookup touches one chunk, not the
//! whole filter. A meta block lists each chunk's first key and location.
//!
//! Probing uses double hashing over a 64-bit FNV-1a base hash; the probe
//! count is derived from bits-per-key and recorded in the chunk's last byte.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Keys per chunk before a new chunk is started.
pub const KEYS_PER_CHUNK: usize = 4096;

const DEFAULT_BITS_PER_KEY: usize = 10;

fn fnv1a(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn probe_count(bits_per_key: usize) -> u8 {
    // k = bits_per_key * ln(2), clamped.
    let k = (bits_per_key as f64 * 0.69) as usize;
    k.clamp(1, 30) as u8
}

/// Builds one bloom chunk.
pub struct BloomChunkBuilder {
    hashes: Vec<u64>,
    bits_per_key: usize,
}

impl BloomChunkBuilder {
    pub fn new() -> Self {
        Self {
            hashes: Vec::new(),
            bits_per_key: DEFAULT_BITS_PER_KEY,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.hashes.push(fnv1a(key));
    }

    pub fn key_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Serializes the chunk: bit array followed by the probe count byte.
    pub fn finish(self) -> Vec<u8> {
        let bits = (self.hashes.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;
        let k = probe_count(self.bits_per_key);

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = k;
        for hash in self.hashes {
            let delta = hash.rotate_right(17);
            let mut h = hash;
            for _ in 0..k {
                let bit = (h % bits as u64) as usize;
                filter[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
        filter
    }
}

impl Default for BloomChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Probes a serialized chunk. Returns true when the key may be present.
pub fn may_contain(chunk: &[u8], key: &[u8]) -> bool {
    if chunk.len() < 2 {
        return true;
    }
    let bytes = chunk.len() - 1;
    let bits = bytes * 8;
    let k = chunk[bytes];
    if k == 0 || k > 30 {
        // Unrecognized probe count: err on the side of a disk read.
        return true;
    }

    let hash = fnv1a(key);
    let delta = hash.rotate_right(17);
    let mut h = hash;
    for _ in 0..k {
        let bit = (h % bits as u64) as usize;
        if chunk[bit / 8] & (1 << (bit % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

/// One chunk's entry in the bloom meta block.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomChunkRef {
    pub first_key: Vec<u8>,
    pub offset: u64,
    pub on_disk_size: u32,
}

/// Bloom meta block contents: granularity plus the chunk directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomMeta {
    /// 0 = row granularity, 1 = row+column.
    pub granularity: u8,
    pub chunks: Vec<BloomChunkRef>,
}

impl BloomMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u8(self.granularity).unwrap();
        buf.write_u32::<BigEndian>(self.chunks.len() as u32).unwrap();
        for chunk in &self.chunks {
            buf.write_u32::<BigEndian>(chunk.first_key.len() as u32)
                .unwrap();
            buf.extend_from_slice(&chunk.first_key);
            buf.write_u64::<BigEndian>(chunk.offset).unwrap();
            buf.write_u32::<BigEndian>(chunk.on_disk_size).unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        use std::io::Read;
        let mut cursor = std::io::Cursor::new(bytes);
        let corrupt = || Error::CorruptFile("truncated bloom meta".to_string());

        let granularity = cursor.read_u8().map_err(|_| corrupt())?;
        let count = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
            let mut first_key = vec![0u8; key_len];
            cursor.read_exact(&mut first_key).map_err(|_| corrupt())?;
            let offset = cursor.read_u64::<BigEndian>().map_err(|_| corrupt())?;
            let on_disk_size = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())?;
            chunks.push(BloomChunkRef {
                first_key,
                offset,
                on_disk_size,
            });
        }
        Ok(BloomMeta {
            granularity,
            chunks,
        })
    }

    /// The chunk that would hold `key`: the last chunk whose first key is
    /// <= the probe key. Chunk first-keys are plain bloom keys, compared
    /// bytewise.
    pub fn chunk_for(&self, key: &[u8]) -> Option<&BloomChunkRef> {
        let index = self
            .chunks
            .partition_point(|c| c.first_key.as_slice() <= key);
        if index == 0 {
            None
        } else {
            Some(&self.chunks[index - 1])
        }
    }
}
