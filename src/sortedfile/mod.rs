//! Persistent immutable sorted files.
//!
//! A sorted file is the on-disk unit a store flush or compaction produces.
//! It is append-only while being written and becomes visible to readers only
//! after the trailer is written and the file is renamed into place.
//!
//! # File layout
//!
//! ```text
//! +--------------------+
//! | Data block 0       |   cells, block-encoded, optionally compressed
//! +--------------------+
//! | Data block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Bloom chunk(s)     |   optional
//! +--------------------+
//! | Leaf index block(s)|
//! +--------------------+
//! | Intermediate index |   only when the leaf level outgrows one chunk
//! +--------------------+
//! | Root index block   |
//! +--------------------+
//! | Bloom meta block   |   optional
//! +--------------------+
//! | File info block    |
//! +--------------------+
//! | Trailer            |
//! | trailer_len: u32   |
//! | magic: 8 bytes     |
//! +--------------------+
//! ```
//!
//! Every block starts with a fixed header carrying its type magic, on-disk
//! and uncompressed sizes, the previous block's offset, and (format v3) a
//! checksum over the payload. Format v2 omits the checksum fields: its
//! header is 24 bytes against v3's 33.

pub mod block;
pub mod bloom;
pub mod index;
pub mod reader;
pub mod writer;

pub use reader::SortedFileReader;
pub use writer::{FinishedFile, SortedFileWriter};

use crate::error::Result;
use crate::Error;

/// Magic terminating every sorted file.
pub const FILE_MAGIC: &[u8; 8] = b"MESAFIL\0";

/// Supported writer format versions.
pub const FORMAT_V2: u32 = 2;
pub const FORMAT_V3: u32 = 3;

/// v3 block header: 8 (magic) + 4 + 4 + 8 + 1 + 4 + 4.
pub const BLOCK_HEADER_SIZE_V3: usize = 33;
/// v2 block header: 8 (magic) + 4 + 4 + 8, no checksum.
pub const BLOCK_HEADER_SIZE_V2: usize = 24;

/// Checksum algorithm codes stored in v3 block headers.
pub const CHECKSUM_NONE: u8 = 0;
pub const CHECKSUM_CRC32: u8 = 1;

/// Bytes of payload covered per checksum word. One checksum covers the whole
/// payload; the field is recorded for format compatibility.
pub const BYTES_PER_CHECKSUM: u32 = 16 * 1024;

/// Block type, identified on disk by an 8-byte magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Data,
    EncodedData,
    LeafIndex,
    IntermediateIndex,
    RootIndex,
    BloomChunk,
    BloomMeta,
    FileInfo,
}

impl BlockType {
    pub fn magic(self) -> &'static [u8; 8] {
        match self {
            BlockType::Data => b"DATABLK*",
            BlockType::EncodedData => b"ENCDBLK*",
            BlockType::LeafIndex => b"LEAFIDX*",
            BlockType::IntermediateIndex => b"INTMIDX*",
            BlockType::RootIndex => b"ROOTIDX*",
            BlockType::BloomChunk => b"BLMCHNK*",
            BlockType::BloomMeta => b"BLMMETA*",
            BlockType::FileInfo => b"FILEINF*",
        }
    }

    pub fn from_magic(magic: &[u8]) -> Result<Self> {
        match magic {
            b"DATABLK*" => Ok(BlockType::Data),
            b"ENCDBLK*" => Ok(BlockType::EncodedData),
            b"LEAFIDX*" => Ok(BlockType::LeafIndex),
            b"INTMIDX*" => Ok(BlockType::IntermediateIndex),
            b"ROOTIDX*" => Ok(BlockType::RootIndex),
            b"BLMCHNK*" => Ok(BlockType::BloomChunk),
            b"BLMMETA*" => Ok(BlockType::BloomMeta),
            b"FILEINF*" => Ok(BlockType::FileInfo),
            other => Err(Error::CorruptFile(format!(
                "unknown block magic {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Fixed per-file metadata written last and read first.
#[derive(Debug, Clone, PartialEq)]
pub struct Trailer {
    pub version: u32,
    pub checksum_type: u8,
    pub root_index_offset: u64,
    pub root_index_size: u32,
    pub bloom_meta_offset: u64,
    pub bloom_meta_size: u32,
    pub file_info_offset: u64,
    pub file_info_size: u32,
    pub entry_count: u64,
    pub total_uncompressed_bytes: u64,
    pub max_sequence: u64,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
}

impl Trailer {
    pub fn encode(&self) -> Vec<u8> {
        use byteorder::{BigEndian, WriteBytesExt};
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.version).unwrap();
        buf.write_u8(self.checksum_type).unwrap();
        buf.write_u64::<BigEndian>(self.root_index_offset).unwrap();
        buf.write_u32::<BigEndian>(self.root_index_size).unwrap();
        buf.write_u64::<BigEndian>(self.bloom_meta_offset).unwrap();
        buf.write_u32::<BigEndian>(self.bloom_meta_size).unwrap();
        buf.write_u64::<BigEndian>(self.file_info_offset).unwrap();
        buf.write_u32::<BigEndian>(self.file_info_size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.total_uncompressed_bytes)
            .unwrap();
        buf.write_u64::<BigEndian>(self.max_sequence).unwrap();
        buf.write_u32::<BigEndian>(self.first_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.first_key);
        buf.write_u32::<BigEndian>(self.last_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.last_key);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        use byteorder::{BigEndian, ReadBytesExt};
        use std::io::Read;

        let mut cursor = std::io::Cursor::new(bytes);
        let corrupt = |what: &str| Error::CorruptFile(format!("truncated trailer: {what}"));

        let version = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("version"))?;
        if version != FORMAT_V2 && version != FORMAT_V3 {
            return Err(Error::CorruptFile(format!(
                "unsupported format version {version}"
            )));
        }
        let checksum_type = cursor.read_u8().map_err(|_| corrupt("checksum type"))?;
        let root_index_offset = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("root index offset"))?;
        let root_index_size = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("root index size"))?;
        let bloom_meta_offset = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("bloom meta offset"))?;
        let bloom_meta_size = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("bloom meta size"))?;
        let file_info_offset = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("file info offset"))?;
        let file_info_size = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("file info size"))?;
        let entry_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("entry count"))?;
        let total_uncompressed_bytes = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("uncompressed bytes"))?;
        let max_sequence = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| corrupt("max sequence"))?;

        let first_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("first key length"))? as usize;
        let mut first_key = vec![0u8; first_len];
        cursor
            .read_exact(&mut first_key)
            .map_err(|_| corrupt("first key"))?;
        let last_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("last key length"))? as usize;
        let mut last_key = vec![0u8; last_len];
        cursor
            .read_exact(&mut last_key)
            .map_err(|_| corrupt("last key"))?;

        Ok(Trailer {
            version,
            checksum_type,
            root_index_offset,
            root_index_size,
            bloom_meta_offset,
            bloom_meta_size,
            file_info_offset,
            file_info_size,
            entry_count,
            total_uncompressed_bytes,
            max_sequence,
            first_key,
            last_key,
        })
    }
}
