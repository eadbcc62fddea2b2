//! Cell model and canonical byte codec.
//!
//! A cell is the atomic unit of the table: (row, family, qualifier,
//! timestamp, type, value, tags). All persistent structures and the in-memory
//! buffer order cells the same way:
//!
//! - row ascending
//! - family ascending
//! - qualifier ascending
//! - timestamp descending (newest version first)
//! - type code ascending (delete markers carry lower codes than puts, so a
//!   tombstone at a timestamp is seen before the put it masks)
//!
//! # Encoded layout
//!
//! ```text
//! +-----------+-----+----------+--------+------------+------+--------+------+
//! |row_len:u16| row |fam_len:u8| family |qual_len:u16| qual | !ts:u64|kind:u8|
//! +-----------+-----+----------+--------+------------+------+--------+------+
//! |val_len:u32| value |tags_len:u16| (tag_kind:u8 tag_len:u16 payload)*     |
//! +-----------+-------+------------+----------------------------------------+
//! ```
//!
//! All integers are big-endian. The timestamp is stored bitwise inverted so
//! that within one (row, family, qualifier) the encoded timestamp bytes sort
//! ascending while logical timestamps sort descending.

use std::cmp::Ordering;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Rows longer than this are rejected at the write path and by the codec.
pub const MAX_ROW_LENGTH: usize = 32 * 1024;

/// Tag type carrying the cell's MVCC write number.
pub const TAG_MVCC: u8 = 1;
/// Tag type carrying an opaque visibility label.
pub const TAG_VISIBILITY: u8 = 2;

/// Cell type codes. Delete markers sort below puts at an equal timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CellType {
    /// Masks every version of every column in the family at or below its
    /// timestamp.
    DeleteFamily = 0,
    /// Masks the single family-wide version at exactly its timestamp.
    DeleteFamilyVersion = 1,
    /// Masks every version of one column at or below its timestamp.
    DeleteColumn = 2,
    /// Masks the single version at exactly its timestamp.
    Delete = 3,
    Put = 4,
}

impl CellType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CellType::DeleteFamily),
            1 => Ok(CellType::DeleteFamilyVersion),
            2 => Ok(CellType::DeleteColumn),
            3 => Ok(CellType::Delete),
            4 => Ok(CellType::Put),
            other => Err(Error::CorruptEncoding(format!(
                "unknown cell type code {other}"
            ))),
        }
    }

    /// True for any delete marker.
    pub fn is_delete(self) -> bool {
        self != CellType::Put
    }

    pub fn is_delete_family(self) -> bool {
        matches!(self, CellType::DeleteFamily | CellType::DeleteFamilyVersion)
    }

    pub fn is_delete_column(self) -> bool {
        self == CellType::DeleteColumn
    }
}

/// An opaque TLV tag attached to a cell (visibility label, MVCC number).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Tag {
    pub fn mvcc(number: u64) -> Self {
        Tag {
            kind: TAG_MVCC,
            payload: number.to_be_bytes().to_vec(),
        }
    }
}

/// The sort key portion of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
    pub kind: CellType,
}

impl CellKey {
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: u64,
        kind: CellType,
    ) -> Self {
        CellKey {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            kind,
        }
    }

    /// The smallest possible key for a row: any real cell in the row orders
    /// at or after it. Used as a scan seek target.
    pub fn first_on_row(row: impl Into<Vec<u8>>) -> Self {
        CellKey::new(row, vec![], vec![], u64::MAX, CellType::DeleteFamily)
    }

    /// True when the two keys address the same (row, family, qualifier).
    pub fn same_column(&self, other: &CellKey) -> bool {
        self.row == other.row && self.family == other.family && self.qualifier == other.qualifier
    }

    /// Encodes just the key portion, the same layout a full cell starts with.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(self.row.len() as u16).unwrap();
        buf.extend_from_slice(&self.row);
        buf.write_u8(self.family.len() as u8).unwrap();
        buf.extend_from_slice(&self.family);
        buf.write_u16::<BigEndian>(self.qualifier.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.qualifier);
        buf.write_u64::<BigEndian>(!self.timestamp).unwrap();
        buf.write_u8(self.kind.code()).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let corrupt = || Error::CorruptEncoding("truncated cell key".to_string());

        let row_len = cursor.read_u16::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut row = vec![0u8; row_len];
        cursor.read_exact(&mut row).map_err(|_| corrupt())?;
        let fam_len = cursor.read_u8().map_err(|_| corrupt())? as usize;
        let mut family = vec![0u8; fam_len];
        cursor.read_exact(&mut family).map_err(|_| corrupt())?;
        let qual_len = cursor.read_u16::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut qualifier = vec![0u8; qual_len];
        cursor.read_exact(&mut qualifier).map_err(|_| corrupt())?;
        let timestamp = !cursor.read_u64::<BigEndian>().map_err(|_| corrupt())?;
        let kind = CellType::from_code(cursor.read_u8().map_err(|_| corrupt())?)?;

        Ok(CellKey {
            row,
            family,
            qualifier,
            timestamp,
            kind,
        })
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            // Newest version first.
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| self.kind.code().cmp(&other.kind.code()))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A full cell: sort key plus value and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub key: CellKey,
    pub value: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl Cell {
    pub fn put(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: u64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Cell {
            key: CellKey::new(row, family, qualifier, timestamp, CellType::Put),
            value: value.into(),
            tags: Vec::new(),
        }
    }

    pub fn delete(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: u64,
        kind: CellType,
    ) -> Self {
        Cell {
            key: CellKey::new(row, family, qualifier, timestamp, kind),
            value: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// The MVCC write number, when present as a tag.
    pub fn mvcc(&self) -> Option<u64> {
        self.tags.iter().find(|t| t.kind == TAG_MVCC).and_then(|t| {
            t.payload
                .as_slice()
                .try_into()
                .ok()
                .map(u64::from_be_bytes)
        })
    }

    pub fn set_mvcc(&mut self, number: u64) {
        self.tags.retain(|t| t.kind != TAG_MVCC);
        self.tags.push(Tag::mvcc(number));
    }

    /// Drops the MVCC tag after the merge has applied the read point.
    pub fn strip_mvcc(&mut self) {
        self.tags.retain(|t| t.kind != TAG_MVCC);
    }

    /// The bloom key at row granularity.
    pub fn bloom_row_key(&self) -> &[u8] {
        &self.key.row
    }

    /// The bloom key at row+column granularity.
    pub fn bloom_rowcol_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key.row.len() + 1 + self.key.qualifier.len());
        key.extend_from_slice(&self.key.row);
        key.push(0);
        key.extend_from_slice(&self.key.qualifier);
        key
    }

    /// Heap footprint estimate used by MemBuffer size accounting.
    pub fn heap_size(&self) -> usize {
        const CELL_OVERHEAD: usize = 64;
        CELL_OVERHEAD
            + self.key.row.len()
            + self.key.family.len()
            + self.key.qualifier.len()
            + self.value.len()
            + self.tags.iter().map(|t| 8 + t.payload.len()).sum::<usize>()
    }

    /// Encodes the cell into `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<usize> {
        if self.key.row.len() > MAX_ROW_LENGTH {
            return Err(Error::InvalidInput(format!(
                "row length {} exceeds maximum {}",
                self.key.row.len(),
                MAX_ROW_LENGTH
            )));
        }
        if self.key.family.len() > u8::MAX as usize {
            return Err(Error::InvalidInput("family name too long".to_string()));
        }
        let start = buf.len();
        buf.write_u16::<BigEndian>(self.key.row.len() as u16)?;
        buf.extend_from_slice(&self.key.row);
        buf.write_u8(self.key.family.len() as u8)?;
        buf.extend_from_slice(&self.key.family);
        buf.write_u16::<BigEndian>(self.key.qualifier.len() as u16)?;
        buf.extend_from_slice(&self.key.qualifier);
        buf.write_u64::<BigEndian>(!self.key.timestamp)?;
        buf.write_u8(self.key.kind.code())?;
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.extend_from_slice(&self.value);
        let tags_len: usize = self.tags.iter().map(|t| 3 + t.payload.len()).sum();
        buf.write_u16::<BigEndian>(tags_len as u16)?;
        for tag in &self.tags {
            buf.write_u8(tag.kind)?;
            buf.write_u16::<BigEndian>(tag.payload.len() as u16)?;
            buf.extend_from_slice(&tag.payload);
        }
        Ok(buf.len() - start)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one cell from the cursor position.
    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        fn truncated<T>(what: &str) -> Result<T> {
            Err(Error::CorruptEncoding(format!("truncated {what}")))
        }

        let row_len = match cursor.read_u16::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return truncated("row length"),
        };
        let mut row = vec![0u8; row_len];
        if cursor.read_exact(&mut row).is_err() {
            return truncated("row");
        }
        let fam_len = match cursor.read_u8() {
            Ok(len) => len as usize,
            Err(_) => return truncated("family length"),
        };
        let mut family = vec![0u8; fam_len];
        if cursor.read_exact(&mut family).is_err() {
            return truncated("family");
        }
        let qual_len = match cursor.read_u16::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return truncated("qualifier length"),
        };
        let mut qualifier = vec![0u8; qual_len];
        if cursor.read_exact(&mut qualifier).is_err() {
            return truncated("qualifier");
        }
        let timestamp = match cursor.read_u64::<BigEndian>() {
            Ok(inverted) => !inverted,
            Err(_) => return truncated("timestamp"),
        };
        let kind = match cursor.read_u8() {
            Ok(code) => CellType::from_code(code)?,
            Err(_) => return truncated("type"),
        };
        let value_len = match cursor.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return truncated("value length"),
        };
        let mut value = vec![0u8; value_len];
        if cursor.read_exact(&mut value).is_err() {
            return truncated("value");
        }
        let tags_len = match cursor.read_u16::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return truncated("tags length"),
        };
        let mut tags = Vec::new();
        let mut remaining = tags_len;
        while remaining > 0 {
            if remaining < 3 {
                return truncated("tag header");
            }
            let kind = cursor.read_u8().map_err(|_| {
                Error::CorruptEncoding("truncated tag kind".to_string())
            })?;
            let len = cursor
                .read_u16::<BigEndian>()
                .map_err(|_| Error::CorruptEncoding("truncated tag length".to_string()))?
                as usize;
            if 3 + len > remaining {
                return truncated("tag payload");
            }
            let mut payload = vec![0u8; len];
            if cursor.read_exact(&mut payload).is_err() {
                return truncated("tag payload");
            }
            tags.push(Tag { kind, payload });
            remaining -= 3 + len;
        }

        Ok(Cell {
            key: CellKey::new(row, family, qualifier, timestamp, kind),
            value,
            tags,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::decode_from(&mut cursor)
    }
}

/// Total ordering over cells, per the model ordering.
pub fn compare(a: &Cell, b: &Cell) -> Ordering {
    a.key.cmp(&b.key)
}
