//! WAL record codec and replay iteration.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{CRC32, HEADER_SIZE, RECORD_EDIT, WAL_MAGIC};
use crate::cell::Cell;
use crate::error::Result;
use crate::Error;

/// One log record. `cells` is populated for edit records; control records
/// carry their bytes in `payload`.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub kind: u8,
    pub region: Vec<u8>,
    pub sequence: u64,
    pub write_time: u64,
    pub cells: Vec<Cell>,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u8(self.kind)?;
        buf.write_u16::<BigEndian>(self.region.len() as u16)?;
        buf.extend_from_slice(&self.region);
        buf.write_u64::<BigEndian>(self.sequence)?;
        buf.write_u64::<BigEndian>(self.write_time)?;
        match self.kind {
            RECORD_EDIT => {
                buf.write_u32::<BigEndian>(self.cells.len() as u32)?;
                for cell in &self.cells {
                    cell.encode_into(&mut buf)?;
                }
            }
            _ => {
                buf.write_u32::<BigEndian>(self.payload.len() as u32)?;
                buf.extend_from_slice(&self.payload);
            }
        }
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let corrupt = || Error::InvalidData("truncated wal record".to_string());

        let kind = cursor.read_u8().map_err(|_| corrupt())?;
        let region_len = cursor.read_u16::<BigEndian>().map_err(|_| corrupt())? as usize;
        let mut region = vec![0u8; region_len];
        cursor.read_exact(&mut region).map_err(|_| corrupt())?;
        let sequence = cursor.read_u64::<BigEndian>().map_err(|_| corrupt())?;
        let write_time = cursor.read_u64::<BigEndian>().map_err(|_| corrupt())?;

        let mut record = WalRecord {
            kind,
            region,
            sequence,
            write_time,
            cells: Vec::new(),
            payload: Vec::new(),
        };

        match kind {
            RECORD_EDIT => {
                let count = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
                let bytes = cursor.get_ref();
                let mut inner = Cursor::new(&bytes[cursor.position() as usize..]);
                for _ in 0..count {
                    record
                        .cells
                        .push(Cell::decode_from(&mut inner).map_err(|e| {
                            Error::InvalidData(format!("bad cell in wal record: {e}"))
                        })?);
                }
            }
            _ => {
                // Control records and unknown kinds keep their raw bytes;
                // the caller decides whether it understands them.
                let len = cursor.read_u32::<BigEndian>().map_err(|_| corrupt())? as usize;
                let mut payload = vec![0u8; len];
                cursor.read_exact(&mut payload).map_err(|_| corrupt())?;
                record.payload = payload;
            }
        }
        Ok(record)
    }
}

/// Iterates a WAL file's records in order. A torn record at the tail (the
/// write the crash interrupted) ends iteration cleanly; corruption in the
/// middle of the file surfaces as an error.
pub struct WalReplayer {
    reader: BufReader<File>,
}

impl WalReplayer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Io(format!("open {}: {e}", path.display())))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| Error::InvalidData("wal file shorter than its header".to_string()))?;
        if &magic != WAL_MAGIC {
            return Err(Error::InvalidData("bad wal magic".to_string()));
        }
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(Self { reader })
    }

    fn read_record(&mut self) -> Result<Option<WalRecord>> {
        let record_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; record_len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                // Torn tail record.
                return Ok(None);
            }
            return Err(e.into());
        }
        let stored_crc = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let computed = CRC32.checksum(&payload);
        if computed != stored_crc {
            return Err(Error::InvalidData(format!(
                "wal record checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        WalRecord::decode(&payload).map(Some)
    }
}

impl Iterator for WalReplayer {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{Durability, Wal};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_record_roundtrip() {
        let record = WalRecord {
            kind: RECORD_EDIT,
            region: b"region-1".to_vec(),
            sequence: 17,
            write_time: 12345,
            cells: vec![
                Cell::put("r1", "f", "q1", 10, "v1"),
                Cell::put("r1", "f", "q2", 10, "v2"),
            ],
            payload: Vec::new(),
        };
        let decoded = WalRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.region, record.region);
        assert_eq!(decoded.sequence, 17);
        assert_eq!(decoded.cells, record.cells);
    }

    #[test]
    fn test_unknown_kind_preserved_not_fatal() {
        let record = WalRecord {
            kind: 99,
            region: b"r".to_vec(),
            sequence: 0,
            write_time: 0,
            cells: Vec::new(),
            payload: b"future bytes".to_vec(),
        };
        let decoded = WalRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, 99);
        assert_eq!(decoded.payload, b"future bytes");
    }

    #[test]
    fn test_torn_tail_is_clean_eof() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();
        wal.append(b"r", &[Cell::put("a", "f", "q", 1, "v")], Durability::SyncWal)
            .unwrap();
        let path = wal.current_path();
        drop(wal);

        // Append half a record: a length prefix with no payload behind it.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 1, 0]).unwrap();
        file.write_all(b"par").unwrap();
        drop(file);

        let records: Vec<WalRecord> = WalReplayer::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_mid_file_corruption_detected() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), u64::MAX).unwrap();
        for i in 0..3 {
            wal.append(
                b"r",
                &[Cell::put(format!("row{i}"), "f", "q", 1, "value")],
                Durability::SyncWal,
            )
            .unwrap();
        }
        let path = wal.current_path();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the first record's payload.
        bytes[HEADER_SIZE + 10] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut replayer = WalReplayer::open(&path).unwrap();
        assert!(matches!(
            replayer.next(),
            Some(Err(Error::InvalidData(_)))
        ));
    }
}
