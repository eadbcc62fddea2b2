//! Region descriptor: the row-range a region owns and the identity derived
//! from it.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Lifecycle states. `Split` and `Merged` are terminal: such a region is
/// never assigned again, its successors take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    Opening,
    Open,
    Closing,
    Closed,
    Splitting,
    Split,
    Merging,
    Merged,
    Offline,
}

impl RegionState {
    /// States a region can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, RegionState::Split | RegionState::Merged)
    }
}

/// Immutable descriptor of a region: table, row-range, creation identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub namespace: String,
    pub table: String,
    pub start_key: Vec<u8>,
    /// Exclusive; empty means "to the end of the table".
    pub end_key: Vec<u8>,
    /// Creation timestamp, part of the region's identity.
    pub region_id: u64,
}

impl RegionInfo {
    pub fn new(
        namespace: impl Into<String>,
        table: impl Into<String>,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
        }
    }

    /// The full region name: `<table>,<startKey>,<regionId>`.
    pub fn name(&self) -> Vec<u8> {
        let mut name = Vec::new();
        name.extend_from_slice(self.table.as_bytes());
        name.push(b',');
        name.extend_from_slice(&self.start_key);
        name.push(b',');
        name.extend_from_slice(self.region_id.to_string().as_bytes());
        name
    }

    /// Directory-safe encoded name: a hash of the full name rendered as hex.
    pub fn encoded_name(&self) -> String {
        format!("{:08x}{:08x}", CRC32.checksum(&self.name()), self.region_id as u32)
    }

    /// True when `row` falls inside [start_key, end_key).
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    /// True when the whole range [start, end] falls inside the region.
    /// The predicate is total over valid ranges and reflexive; a degenerate
    /// range (start > end) is an error, never silently false.
    pub fn contains_range(&self, start: &[u8], end: &[u8]) -> Result<bool> {
        if start > end {
            return Err(Error::InvalidRange(format!(
                "start {start:?} sorts after end {end:?}"
            )));
        }
        Ok(self.contains_row(start) && (self.contains_row(end) || end == self.end_key.as_slice()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::InvalidData(format!("bad region descriptor: {e}")))
    }
}
