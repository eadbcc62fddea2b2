//! mesadb: a wide-column, region-partitioned storage engine.
//!
//! Data is a sorted set of cells (row, family, qualifier, timestamp, type,
//! value, tags) partitioned into row-range regions. Each region owns one
//! store per column family; a store pairs an in-memory sorted buffer with
//! an immutable set of sorted files. Writes go through a shared
//! write-ahead log before landing in memory; background tasks flush
//! buffers into files, compact files together, roll and archive the log.
//! Regions split and merge at the file-system level through reference
//! files, without copying data.

pub mod cache;
pub mod cell;
pub mod config;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod membuffer;
pub mod qos;
pub mod region;
pub mod replication;
pub mod snapshot;
pub mod sortedfile;
pub mod wal;

pub use cache::BlockCache;
pub use cell::{Cell, CellKey, CellType};
pub use config::{EngineConfig, FamilyConfig};
pub use error::{Error, Result};
pub use region::{MemoryAccountant, Region};
pub use wal::{Durability, Wal};
