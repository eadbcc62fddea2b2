use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Bloom filter granularity for a column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomKind {
    None,
    Row,
    RowCol,
}

/// Data block encoding for a column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBlockEncoding {
    None,
    Prefix,
    Diff,
    FastDiff,
}

/// Block compression for a column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Whether a family's edits are shipped to replication peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationScope {
    Local,
    Global,
}

/// Node-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all persisted state.
    pub root_dir: PathBuf,

    /// Heap budget the fractional limits below are applied to.
    pub heap_size: usize,

    /// Per-region MemBuffer size that triggers a flush (default: 128MB).
    pub memstore_flush_size: usize,

    /// Fraction of heap at which writes are blocked (default: 0.4).
    pub global_memstore_upper_limit: f64,

    /// Fraction of heap at which flushes are forced (default: 0.35).
    pub global_memstore_lower_limit: f64,

    /// Roll the WAL after this long even with no writes (default: 1h).
    pub wal_roll_period: Duration,

    /// Roll the WAL once the current file exceeds this size (default: 128MB).
    pub wal_roll_size: u64,

    /// Store file count that triggers a minor compaction (default: 3).
    pub compaction_threshold: usize,

    /// Store file count over which writes are throttled (default: 16).
    pub blocking_store_files: usize,

    /// Size ratio bound for minor compaction selection (default: 1.2).
    pub compaction_ratio: f64,

    /// Most files one minor compaction may merge (default: 10).
    pub compaction_max_files: usize,

    /// Compactions whose input exceeds this size go on the large queue
    /// (default: 512MB).
    pub large_compaction_size: u64,

    /// Sorted file writer format version, 2 or 3 (default: 3).
    pub format_version: u32,

    /// Upper bound on one index chunk before the index grows another level
    /// (default: 128KB).
    pub index_max_chunk_size: usize,

    /// Block cache capacity as a fraction of heap (default: 0.25).
    pub block_cache_size: f64,

    /// Always cache index and bloom blocks, even for families with data
    /// block caching disabled (default: true).
    pub cache_force_important: bool,

    /// Enable snapshot, clone, and restore operations (default: true).
    pub snapshot_enabled: bool,

    /// Abort the node on observer failure instead of logging (default: false).
    pub coprocessor_abort_on_error: bool,

    /// Maintenance worker intervals.
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often to check memory pressure for flushes (default: 1s).
    pub flush_interval: Duration,

    /// How often to check stores for compaction work (default: 10s).
    pub compaction_interval: Duration,

    /// Tick driving the WAL period roll; must be well under the roll period
    /// (default: 1s).
    pub wal_roll_interval: Duration,

    /// How often to archive fully-flushed WAL files (default: 30s).
    pub wal_archive_interval: Duration,

    /// How often the replication tap ships batched edits (default: 1s).
    pub replication_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./mesadb"),
            heap_size: 1 << 30,
            memstore_flush_size: 128 * 1024 * 1024,
            global_memstore_upper_limit: 0.4,
            global_memstore_lower_limit: 0.35,
            wal_roll_period: Duration::from_secs(3600),
            wal_roll_size: 128 * 1024 * 1024,
            compaction_threshold: 3,
            blocking_store_files: 16,
            compaction_ratio: 1.2,
            compaction_max_files: 10,
            large_compaction_size: 512 * 1024 * 1024,
            format_version: 3,
            index_max_chunk_size: 128 * 1024,
            block_cache_size: 0.25,
            cache_force_important: true,
            snapshot_enabled: true,
            coprocessor_abort_on_error: false,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            wal_roll_interval: Duration::from_secs(1),
            wal_archive_interval: Duration::from_secs(30),
            replication_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    pub fn memstore_flush_size(mut self, size: usize) -> Self {
        self.memstore_flush_size = size;
        self
    }

    pub fn wal_roll_period(mut self, period: Duration) -> Self {
        self.wal_roll_period = period;
        self
    }

    pub fn wal_roll_size(mut self, size: u64) -> Self {
        self.wal_roll_size = size;
        self
    }

    pub fn compaction_threshold(mut self, files: usize) -> Self {
        self.compaction_threshold = files;
        self
    }

    pub fn maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = config;
        self
    }

    /// Write-block watermark in bytes.
    pub fn global_memstore_upper_bytes(&self) -> usize {
        (self.heap_size as f64 * self.global_memstore_upper_limit) as usize
    }

    /// Flush-trigger watermark in bytes.
    pub fn global_memstore_lower_bytes(&self) -> usize {
        (self.heap_size as f64 * self.global_memstore_lower_limit) as usize
    }

    /// Block cache capacity in bytes.
    pub fn block_cache_bytes(&self) -> usize {
        (self.heap_size as f64 * self.block_cache_size) as usize
    }

    /// Applies one recognized configuration key. Unrecognized keys are an
    /// input error; values that fail to parse likewise.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| {
                Error::InvalidInput(format!("bad value {value:?} for key {key:?}"))
            })
        }

        match key {
            "region.memstore.flush.size" => self.memstore_flush_size = parse(key, value)?,
            "regionserver.global.memstore.size.upper.limit" => {
                self.global_memstore_upper_limit = parse(key, value)?
            }
            "regionserver.global.memstore.size.lower.limit" => {
                self.global_memstore_lower_limit = parse(key, value)?
            }
            "wal.logroll.period" => {
                self.wal_roll_period = Duration::from_millis(parse(key, value)?)
            }
            "wal.logroll.size" => self.wal_roll_size = parse(key, value)?,
            "hstore.compactionThreshold" => self.compaction_threshold = parse(key, value)?,
            "hstore.blockingStoreFiles" => self.blocking_store_files = parse(key, value)?,
            "hfile.format.version" => {
                let version: u32 = parse(key, value)?;
                if version != 2 && version != 3 {
                    return Err(Error::InvalidInput(format!(
                        "unsupported format version {version}"
                    )));
                }
                self.format_version = version;
            }
            "hfile.index.max.chunksize" => self.index_max_chunk_size = parse(key, value)?,
            "hfile.block.cache.size" => self.block_cache_size = parse(key, value)?,
            "block.cache.force.important" => self.cache_force_important = parse(key, value)?,
            "snapshot.enabled" => self.snapshot_enabled = parse(key, value)?,
            "coprocessor.abort.on.error" => self.coprocessor_abort_on_error = parse(key, value)?,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unrecognized configuration key {other:?}"
                )))
            }
        }
        Ok(())
    }
}

/// Per-column-family configuration.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub name: Vec<u8>,

    /// Versions retained per column after compaction (default: 1).
    pub max_versions: u32,

    /// Time-to-live; cells older than this are dropped in compaction.
    /// `None` keeps cells forever.
    pub ttl: Option<Duration>,

    /// Target data block size (default: 64KB).
    pub block_size: usize,

    pub bloom: BloomKind,
    pub encoding: DataBlockEncoding,
    pub compression: Compression,

    /// Cache data blocks read for this family (index and bloom blocks are
    /// governed by the engine-wide force-important flag).
    pub block_cache_enabled: bool,

    /// Persist MVCC numbers as cell tags.
    pub includes_mvcc: bool,

    /// Persist user tags.
    pub includes_tags: bool,

    pub replication_scope: ReplicationScope,
}

impl FamilyConfig {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            max_versions: 1,
            ttl: None,
            block_size: 64 * 1024,
            bloom: BloomKind::Row,
            encoding: DataBlockEncoding::None,
            compression: Compression::None,
            block_cache_enabled: true,
            includes_mvcc: true,
            includes_tags: true,
            replication_scope: ReplicationScope::Local,
        }
    }

    pub fn max_versions(mut self, versions: u32) -> Self {
        self.max_versions = versions;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn bloom(mut self, bloom: BloomKind) -> Self {
        self.bloom = bloom;
        self
    }

    pub fn encoding(mut self, encoding: DataBlockEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn block_cache_enabled(mut self, enabled: bool) -> Self {
        self.block_cache_enabled = enabled;
        self
    }

    pub fn replication_scope(mut self, scope: ReplicationScope) -> Self {
        self.replication_scope = scope;
        self
    }

    /// Applies one recognized per-family key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "cells.includes.mvcc" => {
                self.includes_mvcc = value
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("bad value {value:?}")))?
            }
            "cells.includes.tags" => {
                self.includes_tags = value
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("bad value {value:?}")))?
            }
            "cells.compression" => {
                self.compression = match value {
                    "NONE" => Compression::None,
                    "SNAPPY" => Compression::Snappy,
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "unsupported compression {other:?}"
                        )))
                    }
                }
            }
            "cells.bloom" => {
                self.bloom = match value {
                    "NONE" => BloomKind::None,
                    "ROW" => BloomKind::Row,
                    "ROWCOL" => BloomKind::RowCol,
                    other => {
                        return Err(Error::InvalidInput(format!("unsupported bloom {other:?}")))
                    }
                }
            }
            "cells.encoding" => {
                self.encoding = match value {
                    "NONE" => DataBlockEncoding::None,
                    "PREFIX" => DataBlockEncoding::Prefix,
                    "DIFF" => DataBlockEncoding::Diff,
                    "FAST_DIFF" => DataBlockEncoding::FastDiff,
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "unsupported encoding {other:?}"
                        )))
                    }
                }
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unrecognized family key {other:?}"
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.memstore_flush_size, 128 * 1024 * 1024);
        assert_eq!(config.format_version, 3);
        assert!(config.cache_force_important);
        assert_eq!(config.compaction_threshold, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/mesa")
            .memstore_flush_size(32 * 1024 * 1024)
            .wal_roll_period(Duration::from_secs(60))
            .compaction_threshold(5);

        assert_eq!(config.root_dir, PathBuf::from("/tmp/mesa"));
        assert_eq!(config.memstore_flush_size, 32 * 1024 * 1024);
        assert_eq!(config.wal_roll_period, Duration::from_secs(60));
        assert_eq!(config.compaction_threshold, 5);
    }

    #[test]
    fn test_recognized_keys() {
        let mut config = EngineConfig::default();
        config.set("wal.logroll.period", "4000").unwrap();
        assert_eq!(config.wal_roll_period, Duration::from_millis(4000));

        config.set("hstore.compactionThreshold", "7").unwrap();
        assert_eq!(config.compaction_threshold, 7);

        config.set("hfile.format.version", "2").unwrap();
        assert_eq!(config.format_version, 2);

        assert!(config.set("hfile.format.version", "9").is_err());
        assert!(config.set("no.such.key", "1").is_err());
    }

    #[test]
    fn test_family_keys() {
        let mut family = FamilyConfig::new("f");
        family.set("cells.bloom", "ROWCOL").unwrap();
        assert_eq!(family.bloom, BloomKind::RowCol);
        family.set("cells.encoding", "FAST_DIFF").unwrap();
        assert_eq!(family.encoding, DataBlockEncoding::FastDiff);
        assert!(family.set("cells.encoding", "LZ9").is_err());
    }
}
