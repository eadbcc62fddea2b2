//! Engine maintenance: flushes, compactions, WAL upkeep, replication.
//!
//! Each concern is a plain pass function over the shared engine state; the
//! [`MaintenanceRunner`] drives the passes on their configured intervals
//! from the tokio runtime and stops them together on shutdown.
//!
//! Compaction work flows through two independently sized queues: small
//! requests run ahead of large ones, and large work yields whenever memory
//! pressure wants a flush first. Queue lengths are observable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::fs;
use crate::region::{MemoryAccountant, Region};
use crate::replication::ReplicationTap;
use crate::wal::Wal;

/// The live regions this node serves, shared with the maintenance workers.
#[derive(Default)]
pub struct RegionSet {
    regions: RwLock<Vec<Arc<Region>>>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, region: Arc<Region>) {
        self.regions.write().expect("region set lock").push(region);
    }

    pub fn remove(&self, name: &[u8]) {
        self.regions
            .write()
            .expect("region set lock")
            .retain(|r| r.name() != name);
    }

    pub fn all(&self) -> Vec<Arc<Region>> {
        self.regions.read().expect("region set lock").clone()
    }

    /// Resolves a region by its full name.
    pub fn get(&self, name: &[u8]) -> crate::error::Result<Arc<Region>> {
        self.regions
            .read()
            .expect("region set lock")
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| {
                crate::Error::UnknownRegion(String::from_utf8_lossy(name).into_owned())
            })
    }

    /// Per-region smallest unflushed sequence, for WAL archival.
    pub fn min_unflushed(&self) -> HashMap<Vec<u8>, u64> {
        self.all()
            .into_iter()
            .map(|r| (r.name(), r.min_unflushed_sequence()))
            .collect()
    }
}

/// One queued compaction.
pub struct CompactionRequest {
    pub region: Arc<Region>,
    pub major: bool,
}

/// Two queues: small compactions run first, large ones yield to flushes.
#[derive(Default)]
pub struct CompactionQueues {
    small: Mutex<VecDeque<CompactionRequest>>,
    large: Mutex<VecDeque<CompactionRequest>>,
}

impl CompactionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: CompactionRequest, large: bool) {
        let queue = if large { &self.large } else { &self.small };
        queue.lock().expect("queue lock").push_back(request);
    }

    pub fn lengths(&self) -> (usize, usize) {
        (
            self.small.lock().expect("queue lock").len(),
            self.large.lock().expect("queue lock").len(),
        )
    }

    fn pop_small(&self) -> Option<CompactionRequest> {
        self.small.lock().expect("queue lock").pop_front()
    }

    fn pop_large(&self) -> Option<CompactionRequest> {
        self.large.lock().expect("queue lock").pop_front()
    }
}

/// One flush pass: regions over their flush threshold flush outright, and
/// under global memory pressure the largest regions flush first until usage
/// drops below the low water mark.
pub fn flush_pass(
    regions: &RegionSet,
    memory: &MemoryAccountant,
    config: &EngineConfig,
) -> Result<()> {
    let mut regions = regions.all();

    for region in &regions {
        if region.memstore_size() >= config.memstore_flush_size {
            region.flush()?;
        }
    }

    let lower = config.global_memstore_lower_bytes();
    if memory.used() > lower {
        regions.sort_by_key(|r| std::cmp::Reverse(r.memstore_size()));
        for region in &regions {
            if memory.used() <= lower {
                break;
            }
            if region.memstore_size() > 0 {
                region.flush()?;
            }
        }
    }
    Ok(())
}

/// One compaction pass: enqueue stores over the file-count threshold (or
/// carrying references), then drain the queues, small before large. Large
/// work stays queued while memory pressure has flushes pending.
pub fn compaction_pass(
    regions: &RegionSet,
    queues: &CompactionQueues,
    memory: &MemoryAccountant,
    config: &EngineConfig,
) -> Result<()> {
    for region in regions.all() {
        for (_, store) in region.stores() {
            if store.file_count() >= config.compaction_threshold || store.has_references() {
                let input_size: u64 = store.files().iter().map(|f| f.file_size()).sum();
                let large = input_size >= config.large_compaction_size;
                queues.enqueue(
                    CompactionRequest {
                        region: region.clone(),
                        major: false,
                    },
                    large,
                );
                break;
            }
        }
    }

    while let Some(request) = queues.pop_small() {
        request.region.compact(request.major)?;
    }
    if memory.used() <= config.global_memstore_lower_bytes() {
        while let Some(request) = queues.pop_large() {
            request.region.compact(request.major)?;
        }
    }
    Ok(())
}

/// One archive pass: rolled WAL files every region has flushed past move
/// into `oldWALs/`.
pub fn wal_archive_pass(wal: &Wal, regions: &RegionSet, config: &EngineConfig) -> Result<()> {
    let min_unflushed = regions.min_unflushed();
    for path in wal.archivable_files(&min_unflushed)? {
        let archived = fs::archive_wal(&config.root_dir, &path)?;
        tracing::info!(wal = %archived.display(), "archived wal file");
    }
    Ok(())
}

/// Drives the maintenance passes on their intervals. Workers stop together
/// when the runner shuts down.
pub struct MaintenanceRunner {
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

impl MaintenanceRunner {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Spawns one interval-driven worker around a pass closure. Pass
    /// failures are logged, never fatal to the loop; the next tick retries.
    fn spawn_worker<F>(&self, name: &'static str, period: Duration, mut pass: F)
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pass() {
                            tracing::error!(worker = name, error = %e, "maintenance pass failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!(worker = name, "maintenance worker stopping");
                        break;
                    }
                }
            }
        });
        self.workers.lock().expect("runner lock").push(handle);
    }

    pub fn start_flusher(
        &self,
        regions: Arc<RegionSet>,
        memory: Arc<MemoryAccountant>,
        config: Arc<EngineConfig>,
    ) {
        self.spawn_worker("flusher", config.maintenance.flush_interval, move || {
            flush_pass(&regions, &memory, &config)
        });
    }

    pub fn start_compactor(
        &self,
        regions: Arc<RegionSet>,
        queues: Arc<CompactionQueues>,
        memory: Arc<MemoryAccountant>,
        config: Arc<EngineConfig>,
    ) {
        self.spawn_worker(
            "compactor",
            config.maintenance.compaction_interval,
            move || compaction_pass(&regions, &queues, &memory, &config),
        );
    }

    /// The period roll must fire even with zero write traffic, so the
    /// roller ticks well under the roll period and asks the WAL whether a
    /// roll is due.
    pub fn start_wal_roller(&self, wal: Arc<Wal>, config: Arc<EngineConfig>) {
        let period = config.wal_roll_period;
        self.spawn_worker("wal-roller", config.maintenance.wal_roll_interval, move || {
            wal.roll_if_due(period)?;
            Ok(())
        });
    }

    pub fn start_wal_archiver(
        &self,
        wal: Arc<Wal>,
        regions: Arc<RegionSet>,
        config: Arc<EngineConfig>,
    ) {
        self.spawn_worker(
            "wal-archiver",
            config.maintenance.wal_archive_interval,
            move || wal_archive_pass(&wal, &regions, &config),
        );
    }

    /// Ships the replication tap's pending edits until the buffer drains.
    pub fn start_replication_shipper(
        &self,
        tap: Arc<ReplicationTap>,
        config: Arc<EngineConfig>,
    ) {
        self.spawn_worker(
            "replication-shipper",
            config.maintenance.replication_interval,
            move || {
                while tap.pending_count() > 0 {
                    tap.ship_one_batch()?;
                }
                Ok(())
            },
        );
    }

    /// Signals every worker and waits for them to stop.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send(()).ok();
        for worker in self.workers.lock().expect("runner lock").drain(..) {
            worker.await?;
        }
        Ok(())
    }
}

impl Default for MaintenanceRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::cell::Cell;
    use crate::config::FamilyConfig;
    use crate::hooks::ObserverChain;
    use crate::region::info::RegionInfo;
    use crate::wal::Durability;
    use tempfile::tempdir;

    fn test_region(dir: &std::path::Path) -> (Arc<Region>, Arc<Wal>, Arc<MemoryAccountant>) {
        let config = Arc::new(EngineConfig::new(dir));
        let cache = Arc::new(BlockCache::new(4 << 20));
        let wal = Arc::new(Wal::open(&fs::wals_dir(dir), config.wal_roll_size).unwrap());
        let memory = Arc::new(MemoryAccountant::new(1 << 30));
        let info = RegionInfo::new("default", "t", b"".to_vec(), b"".to_vec(), 1);
        let region = Region::create(
            info,
            vec![FamilyConfig::new("f")],
            config,
            cache,
            wal.clone(),
            memory.clone(),
            ObserverChain::new(false),
        )
        .unwrap();
        (region, wal, memory)
    }

    #[test]
    fn test_region_lookup() {
        let dir = tempdir().unwrap();
        let (region, _wal, _memory) = test_region(dir.path());
        let regions = RegionSet::new();
        regions.add(region.clone());

        assert_eq!(regions.get(&region.name()).unwrap().name(), region.name());
        assert!(matches!(
            regions.get(b"t,nope,0"),
            Err(crate::Error::UnknownRegion(_))
        ));

        regions.remove(&region.name());
        assert!(regions.get(&region.name()).is_err());
    }

    #[test]
    fn test_compaction_queue_lengths() {
        let dir = tempdir().unwrap();
        let (region, _wal, _memory) = test_region(dir.path());
        let queues = CompactionQueues::new();
        assert_eq!(queues.lengths(), (0, 0));

        queues.enqueue(
            CompactionRequest {
                region: region.clone(),
                major: false,
            },
            false,
        );
        queues.enqueue(
            CompactionRequest {
                region,
                major: true,
            },
            true,
        );
        assert_eq!(queues.lengths(), (1, 1));
        assert!(queues.pop_small().is_some());
        assert_eq!(queues.lengths(), (0, 1));
    }

    #[test]
    fn test_flush_pass_over_threshold() {
        let dir = tempdir().unwrap();
        let (region, _wal, memory) = test_region(dir.path());

        for i in 0..50 {
            region
                .put(
                    format!("row{i:02}").as_bytes(),
                    vec![Cell::put(format!("row{i:02}"), "f", "q", 1, "value")],
                    Durability::SyncWal,
                )
                .unwrap();
        }
        assert!(region.memstore_size() > 0);

        let regions = RegionSet::new();
        regions.add(region.clone());
        let mut config = EngineConfig::new(dir.path());
        config.memstore_flush_size = 1;
        flush_pass(&regions, &memory, &config).unwrap();

        assert_eq!(region.memstore_size(), 0);
        let (_, store) = region.stores().next().unwrap();
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn test_compaction_pass_drains_queues() {
        let dir = tempdir().unwrap();
        let (region, _wal, memory) = test_region(dir.path());

        // Three flushed files cross the default threshold.
        for generation in 0..3 {
            region
                .put(
                    b"row",
                    vec![Cell::put("row", "f", "q", generation, "v")],
                    Durability::SyncWal,
                )
                .unwrap();
            region.flush().unwrap();
        }
        let (_, store) = region.stores().next().unwrap();
        assert_eq!(store.file_count(), 3);

        let regions = RegionSet::new();
        regions.add(region.clone());
        let queues = CompactionQueues::new();
        let config = EngineConfig::new(dir.path());
        compaction_pass(&regions, &queues, &memory, &config).unwrap();

        assert_eq!(queues.lengths(), (0, 0));
        let (_, store) = region.stores().next().unwrap();
        assert_eq!(store.file_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_wal_roll_rate() {
        // With rollPeriod P and an idle node for a window L, at least
        // floor(L / P) rolls must be observed.
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.wal_roll_period = Duration::from_millis(50);
        config.maintenance.wal_roll_interval = Duration::from_millis(5);
        let config = Arc::new(config);
        let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), u64::MAX).unwrap());

        let runner = MaintenanceRunner::new();
        runner.start_wal_roller(wal.clone(), config);

        tokio::time::sleep(Duration::from_millis(260)).await;
        runner.shutdown().await.unwrap();

        assert!(
            wal.roll_count() >= 4,
            "expected >= 4 idle rolls, saw {}",
            wal.roll_count()
        );
    }

    #[tokio::test]
    async fn test_wal_archiver_moves_rolled_files() {
        let dir = tempdir().unwrap();
        let (region, wal, _memory) = test_region(dir.path());

        region
            .put(
                b"row1",
                vec![Cell::put("row1", "f", "q", 1, "v")],
                Durability::SyncWal,
            )
            .unwrap();
        region.flush().unwrap();
        wal.roll().unwrap();

        let regions = Arc::new(RegionSet::new());
        regions.add(region);
        let mut config = EngineConfig::new(dir.path());
        config.maintenance.wal_archive_interval = Duration::from_millis(5);
        let config = Arc::new(config);

        let runner = MaintenanceRunner::new();
        runner.start_wal_archiver(wal, regions, config.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.shutdown().await.unwrap();

        let old = fs::old_wals_dir(&config.root_dir);
        assert!(old.exists());
        assert!(std::fs::read_dir(old).unwrap().count() >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let dir = tempdir().unwrap();
        let config = Arc::new(EngineConfig::new(dir.path()));
        let wal = Arc::new(Wal::open(&fs::wals_dir(dir.path()), u64::MAX).unwrap());

        let runner = MaintenanceRunner::new();
        runner.start_wal_roller(wal.clone(), config);

        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.shutdown().await.unwrap();
        let rolls_after_shutdown = wal.roll_count();

        // No worker survives the shutdown.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(wal.roll_count(), rolls_after_shutdown);
    }
}
