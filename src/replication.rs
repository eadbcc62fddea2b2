//! Replication tap: ships committed WAL edits to peer sinks.
//!
//! The tap registers as a WAL actions listener. Edits whose column family
//! is scoped GLOBAL are buffered in source order; control records
//! (compaction markers) are skipped. The replication maintenance worker
//! drains the buffer in size-bounded batches to a subset of the live
//! sinks.
//!
//! Sink selection picks `max(1, floor(ratio × liveSinks))` servers. Sinks
//! reported bad past the threshold are dropped; when the live set empties,
//! it is refreshed from the peer catalog. Delivery is at-least-once: a
//! failed batch stays buffered and the receiver de-duplicates by
//! (region, sequence).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::cell::Cell;
use crate::config::ReplicationScope;
use crate::error::Result;
use crate::wal::{WalActionsListener, WalRecord, RECORD_EDIT};
use crate::Error;

/// Consecutive failures before a sink is removed from the live set.
pub const DEFAULT_BAD_SINK_THRESHOLD: u32 = 3;

/// Default batch bound in bytes.
const DEFAULT_BATCH_BYTES: usize = 64 * 1024;

/// One edit as shipped to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedEdit {
    pub region: Vec<u8>,
    pub sequence: u64,
    pub cells: Vec<Cell>,
}

impl ReplicatedEdit {
    fn byte_size(&self) -> usize {
        self.region.len() + 8 + self.cells.iter().map(Cell::heap_size).sum::<usize>()
    }
}

/// A peer server that accepts replicated edits.
pub trait ReplicationSink: Send + Sync {
    fn id(&self) -> &str;
    fn ship(&self, batch: &[ReplicatedEdit]) -> Result<()>;
}

/// Source of candidate sinks (the peer catalog).
pub type SinkCatalog = Box<dyn Fn() -> Vec<Arc<dyn ReplicationSink>> + Send + Sync>;

/// Tracks live sinks, bad reports, and selection.
pub struct SinkManager {
    catalog: SinkCatalog,
    live: RwLock<Vec<Arc<dyn ReplicationSink>>>,
    bad_reports: Mutex<HashMap<String, u32>>,
    ratio: f64,
    rotation: AtomicUsize,
}

impl SinkManager {
    pub fn new(catalog: SinkCatalog, ratio: f64) -> Self {
        let live = catalog();
        Self {
            catalog,
            live: RwLock::new(live),
            bad_reports: Mutex::new(HashMap::new()),
            ratio,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.read().expect("sink lock").len()
    }

    /// Selects `max(1, floor(ratio × live))` sinks, rotating through the
    /// live set so load spreads across peers.
    pub fn choose_sinks(&self) -> Vec<Arc<dyn ReplicationSink>> {
        let live = self.live.read().expect("sink lock");
        if live.is_empty() {
            return Vec::new();
        }
        let k = ((self.ratio * live.len() as f64).floor() as usize).max(1);
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed) % live.len();
        (0..k.min(live.len()))
            .map(|i| live[(offset + i) % live.len()].clone())
            .collect()
    }

    /// Records a delivery failure. Past the threshold the sink is dropped;
    /// an empty live set triggers a catalog refresh.
    pub fn report_bad_sink(&self, sink_id: &str) {
        let over_threshold = {
            let mut reports = self.bad_reports.lock().expect("bad sink lock");
            let count = reports.entry(sink_id.to_string()).or_insert(0);
            *count += 1;
            *count >= DEFAULT_BAD_SINK_THRESHOLD
        };
        if over_threshold {
            let mut live = self.live.write().expect("sink lock");
            live.retain(|s| s.id() != sink_id);
            tracing::warn!(sink = sink_id, "removed bad replication sink");
            if live.is_empty() {
                drop(live);
                self.refresh();
            }
        }
    }

    /// Re-queries the peer catalog and clears the bad set.
    pub fn refresh(&self) {
        let sinks = (self.catalog)();
        tracing::info!(sinks = sinks.len(), "refreshed replication sinks");
        *self.live.write().expect("sink lock") = sinks;
        self.bad_reports.lock().expect("bad sink lock").clear();
    }
}

/// The WAL-attached tap plus its pending buffer.
pub struct ReplicationTap {
    /// family name -> scope; only GLOBAL families replicate.
    scopes: RwLock<HashMap<Vec<u8>, ReplicationScope>>,
    pending: Mutex<VecDeque<ReplicatedEdit>>,
    pending_bytes: AtomicUsize,
    batch_bytes: usize,
    pub sinks: SinkManager,
}

impl ReplicationTap {
    pub fn new(catalog: SinkCatalog, ratio: f64) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_bytes: AtomicUsize::new(0),
            batch_bytes: DEFAULT_BATCH_BYTES,
            sinks: SinkManager::new(catalog, ratio),
        }
    }

    pub fn set_scope(&self, family: Vec<u8>, scope: ReplicationScope) {
        self.scopes.write().expect("scope lock").insert(family, scope);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Drains one batch (bounded by size) and ships it. The batch is
    /// re-queued at the front on failure so per-region source order holds.
    pub fn ship_one_batch(&self) -> Result<usize> {
        let batch = {
            let mut pending = self.pending.lock().expect("pending lock");
            let mut batch = Vec::new();
            let mut bytes = 0usize;
            while let Some(edit) = pending.front() {
                let size = edit.byte_size();
                if !batch.is_empty() && bytes + size > self.batch_bytes {
                    break;
                }
                bytes += size;
                batch.push(pending.pop_front().expect("front checked"));
            }
            self.pending_bytes.fetch_sub(bytes, Ordering::SeqCst);
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let chosen = self.sinks.choose_sinks();
        for sink in &chosen {
            match sink.ship(&batch) {
                Ok(()) => return Ok(batch.len()),
                Err(e) => {
                    tracing::warn!(sink = sink.id(), error = %e, "replication ship failed");
                    self.sinks.report_bad_sink(sink.id());
                }
            }
        }

        // Nothing accepted the batch: put it back, preserving order.
        let bytes: usize = batch.iter().map(ReplicatedEdit::byte_size).sum();
        let mut pending = self.pending.lock().expect("pending lock");
        for edit in batch.into_iter().rev() {
            pending.push_front(edit);
        }
        self.pending_bytes.fetch_add(bytes, Ordering::SeqCst);
        Err(Error::Io("no replication sink accepted the batch".to_string()))
    }
}

impl WalActionsListener for ReplicationTap {
    fn post_append(&self, record: &WalRecord) {
        // Control records (compaction markers and future kinds) never
        // replicate.
        if record.kind != RECORD_EDIT {
            return;
        }
        let scopes = self.scopes.read().expect("scope lock");
        let cells: Vec<Cell> = record
            .cells
            .iter()
            .filter(|cell| {
                matches!(
                    scopes.get(&cell.key.family),
                    Some(ReplicationScope::Global)
                )
            })
            .cloned()
            .collect();
        if cells.is_empty() {
            return;
        }
        let edit = ReplicatedEdit {
            region: record.region.clone(),
            sequence: record.sequence,
            cells,
        };
        self.pending_bytes
            .fetch_add(edit.byte_size(), Ordering::SeqCst);
        self.pending.lock().expect("pending lock").push_back(edit);
    }
}
