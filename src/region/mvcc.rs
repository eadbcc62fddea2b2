//! Multi-version concurrency control for one region.
//!
//! Every write commits under a monotonically increasing write number;
//! readers observe only writes at or below the read point, which advances
//! once no earlier write is still in flight. A scan therefore sees a
//! consistent snapshot even while later writes land.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct Mvcc {
    write_point: AtomicU64,
    read_point: AtomicU64,
    pending: Mutex<VecDeque<(u64, bool)>>,
}

/// A write in flight. Must be completed (or abandoned) exactly once.
#[derive(Debug)]
pub struct WriteEntry {
    pub number: u64,
}

impl Mvcc {
    pub fn new() -> Self {
        Self {
            write_point: AtomicU64::new(0),
            read_point: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Restores the points during recovery so new writes continue above
    /// everything replayed.
    pub fn advance_to(&self, number: u64) {
        self.write_point.fetch_max(number, Ordering::SeqCst);
        self.read_point.fetch_max(number, Ordering::SeqCst);
    }

    /// Starts a write, allocating its number.
    pub fn begin_write(&self) -> WriteEntry {
        let number = self.write_point.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending
            .lock()
            .expect("mvcc lock")
            .push_back((number, false));
        WriteEntry { number }
    }

    /// Marks a write complete and advances the read point across the
    /// contiguous prefix of completed writes.
    pub fn complete_write(&self, entry: WriteEntry) {
        let mut pending = self.pending.lock().expect("mvcc lock");
        if let Some(slot) = pending.iter_mut().find(|(n, _)| *n == entry.number) {
            slot.1 = true;
        }
        while let Some((number, done)) = pending.front().copied() {
            if !done {
                break;
            }
            pending.pop_front();
            self.read_point.fetch_max(number, Ordering::SeqCst);
        }
    }

    /// The snapshot point current readers observe.
    pub fn read_point(&self) -> u64 {
        self.read_point.load(Ordering::SeqCst)
    }
}

impl Default for Mvcc {
    fn default() -> Self {
        Self::new()
    }
}
