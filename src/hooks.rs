//! In-process observer hooks.
//!
//! Observers are trait objects invoked synchronously at fixed lifecycle
//! points. Every hook receives an [`ObserverContext`]: `bypass()` tells the
//! engine to skip its default processing, `complete()` short-circuits the
//! remaining observers in the chain. Observers must not retain the context.
//!
//! A failing observer either aborts the server or is logged and skipped,
//! per the `coprocessor.abort.on.error` setting.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cell::Cell;
use crate::error::Result;
use crate::Error;

/// Signals an observer can raise during a hook invocation.
#[derive(Debug, Default)]
pub struct ObserverContext {
    bypass: bool,
    complete: bool,
}

impl ObserverContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the engine's default processing for this operation.
    pub fn bypass(&mut self) {
        self.bypass = true;
    }

    /// Stop invoking the remaining observers in the chain.
    pub fn complete(&mut self) {
        self.complete = true;
    }

    pub fn should_bypass(&self) -> bool {
        self.bypass
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// The hook taxonomy. Every method is a no-op by default; implementations
/// override the points they care about.
#[allow(unused_variables)]
pub trait RegionObserver: Send + Sync {
    fn pre_open(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_open(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn pre_close(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_close(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }

    fn pre_log_replay(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_log_replay(&self, ctx: &mut ObserverContext, edits: usize) -> Result<()> {
        Ok(())
    }

    fn pre_flush(&self, ctx: &mut ObserverContext, family: &[u8]) -> Result<()> {
        Ok(())
    }
    fn pre_flush_scanner_open(&self, ctx: &mut ObserverContext, family: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_flush(&self, ctx: &mut ObserverContext, family: &[u8], file_id: u64) -> Result<()> {
        Ok(())
    }

    /// May prune or replace the candidate file list; bypass skips the
    /// compaction entirely.
    fn pre_compact_selection(
        &self,
        ctx: &mut ObserverContext,
        family: &[u8],
        candidates: &mut Vec<u64>,
    ) -> Result<()> {
        Ok(())
    }
    fn post_compact_selection(
        &self,
        ctx: &mut ObserverContext,
        family: &[u8],
        selected: &[u64],
    ) -> Result<()> {
        Ok(())
    }
    fn pre_compact(&self, ctx: &mut ObserverContext, family: &[u8], major: bool) -> Result<()> {
        Ok(())
    }
    fn pre_compact_scanner_open(
        &self,
        ctx: &mut ObserverContext,
        family: &[u8],
    ) -> Result<()> {
        Ok(())
    }
    fn post_compact(
        &self,
        ctx: &mut ObserverContext,
        family: &[u8],
        new_file_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_split(&self, ctx: &mut ObserverContext, split_row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn pre_split_before_ponr(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn pre_split_after_ponr(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_split(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_rollback_split(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }

    fn pre_merge(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn pre_merge_after_ponr(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_merge(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_rollback_merge(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }

    fn pre_get(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_get(
        &self,
        ctx: &mut ObserverContext,
        row: &[u8],
        results: &mut Vec<Cell>,
    ) -> Result<()> {
        Ok(())
    }
    fn pre_exists(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_exists(&self, ctx: &mut ObserverContext, row: &[u8], exists: bool) -> Result<()> {
        Ok(())
    }

    fn pre_put(&self, ctx: &mut ObserverContext, row: &[u8], cells: &[Cell]) -> Result<()> {
        Ok(())
    }
    fn post_put(&self, ctx: &mut ObserverContext, row: &[u8], cells: &[Cell]) -> Result<()> {
        Ok(())
    }
    fn pre_delete(&self, ctx: &mut ObserverContext, row: &[u8], cells: &[Cell]) -> Result<()> {
        Ok(())
    }
    fn post_delete(&self, ctx: &mut ObserverContext, row: &[u8], cells: &[Cell]) -> Result<()> {
        Ok(())
    }

    fn pre_batch_mutate(&self, ctx: &mut ObserverContext, count: usize) -> Result<()> {
        Ok(())
    }
    fn post_batch_mutate(&self, ctx: &mut ObserverContext, count: usize) -> Result<()> {
        Ok(())
    }
    /// Runs after a batch regardless of its outcome, success or failure.
    fn post_batch_mutate_indispensably(
        &self,
        ctx: &mut ObserverContext,
        count: usize,
        success: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_check_and_put(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_check_and_put(
        &self,
        ctx: &mut ObserverContext,
        row: &[u8],
        passed: bool,
    ) -> Result<()> {
        Ok(())
    }
    fn pre_check_and_delete(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_check_and_delete(
        &self,
        ctx: &mut ObserverContext,
        row: &[u8],
        passed: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_append(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_append(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn pre_increment(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_increment(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }

    fn pre_scanner_open(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_scanner_open(&self, ctx: &mut ObserverContext, scanner_id: u64) -> Result<()> {
        Ok(())
    }
    fn pre_scanner_next(&self, ctx: &mut ObserverContext, scanner_id: u64) -> Result<()> {
        Ok(())
    }
    fn post_scanner_next(
        &self,
        ctx: &mut ObserverContext,
        scanner_id: u64,
        rows: usize,
    ) -> Result<()> {
        Ok(())
    }
    fn pre_scanner_close(&self, ctx: &mut ObserverContext, scanner_id: u64) -> Result<()> {
        Ok(())
    }
    fn post_scanner_close(&self, ctx: &mut ObserverContext, scanner_id: u64) -> Result<()> {
        Ok(())
    }
    /// Fired when a server-side filter vetoes a row, so observers can
    /// early-terminate the scan.
    fn post_filter_row(&self, ctx: &mut ObserverContext, row: &[u8]) -> Result<()> {
        Ok(())
    }

    fn pre_bulk_load(&self, ctx: &mut ObserverContext, family: &[u8]) -> Result<()> {
        Ok(())
    }
    fn post_bulk_load(&self, ctx: &mut ObserverContext, family: &[u8]) -> Result<()> {
        Ok(())
    }

    fn pre_wal_restore(&self, ctx: &mut ObserverContext, sequence: u64) -> Result<()> {
        Ok(())
    }
    fn post_wal_restore(&self, ctx: &mut ObserverContext, sequence: u64) -> Result<()> {
        Ok(())
    }

    fn pre_log_roll(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
    fn post_log_roll(&self, ctx: &mut ObserverContext) -> Result<()> {
        Ok(())
    }
}

/// An ordered chain of observers plus the failure policy.
#[derive(Clone)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn RegionObserver>>,
    abort_on_error: bool,
}

impl ObserverChain {
    pub fn new(abort_on_error: bool) -> Self {
        Self {
            observers: Vec::new(),
            abort_on_error,
        }
    }

    pub fn register(&mut self, observer: Arc<dyn RegionObserver>) {
        self.observers.push(observer);
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Invokes one hook across the chain. Returns whether any observer
    /// asked to bypass default processing. A failing observer aborts under
    /// abort-on-error, otherwise it is logged and the chain continues.
    pub fn invoke<F>(&self, mut hook: F) -> Result<bool>
    where
        F: FnMut(&dyn RegionObserver, &mut ObserverContext) -> Result<()>,
    {
        let mut ctx = ObserverContext::new();
        for observer in &self.observers {
            if let Err(e) = hook(observer.as_ref(), &mut ctx) {
                if self.abort_on_error {
                    return Err(Error::Io(format!("observer failed: {e}")));
                }
                tracing::warn!(error = %e, "observer failed, continuing");
            }
            if ctx.is_complete() {
                break;
            }
        }
        Ok(ctx.should_bypass())
    }
}

/// Build-time registry mapping observer names to factories, replacing
/// runtime class loading.
#[derive(Default)]
pub struct ObserverRegistry {
    factories: HashMap<String, fn() -> Arc<dyn RegionObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: fn() -> Arc<dyn RegionObserver>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn instantiate(&self, name: &str) -> Result<Arc<dyn RegionObserver>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::InvalidInput(format!("unknown observer {name:?}")))
    }
}
