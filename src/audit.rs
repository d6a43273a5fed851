//! Index audit and drift repair.
//!
//! # Overview
//!
//! The auditor walks the *index*, not the filesystem: entries stream out of
//! the store in fixed-size batches (keyset pagination, so the walk stays
//! bounded in memory and tolerates entries vanishing mid-run) and are
//! dispatched across a worker pool. For each entry:
//!
//! * path no longer exists -> entry deleted ("removed"),
//! * live `(size, mtime)` drifted from the stored pair -> the path goes
//!   back through the same fingerprint-and-upsert step the scan pipeline
//!   uses ("reprocessed"),
//! * otherwise -> no action.
//!
//! Each entry's check-and-repair is failure-isolated: one entry's error is
//! logged and counted without aborting the batch or the run.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver};

use crate::index::{FileMeta, IndexEntry, IndexStore, RetryPolicy, StoreError};
use crate::scan::{process_path, Outcome, TaskError};

/// Entries fetched from the index per page.
const AUDIT_BATCH_SIZE: usize = 100;

/// Counters reported by a completed audit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSummary {
    /// Entries examined (every entry dispatched to a worker).
    pub examined: usize,
    /// Entries removed because the file no longer exists.
    pub removed: usize,
    /// Entries re-fingerprinted because metadata drifted.
    pub reprocessed: usize,
    /// Entries whose check or repair failed; logged, not fatal.
    pub errors: usize,
}

/// Walk the whole index and repair drift against the live filesystem.
///
/// Fatal only when the index itself cannot be read or a write exhausts its
/// retry budget; everything else is contained per entry.
pub fn audit(store: &IndexStore, workers: usize) -> Result<AuditSummary, StoreError> {
    let workers = workers.max(1);
    let (tx, rx) = bounded::<IndexEntry>(AUDIT_BATCH_SIZE);

    let examined = AtomicUsize::new(0);
    let removed = AtomicUsize::new(0);
    let reprocessed = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);
    let fatal: Mutex<Option<StoreError>> = Mutex::new(None);
    let aborting = AtomicBool::new(false);

    let db_path = store.db_path();
    let retry = store.retry_policy();

    std::thread::scope(|s| -> Result<(), StoreError> {
        for _ in 0..workers {
            s.spawn(|| {
                reconcile(
                    &rx,
                    db_path,
                    retry,
                    &examined,
                    &removed,
                    &reprocessed,
                    &errors,
                    &fatal,
                    &aborting,
                );
            });
        }

        // The calling thread is the producer. `produce` owns the sender,
        // so every return path closes the channel and the workers drain
        // and exit before the scope joins them.
        produce(store, tx, &aborting)
    })?;

    if let Some(err) = fatal
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
    {
        return Err(err);
    }

    let summary = AuditSummary {
        examined: examined.into_inner(),
        removed: removed.into_inner(),
        reprocessed: reprocessed.into_inner(),
        errors: errors.into_inner(),
    };
    log::info!(
        "audit complete: {} examined, {} removed, {} reprocessed, {} errors",
        summary.examined,
        summary.removed,
        summary.reprocessed,
        summary.errors
    );
    Ok(summary)
}

/// Page through the index in path order, feeding entries to the workers.
fn produce(
    store: &IndexStore,
    tx: crossbeam_channel::Sender<IndexEntry>,
    aborting: &AtomicBool,
) -> Result<(), StoreError> {
    let mut cursor: Option<String> = None;
    loop {
        if aborting.load(Ordering::Relaxed) {
            return Ok(());
        }
        let batch = store.entries_after(cursor.as_deref(), AUDIT_BATCH_SIZE)?;
        let Some(last) = batch.last() else {
            return Ok(());
        };
        cursor = Some(last.path.clone());
        for entry in batch {
            if tx.send(entry).is_err() {
                return Ok(());
            }
        }
    }
}

/// Worker loop: check one entry at a time against the live filesystem.
#[allow(clippy::too_many_arguments)]
fn reconcile(
    rx: &Receiver<IndexEntry>,
    db_path: &Path,
    retry: RetryPolicy,
    examined: &AtomicUsize,
    removed: &AtomicUsize,
    reprocessed: &AtomicUsize,
    errors: &AtomicUsize,
    fatal: &Mutex<Option<StoreError>>,
    aborting: &AtomicBool,
) {
    let store = match IndexStore::open(db_path, retry) {
        Ok(s) => s,
        Err(e) => {
            log::error!("audit worker could not open index: {}", e);
            record_fatal(e, fatal, aborting);
            for _ in rx.iter() {}
            return;
        }
    };

    for entry in rx.iter() {
        if aborting.load(Ordering::Relaxed) {
            continue;
        }
        examined.fetch_add(1, Ordering::Relaxed);

        let path = Path::new(&entry.path);
        let live = match FileMeta::probe(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Vanished, possibly between listing and checking.
                match store.delete(&entry.path) {
                    Ok(_) => {
                        log::info!("removed: {} (file no longer exists)", entry.path);
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e @ StoreError::Exhausted { .. }) => {
                        log::error!("aborting audit: {}", e);
                        record_fatal(e, fatal, aborting);
                    }
                    Err(e) => {
                        log::error!("failed to remove entry for {}: {}", entry.path, e);
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                continue;
            }
            Err(e) => {
                log::error!("cannot stat {}: {}", entry.path, e);
                errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        if entry.is_current(&live) {
            continue;
        }

        log::info!("reprocessing: {} (size or mtime changed)", entry.path);
        match process_path(path, &store) {
            Ok(Outcome::Indexed) => {
                reprocessed.fetch_add(1, Ordering::Relaxed);
            }
            // The file settled back to its stored metadata between the
            // probe and the reprocess; nothing to repair.
            Ok(Outcome::Skipped) => {}
            Err(TaskError::Store(e)) if matches!(e, StoreError::Exhausted { .. }) => {
                log::error!("aborting audit: {}", e);
                record_fatal(e, fatal, aborting);
            }
            Err(e) => {
                log::error!("failed to reprocess {}: {}", entry.path, e);
                errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn record_fatal(err: StoreError, fatal: &Mutex<Option<StoreError>>, aborting: &AtomicBool) {
    aborting.store(true, Ordering::Relaxed);
    let mut slot = fatal.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    slot.get_or_insert(err);
}
