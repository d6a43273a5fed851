//! Concurrent scan-and-index pipeline.
//!
//! # Overview
//!
//! One producer walks the directory tree and feeds discovered file paths
//! into a bounded channel; a fixed pool of consumer threads pulls paths,
//! skips files whose stored metadata is unchanged, fingerprints the rest,
//! and upserts results into the index. Dropping the sending side closes
//! the channel, which is the stop signal every consumer observes exactly
//! once - no in-band sentinel values.
//!
//! Per-file failures (vanished file, unreadable file) are logged with the
//! offending path and counted; they never abort the pipeline. The one
//! fatal condition is index retry exhaustion: the pipeline drains, joins
//! its workers, and surfaces the store error to the caller.
//!
//! # Example
//!
//! ```no_run
//! use dupindex::index::{IndexStore, RetryPolicy};
//! use dupindex::scan::{scan_path, ScanOptions};
//! use std::path::Path;
//!
//! let store = IndexStore::open(Path::new("index.db"), RetryPolicy::default())?;
//! let summary = scan_path(Path::new("/data"), &store, &ScanOptions::default())?;
//! println!("indexed {}, skipped {}", summary.indexed, summary.skipped);
//! # Ok::<(), dupindex::scan::ScanError>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver};

use crate::fingerprint::{fingerprint_file, FingerprintError};
use crate::index::{FileMeta, IndexStore, RetryPolicy, StoreError};

/// Capacity of the work queue between the walker and the consumers.
const WORK_QUEUE_CAPACITY: usize = 256;

/// Pipeline tuning options.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Number of consumer threads.
    pub workers: usize,
    /// Follow symbolic links during the walk. walkdir checks ancestors for
    /// loops when this is on, so symlink cycles terminate.
    pub follow_symlinks: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            follow_symlinks: false,
        }
    }
}

/// Counters reported by a completed scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Files fingerprinted and upserted.
    pub indexed: usize,
    /// Files skipped because stored metadata was unchanged.
    pub skipped: usize,
    /// Files that failed (vanished, unreadable); logged, not fatal.
    pub errors: usize,
}

/// Errors that abort a scan invocation.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// The caller-supplied root does not exist.
    #[error("scan root not found: {0}")]
    InvalidRoot(PathBuf),

    /// The index could not be written (retry exhaustion or another
    /// database failure).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Fingerprinting failed for a single-file invocation.
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

/// Outcome of processing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Fingerprint computed and entry upserted.
    Indexed,
    /// Stored metadata matched; no hash, no write.
    Skipped,
}

/// Per-task failure inside a worker.
#[derive(thiserror::Error, Debug)]
pub(crate) enum TaskError {
    /// The file vanished between discovery and processing.
    #[error("file vanished before processing: {0}")]
    Vanished(PathBuf),

    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The index rejected the write. Exhaustion is fatal to the scan;
    /// the worker loop checks for it explicitly.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FingerprintError> for TaskError {
    fn from(err: FingerprintError) -> Self {
        match err {
            FingerprintError::NotFound(path) => Self::Vanished(path),
            FingerprintError::PermissionDenied(path) => Self::Io {
                path,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
            FingerprintError::Io { path, source } => Self::Io { path, source },
        }
    }
}

/// Apply change detection to one file and index it if needed.
///
/// Shared by scan consumers and the auditor's reprocess step.
pub(crate) fn process_path(path: &Path, store: &IndexStore) -> Result<Outcome, TaskError> {
    let meta = FileMeta::probe(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TaskError::Vanished(path.to_path_buf()),
        _ => TaskError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let key = path.to_string_lossy();
    if let Some(entry) = store.lookup(&key)? {
        if entry.is_current(&meta) {
            log::debug!("skipped (unchanged): {}", key);
            return Ok(Outcome::Skipped);
        }
    }

    let fingerprint = fingerprint_file(path)?;
    store.upsert(&key, &fingerprint, &meta)?;
    log::info!("indexed: {}", key);
    Ok(Outcome::Indexed)
}

/// Scan a directory tree (or a single file) into the index.
///
/// Completion means the walk finished, the queue drained, and every
/// consumer exited; only then is the summary returned. Per-file errors are
/// counted in the summary, but a store whose retry budget was exhausted
/// aborts the invocation with [`ScanError::Store`].
pub fn scan_path(
    root: &Path,
    store: &IndexStore,
    options: &ScanOptions,
) -> Result<ScanSummary, ScanError> {
    if !root.exists() {
        return Err(ScanError::InvalidRoot(root.to_path_buf()));
    }

    // A single file is a degenerate one-task pipeline; no pool needed.
    if root.is_file() {
        let mut summary = ScanSummary::default();
        record_outcome(process_path(root, store), &mut summary)?;
        return Ok(summary);
    }

    let workers = options.workers.max(1);
    let (tx, rx) = bounded::<PathBuf>(WORK_QUEUE_CAPACITY);

    let indexed = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);
    // First fatal store error wins; later ones only drain the queue.
    let fatal: Mutex<Option<StoreError>> = Mutex::new(None);
    let aborting = AtomicBool::new(false);

    // Connections cannot be shared across threads; each consumer opens
    // its own handle to the same database file.
    let db_path = store.db_path();
    let retry = store.retry_policy();

    std::thread::scope(|s| {
        let producer_errors = &errors;
        let follow = options.follow_symlinks;
        s.spawn(move || {
            let walker = walkdir::WalkDir::new(root).follow_links(follow);
            for entry in walker {
                match entry {
                    Ok(e) if e.file_type().is_file() => {
                        log::debug!("found file: {}", e.path().display());
                        if tx.send(e.into_path()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("walk error: {}", e);
                        producer_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            // Sender drops here; channel closure tells every consumer to stop.
        });

        for _ in 0..workers {
            s.spawn(|| {
                consume(
                    &rx, db_path, retry, &indexed, &skipped, &errors, &fatal, &aborting,
                );
            });
        }
    });

    if let Some(err) = fatal
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
    {
        return Err(err.into());
    }

    Ok(ScanSummary {
        indexed: indexed.into_inner(),
        skipped: skipped.into_inner(),
        errors: errors.into_inner(),
    })
}

/// Consumer loop: pull paths until the channel closes.
#[allow(clippy::too_many_arguments)]
fn consume(
    rx: &Receiver<PathBuf>,
    db_path: &Path,
    retry: RetryPolicy,
    indexed: &AtomicUsize,
    skipped: &AtomicUsize,
    errors: &AtomicUsize,
    fatal: &Mutex<Option<StoreError>>,
    aborting: &AtomicBool,
) {
    let worker_store = match IndexStore::open(db_path, retry) {
        Ok(s) => s,
        Err(e) => {
            log::error!("worker could not open index: {}", e);
            record_fatal(e, fatal, aborting);
            // Keep draining so the producer never blocks on a full queue.
            for _ in rx.iter() {}
            return;
        }
    };

    for path in rx.iter() {
        if aborting.load(Ordering::Relaxed) {
            continue;
        }
        match process_path(&path, &worker_store) {
            Ok(Outcome::Indexed) => {
                indexed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Outcome::Skipped) => {
                skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TaskError::Store(e)) if matches!(e, StoreError::Exhausted { .. }) => {
                log::error!("aborting scan: {}", e);
                record_fatal(e, fatal, aborting);
            }
            Err(TaskError::Vanished(path)) => {
                log::info!("vanished before processing: {}", path.display());
                errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("error processing file: {}", e);
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

/// Fold one task result into the summary, letting fatal store errors out.
fn record_outcome(
    result: Result<Outcome, TaskError>,
    summary: &mut ScanSummary,
) -> Result<(), ScanError> {
    match result {
        Ok(Outcome::Indexed) => summary.indexed += 1,
        Ok(Outcome::Skipped) => summary.skipped += 1,
        Err(TaskError::Store(e)) => return Err(e.into()),
        Err(e) => {
            log::error!("error processing file: {}", e);
            summary.errors += 1;
        }
    }
    Ok(())
}

/// Fingerprint a single file and return the indexed paths that share its
/// digest, ordered by path. The file itself is not (re)indexed.
pub fn check_file(path: &Path, store: &IndexStore) -> Result<Vec<String>, ScanError> {
    let fingerprint = fingerprint_file(path)?;
    Ok(store.find_by_fingerprint(&fingerprint)?)
}
