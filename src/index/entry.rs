//! Index entry model and metadata-based change detection.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One persisted index row: a path and the content fingerprint plus the
/// file metadata observed at the moment the fingerprint was computed.
///
/// The stored `(size, last_modified)` pair describes the file *as hashed*,
/// not necessarily as it exists now; staleness is expected and is resolved
/// by rescans and by the auditor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Path string as supplied by the caller (unique key).
    pub path: String,
    /// Lowercase hex MD5 digest of the file contents at last scan.
    pub fingerprint: String,
    /// File size in bytes at last scan.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch at last scan.
    pub last_modified: i64,
}

impl IndexEntry {
    /// Whether the stored metadata still matches the live file.
    ///
    /// True only when both size and mtime match exactly; a file whose
    /// content changed without touching either field is reported as
    /// current. This is a deliberate approximation that avoids re-reading
    /// unchanged files, not a byte-exact change guarantee.
    #[must_use]
    pub fn is_current(&self, live: &FileMeta) -> bool {
        self.size == live.size && self.last_modified == live.modified_ms
    }
}

/// Live filesystem metadata used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// File size in bytes.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

impl FileMeta {
    /// Read `(size, mtime)` for a path without opening the file contents.
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified()?;
        Ok(Self {
            size: metadata.len(),
            modified_ms: system_time_to_ms(modified),
        })
    }
}

/// Convert a `SystemTime` to signed milliseconds since the Unix epoch.
///
/// Pre-epoch mtimes (seen on some archives) map to negative values rather
/// than erroring.
pub fn system_time_to_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
