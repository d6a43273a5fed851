//! SQLite-backed fingerprint index.
//!
//! # Overview
//!
//! One table, `files`, keyed by unique path. The store is the only owner of
//! persisted entries: scan workers and the auditor mutate it exclusively
//! through [`IndexStore`] operations, and every mutating operation runs
//! inside a bounded busy-retry loop ([`RetryPolicy`]). SQLite allows one
//! writer at a time, so concurrent workers routinely see `SQLITE_BUSY`;
//! the retry wrapper turns that transient contention into a short wait
//! instead of a failed scan.
//!
//! Connections are not shareable across threads. Each worker opens its own
//! handle to the same database file via [`IndexStore::reopen`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension};

use super::entry::{FileMeta, IndexEntry};

/// Bounded retry configuration for busy-database conditions.
///
/// Threaded into [`IndexStore::open`] rather than living as process-wide
/// constants, so tests can shrink the delay to zero.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts before an operation is abandoned.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// Errors from index store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A mutating operation kept hitting a busy database until the retry
    /// budget ran out. Names the operation and path so the caller can
    /// report exactly what was lost; never interpreted as "entry absent".
    #[error("index {op} for {key} failed after {attempts} attempts: database stayed busy")]
    Exhausted {
        /// Operation that was retried ("upsert", "delete", ...)
        op: &'static str,
        /// Path or pattern the operation targeted
        key: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The caller supplied an invalid path pattern.
    #[error("invalid path pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// The underlying regex error
        #[source]
        source: regex::Error,
    },

    /// Any other SQLite failure; propagates immediately without retry.
    #[error("index database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent path -> (fingerprint, size, mtime) index.
pub struct IndexStore {
    conn: Connection,
    db_path: PathBuf,
    retry: RetryPolicy,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("db_path", &self.db_path)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl IndexStore {
    /// Open (or create) the index database at `db_path`.
    ///
    /// Enables WAL journaling so readers never block on the single writer,
    /// and disables SQLite's own busy timeout: all waiting is owned by the
    /// `retry` policy.
    pub fn open(db_path: &Path, retry: RetryPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::ZERO)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                size INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_fingerprint ON files (fingerprint);",
        )?;
        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            retry,
        })
    }

    /// Open a second handle to the same database, for use on another thread.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        Self::open(&self.db_path, self.retry)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The busy-retry policy this store was opened with.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Insert or overwrite the entry for `path`.
    pub fn upsert(
        &self,
        path: &str,
        fingerprint: &str,
        meta: &FileMeta,
    ) -> Result<(), StoreError> {
        self.with_retry("upsert", path, |conn| {
            conn.execute(
                "INSERT INTO files (path, fingerprint, size, last_modified)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                     fingerprint = excluded.fingerprint,
                     size = excluded.size,
                     last_modified = excluded.last_modified",
                rusqlite::params![path, fingerprint, meta.size, meta.modified_ms],
            )
            .map(|_| ())
        })
    }

    /// Point lookup of the stored entry for `path`, without touching the
    /// filesystem.
    pub fn lookup(&self, path: &str) -> Result<Option<IndexEntry>, StoreError> {
        let entry = self
            .conn
            .query_row(
                "SELECT path, fingerprint, size, last_modified FROM files WHERE path = ?1",
                [path],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Remove the entry for `path`. Returns whether an entry existed;
    /// deleting an absent path is a no-op, not an error.
    pub fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let deleted = self.with_retry("delete", path, |conn| {
            conn.execute("DELETE FROM files WHERE path = ?1", [path])
        })?;
        Ok(deleted > 0)
    }

    /// Remove every entry whose path matches `pattern`, a regex anchored
    /// at the start of the stored path (the match must begin at the first
    /// character, though it need not cover the whole path). Returns the
    /// number of entries removed.
    ///
    /// The pattern is evaluated against one snapshot of all paths taken up
    /// front, so concurrent upserts cannot shift which paths match while
    /// the delete is in progress.
    pub fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let re = regex::Regex::new(pattern).map_err(|source| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut stmt = self.conn.prepare("SELECT path FROM files")?;
        let matching: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(std::result::Result::ok)
            .filter(|p| re.find(p).is_some_and(|m| m.start() == 0))
            .collect();
        drop(stmt);

        if matching.is_empty() {
            return Ok(0);
        }

        self.with_retry("delete-matching", pattern, |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut del = tx.prepare("DELETE FROM files WHERE path = ?1")?;
                for p in &matching {
                    del.execute([p.as_str()])?;
                }
            }
            tx.commit()
        })?;

        Ok(matching.len())
    }

    /// All indexed paths sharing `fingerprint`, ordered by path.
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM files WHERE fingerprint = ?1 ORDER BY path")?;
        let paths = stmt
            .query_map([fingerprint], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Every duplicate group in the index: fingerprint -> paths, for each
    /// fingerprint shared by more than `min_count` entries.
    ///
    /// Rows stream out of SQLite one at a time; only the result mapping is
    /// materialized, never the whole table.
    pub fn group_duplicates(
        &self,
        min_count: usize,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT fingerprint, path FROM files
             WHERE fingerprint IN (
                 SELECT fingerprint FROM files
                 GROUP BY fingerprint HAVING COUNT(*) > ?1
             )
             ORDER BY fingerprint, path",
        )?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut rows = stmt.query([min_count])?;
        while let Some(row) = rows.next()? {
            let fingerprint: String = row.get(0)?;
            let path: String = row.get(1)?;
            groups.entry(fingerprint).or_default().push(path);
        }
        Ok(groups)
    }

    /// One page of entries in path order, strictly after `after`.
    ///
    /// Keyset pagination: the auditor walks the index in bounded batches,
    /// and entries deleted between pages can never make a page skip or
    /// repeat survivors.
    pub fn entries_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT path, fingerprint, size, last_modified FROM files
             WHERE path > ?1 ORDER BY path LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(
                rusqlite::params![after.unwrap_or(""), limit],
                row_to_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Number of entries in the index.
    pub fn count(&self) -> Result<u64, StoreError> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Number of indexed paths starting with `prefix`.
    pub fn prefix_count(&self, prefix: &str) -> Result<u64, StoreError> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE substr(path, 1, length(?1)) = ?1",
            [prefix],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Total bytes reclaimable by keeping one copy per duplicate group:
    /// sum over groups of `(group_len - 1) * size`, counting only groups
    /// with more than `min_count` members (the same threshold
    /// [`group_duplicates`](Self::group_duplicates) applies).
    pub fn duplicate_waste(&self, min_count: usize) -> Result<u64, StoreError> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(waste), 0) FROM (
                 SELECT (COUNT(*) - 1) * MIN(size) AS waste
                 FROM files GROUP BY fingerprint HAVING COUNT(*) > ?1
             )",
            [min_count],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Run a mutating statement with bounded busy-retry.
    ///
    /// `SQLITE_BUSY` / `SQLITE_LOCKED` sleeps and retries up to the policy
    /// bound; every other error class propagates immediately. Exhaustion is
    /// fatal and names the operation and key.
    fn with_retry<T>(
        &self,
        op: &'static str,
        key: &str,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f(&self.conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(StoreError::Exhausted {
                            op,
                            key: key.to_string(),
                            attempts: attempt,
                        });
                    }
                    log::warn!(
                        "index busy during {} for {} (attempt {}/{}), retrying",
                        op,
                        key,
                        attempt,
                        self.retry.max_attempts
                    );
                    std::thread::sleep(self.retry.delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Whether an error is transient lock contention (worth retrying).
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        path: row.get(0)?,
        fingerprint: row.get(1)?,
        size: row.get(2)?,
        last_modified: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(size: u64, modified_ms: i64) -> FileMeta {
        FileMeta { size, modified_ms }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> IndexStore {
        IndexStore::open(&dir.path().join("index.db"), fast_retry()).unwrap()
    }

    #[test]
    fn test_upsert_then_lookup() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/a.txt", "abc123", &meta(5, 1000)).unwrap();

        let entry = store.lookup("/a.txt").unwrap().unwrap();
        assert_eq!(entry.path, "/a.txt");
        assert_eq!(entry.fingerprint, "abc123");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.last_modified, 1000);
    }

    #[test]
    fn test_lookup_absent_path() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.lookup("/missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_not_duplicates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/a.txt", "old", &meta(5, 1000)).unwrap();
        store.upsert("/a.txt", "new", &meta(7, 2000)).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let entry = store.lookup("/a.txt").unwrap().unwrap();
        assert_eq!(entry.fingerprint, "new");
        assert_eq!(entry.size, 7);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(!store.delete("/missing").unwrap());
    }

    #[test]
    fn test_delete_removes_entry() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/a.txt", "abc", &meta(1, 1)).unwrap();
        assert!(store.delete("/a.txt").unwrap());
        assert!(store.lookup("/a.txt").unwrap().is_none());
    }

    #[test]
    fn test_delete_matching_pattern() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/tmp/a.log", "f1", &meta(1, 1)).unwrap();
        store.upsert("/tmp/b.log", "f2", &meta(1, 1)).unwrap();
        store.upsert("/tmp/c.txt", "f3", &meta(1, 1)).unwrap();

        let removed = store.delete_matching(r"/tmp/.*\.log").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.lookup("/tmp/c.txt").unwrap().is_some());
    }

    #[test]
    fn test_delete_matching_anchors_at_path_start() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/tmp/a.log", "f1", &meta(1, 1)).unwrap();
        store.upsert("/var/b.log", "f2", &meta(1, 1)).unwrap();

        // A suffix pattern matches mid-path only; anchored matching must
        // leave both entries alone.
        assert_eq!(store.delete_matching(r"\.log$").unwrap(), 0);
        assert_eq!(store.count().unwrap(), 2);

        // Matching from the first character is enough; the pattern does
        // not have to cover the whole path.
        assert_eq!(store.delete_matching(r"/tmp/").unwrap(), 1);
        assert!(store.lookup("/var/b.log").unwrap().is_some());
    }

    #[test]
    fn test_delete_matching_invalid_pattern() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let err = store.delete_matching("[unclosed").unwrap_err();
        assert!(matches!(err, StoreError::InvalidPattern { .. }));
    }

    #[test]
    fn test_find_by_fingerprint_ordered() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/z.txt", "same", &meta(5, 1)).unwrap();
        store.upsert("/a.txt", "same", &meta(5, 1)).unwrap();
        store.upsert("/m.txt", "other", &meta(5, 1)).unwrap();

        let paths = store.find_by_fingerprint("same").unwrap();
        assert_eq!(paths, vec!["/a.txt".to_string(), "/z.txt".to_string()]);
    }

    #[test]
    fn test_group_duplicates_min_count() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/a", "dup", &meta(5, 1)).unwrap();
        store.upsert("/b", "dup", &meta(5, 1)).unwrap();
        store.upsert("/c", "solo", &meta(5, 1)).unwrap();

        let groups = store.group_duplicates(1).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups.get("dup").unwrap(),
            &vec!["/a".to_string(), "/b".to_string()]
        );

        // min_count 2 requires at least 3 entries per fingerprint
        assert!(store.group_duplicates(2).unwrap().is_empty());
    }

    #[test]
    fn test_entries_after_pagination() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for name in ["/a", "/b", "/c", "/d", "/e"] {
            store.upsert(name, "fp", &meta(1, 1)).unwrap();
        }

        let page1 = store.entries_after(None, 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].path, "/a");
        assert_eq!(page1[1].path, "/b");

        let page2 = store.entries_after(Some("/b"), 2).unwrap();
        assert_eq!(page2[0].path, "/c");

        let tail = store.entries_after(Some("/e"), 2).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn test_entries_after_tolerates_deletes_between_pages() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for name in ["/a", "/b", "/c", "/d"] {
            store.upsert(name, "fp", &meta(1, 1)).unwrap();
        }

        let page1 = store.entries_after(None, 2).unwrap();
        assert_eq!(page1[1].path, "/b");

        // Entries vanishing mid-walk must not skip survivors.
        store.delete("/c").unwrap();
        let page2 = store.entries_after(Some("/b"), 2).unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].path, "/d");
    }

    #[test]
    fn test_prefix_count() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert("/home/a", "f1", &meta(1, 1)).unwrap();
        store.upsert("/home/b", "f2", &meta(1, 1)).unwrap();
        store.upsert("/srv/c", "f3", &meta(1, 1)).unwrap();

        assert_eq!(store.prefix_count("/home/").unwrap(), 2);
        assert_eq!(store.prefix_count("/srv/").unwrap(), 1);
        assert_eq!(store.prefix_count("/opt/").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_waste_per_group_formula() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        // Group of 3 x 10 bytes: reclaimable (3 - 1) * 10 = 20.
        store.upsert("/g1/a", "g1", &meta(10, 1)).unwrap();
        store.upsert("/g1/b", "g1", &meta(10, 1)).unwrap();
        store.upsert("/g1/c", "g1", &meta(10, 1)).unwrap();
        // Group of 2 x 7 bytes: reclaimable 7.
        store.upsert("/g2/a", "g2", &meta(7, 1)).unwrap();
        store.upsert("/g2/b", "g2", &meta(7, 1)).unwrap();
        // Unique file: contributes nothing.
        store.upsert("/solo", "solo", &meta(1000, 1)).unwrap();

        assert_eq!(store.duplicate_waste(1).unwrap(), 27);
    }

    #[test]
    fn test_duplicate_waste_honors_min_count() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        // Triple of 10 bytes and a pair of 7 bytes.
        store.upsert("/g1/a", "g1", &meta(10, 1)).unwrap();
        store.upsert("/g1/b", "g1", &meta(10, 1)).unwrap();
        store.upsert("/g1/c", "g1", &meta(10, 1)).unwrap();
        store.upsert("/g2/a", "g2", &meta(7, 1)).unwrap();
        store.upsert("/g2/b", "g2", &meta(7, 1)).unwrap();

        // min_count 2 keeps only groups of 3+, so the pair's 7 bytes
        // drop out of the total.
        assert_eq!(store.duplicate_waste(2).unwrap(), 20);
        assert!(store.group_duplicates(2).unwrap().contains_key("g1"));
    }

    #[test]
    fn test_retry_exhaustion_names_path_and_attempts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert("/seed", "fp", &meta(1, 1)).unwrap();

        // A second connection holding the write lock forces SQLITE_BUSY.
        let blocker = Connection::open(dir.path().join("index.db")).unwrap();
        blocker.busy_timeout(Duration::ZERO).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = store.upsert("/a.txt", "abc", &meta(5, 1000)).unwrap_err();
        match err {
            StoreError::Exhausted { op, key, attempts } => {
                assert_eq!(op, "upsert");
                assert_eq!(key, "/a.txt");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Exhausted, got: {other}"),
        }

        blocker.execute_batch("ROLLBACK").unwrap();

        // Contention over: the same write now succeeds.
        store.upsert("/a.txt", "abc", &meta(5, 1000)).unwrap();
    }

    #[test]
    fn test_reopen_sees_same_data() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert("/a", "fp", &meta(1, 1)).unwrap();

        let second = store.reopen().unwrap();
        assert_eq!(second.count().unwrap(), 1);
    }
}
