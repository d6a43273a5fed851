//! Duplicate report building and rendering.
//!
//! Reports are derived from the index at query time and never cached, so
//! they are always consistent with the index (though possibly stale
//! relative to the live filesystem if no recent scan or audit ran).

use std::collections::BTreeMap;

use bytesize::ByteSize;
use serde::Serialize;

use crate::index::{IndexStore, StoreError};

/// A point-in-time duplicate report derived from the index.
#[derive(Debug, Serialize)]
pub struct DuplicateReport {
    /// fingerprint -> paths, for every group over the threshold.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Number of duplicate groups.
    pub group_count: usize,
    /// Redundant copies across all groups (group sizes minus one each).
    pub duplicate_files: usize,
    /// Bytes reclaimable by keeping one copy per group.
    pub reclaimable_bytes: u64,
}

impl DuplicateReport {
    /// Query the index for every fingerprint shared by more than
    /// `min_count` entries.
    pub fn build(store: &IndexStore, min_count: usize) -> Result<Self, StoreError> {
        let groups = store.group_duplicates(min_count)?;
        let group_count = groups.len();
        let duplicate_files = groups.values().map(|paths| paths.len() - 1).sum();
        let reclaimable_bytes = store.duplicate_waste(min_count)?;
        Ok(Self {
            groups,
            group_count,
            duplicate_files,
            reclaimable_bytes,
        })
    }

    /// Whether the report found any duplicate groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Plain-text rendering for terminal output.
    #[must_use]
    pub fn render_text(&self) -> String {
        if self.is_empty() {
            return "No duplicate files found.\n".to_string();
        }

        let mut out = String::new();
        for (fingerprint, paths) in &self.groups {
            out.push_str(&format!("{fingerprint}:\n"));
            for path in paths {
                out.push_str(&format!("  {path}\n"));
            }
        }
        out.push_str(&format!(
            "\n{} duplicate groups, {} redundant files, {} reclaimable\n",
            self.group_count,
            self.duplicate_files,
            ByteSize(self.reclaimable_bytes)
        ));
        out
    }

    /// Pretty-printed JSON rendering for scripting.
    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Human-readable rendering of the reclaimable-space total.
#[must_use]
pub fn render_waste(total: u64) -> String {
    if total == 0 {
        "No duplicate files found.".to_string()
    } else {
        format!("Reclaimable space across duplicate groups: {}", ByteSize(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileMeta, RetryPolicy};
    use std::time::Duration;
    use tempfile::tempdir;

    fn seeded_store(dir: &tempfile::TempDir) -> IndexStore {
        let store = IndexStore::open(
            &dir.path().join("index.db"),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
        )
        .unwrap();
        let meta = FileMeta {
            size: 10,
            modified_ms: 1,
        };
        store.upsert("/a", "dup", &meta).unwrap();
        store.upsert("/b", "dup", &meta).unwrap();
        store.upsert("/c", "solo", &meta).unwrap();
        store
    }

    #[test]
    fn test_report_counts() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);

        let report = DuplicateReport::build(&store, 1).unwrap();
        assert_eq!(report.group_count, 1);
        assert_eq!(report.duplicate_files, 1);
        assert_eq!(report.reclaimable_bytes, 10);
        assert!(!report.is_empty());
    }

    #[test]
    fn test_report_text_lists_paths() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);

        let text = DuplicateReport::build(&store, 1).unwrap().render_text();
        assert!(text.contains("dup:"));
        assert!(text.contains("  /a"));
        assert!(text.contains("  /b"));
        assert!(!text.contains("/c"));
    }

    #[test]
    fn test_report_json_parses_back() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);

        let json = DuplicateReport::build(&store, 1).unwrap().render_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["group_count"], 1);
        assert_eq!(value["groups"]["dup"][0], "/a");
    }

    #[test]
    fn test_empty_report() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(
            &dir.path().join("index.db"),
            RetryPolicy::default(),
        )
        .unwrap();

        let report = DuplicateReport::build(&store, 1).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.render_text(), "No duplicate files found.\n");
    }

    #[test]
    fn test_report_waste_matches_threshold() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);

        // The pair group falls below --min-count 2, so the byte total must
        // exclude it along with the group listing.
        let report = DuplicateReport::build(&store, 2).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.reclaimable_bytes, 0);
    }

    #[test]
    fn test_render_waste() {
        assert_eq!(render_waste(0), "No duplicate files found.");
        assert!(render_waste(2048).contains("2"));
    }
}
