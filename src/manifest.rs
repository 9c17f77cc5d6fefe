//! Durable manifest: the record of every named index, its directory set,
//! corpus checksum, and per-file chunk ownership.
//!
//! The manifest is a single JSON document under the cache root, written
//! atomically (temp file + rename). Per-file records are what make surgical
//! incremental updates possible: each file maps to the exact chunk IDs it
//! owns, so removals never touch a neighbour's vectors.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::loader::{self, Clock};

/// Files whose mtime is within this many seconds of "now" are considered
/// still being written and are skipped until the next cycle.
pub const DEFAULT_STABILITY_WINDOW_SECS: f64 = 2.0;

/// Per-file metadata: modification time and the chunk IDs the file owns,
/// ordered by chunk index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime: f64,
    pub chunk_ids: Vec<u64>,
}

/// Manifest-level record for one named index.
///
/// `files` distinguishes "never recorded" (`None`, e.g. a manifest written
/// by an older layout, which forces a full rebuild) from "recorded and
/// currently empty" (`Some` with no entries, a live index whose corpus was
/// emptied, which stays on the incremental path).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, FileRecord>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestData {
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexEntry>,
}

/// Change sets produced by comparing the manifest against a directory scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the manifest; a missing file reads as empty.
    pub fn read(&self) -> ManifestData {
        let Ok(json) = std::fs::read_to_string(&self.path) else {
            return ManifestData::default();
        };
        serde_json::from_str(&json).unwrap_or_default()
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn write(&self, data: &ManifestData) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::PersistFailure(format!("manifest dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| AppError::PersistFailure(format!("manifest encode: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| AppError::PersistFailure(format!("manifest write: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::PersistFailure(format!("manifest rename: {e}")))?;
        Ok(())
    }

    /// Add or overwrite an index entry, preserving no prior state.
    pub fn add_index(
        &self,
        index_name: &str,
        directories: &[String],
        checksum: Option<String>,
    ) -> AppResult<()> {
        let mut data = self.read();
        data.indexes.insert(
            index_name.to_string(),
            IndexEntry {
                directories: directories.to_vec(),
                checksum,
                files: None,
            },
        );
        self.write(&data)
    }

    /// Replace the whole state of one index in a single atomic write.
    pub fn replace_index_state(
        &self,
        index_name: &str,
        directories: &[String],
        checksum: String,
        files: BTreeMap<String, FileRecord>,
    ) -> AppResult<()> {
        let mut data = self.read();
        data.indexes.insert(
            index_name.to_string(),
            IndexEntry {
                directories: directories.to_vec(),
                checksum: Some(checksum),
                files: Some(files),
            },
        );
        self.write(&data)
    }

    pub fn get_checksum(&self, index_name: &str) -> Option<String> {
        self.read().indexes.get(index_name)?.checksum.clone()
    }

    pub fn update_checksum(&self, index_name: &str, checksum: &str) -> AppResult<()> {
        let mut data = self.read();
        let entry = data
            .indexes
            .get_mut(index_name)
            .ok_or_else(|| AppError::IndexState(format!("unknown index '{index_name}'")))?;
        entry.checksum = Some(checksum.to_string());
        self.write(&data)
    }

    pub fn get_directories(&self, index_name: &str) -> Option<Vec<String>> {
        Some(self.read().indexes.get(index_name)?.directories.clone())
    }

    pub fn all_file_records(&self, index_name: &str) -> BTreeMap<String, FileRecord> {
        self.read()
            .indexes
            .get(index_name)
            .and_then(|entry| entry.files.clone())
            .unwrap_or_default()
    }

    pub fn chunk_ids_for(&self, index_name: &str, file_path: &str) -> Vec<u64> {
        self.read()
            .indexes
            .get(index_name)
            .and_then(|entry| entry.files.as_ref())
            .and_then(|files| files.get(file_path))
            .map(|record| record.chunk_ids.clone())
            .unwrap_or_default()
    }

    /// True if the index carries per-file records (incremental updates are
    /// possible). A manifest from an older layout reads as `false`; a
    /// recorded-but-empty corpus reads as `true`.
    pub fn has_per_file_metadata(&self, index_name: &str) -> bool {
        self.read()
            .indexes
            .get(index_name)
            .is_some_and(|entry| entry.files.is_some())
    }

    /// Compare stored per-file records against the current directory scan.
    ///
    /// Detection compares mtimes only. Saves landing within the same mtime
    /// value are invisible until a later save. Files modified within
    /// `stability_window_secs` of the clock's now are presumed still being
    /// written and are left out of `added`/`modified` for this cycle.
    pub fn detect_changes(
        &self,
        index_name: &str,
        directories: &[String],
        clock: &dyn Clock,
        stability_window_secs: f64,
    ) -> FileChanges {
        let stored = self.all_file_records(index_name);
        let now = clock.now_secs();

        let mut current: BTreeMap<String, f64> = BTreeMap::new();
        let mut unstable: BTreeSet<String> = BTreeSet::new();
        for file in loader::scan_markdown_files(directories) {
            let path = file.path.to_string_lossy().to_string();
            if stability_window_secs > 0.0 && now - file.mtime < stability_window_secs {
                unstable.insert(path.clone());
            }
            current.insert(path, file.mtime);
        }

        let mut changes = FileChanges::default();

        for (path, mtime) in &current {
            match stored.get(path) {
                None => {
                    if unstable.contains(path) {
                        debug!("skipping recently modified file this cycle: {}", path);
                        continue;
                    }
                    changes.added.insert(path.clone());
                }
                Some(record) if record.mtime != *mtime => {
                    if unstable.contains(path) {
                        debug!("skipping recently modified file this cycle: {}", path);
                        continue;
                    }
                    changes.modified.insert(path.clone());
                }
                Some(_) => {}
            }
        }

        for path in stored.keys() {
            if !current.contains_key(path) {
                changes.deleted.insert(path.clone());
            }
        }

        changes
    }
}
