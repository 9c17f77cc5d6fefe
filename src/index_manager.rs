//! Ownership and lifecycle of the live vector index.
//!
//! The manager holds exactly one `VectorStore` behind a reader-writer lock
//! and serializes every mutation. Queries borrow the store in shared mode;
//! refreshes either mutate it in place (incremental path) or build a
//! replacement off-lock and install it with a single pointer swap (full
//! rebuild). Chunking and embedding always happen outside the exclusive
//! section, so concurrent searches only wait for the short mutation window.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::CacheLayout;
use crate::chunker::Chunker;
use crate::embeddings::EmbeddingGenerator;
use crate::error::{AppError, AppResult};
use crate::identity;
use crate::loader::{self, Clock, LoadedFile, SystemClock};
use crate::manifest::{self, FileChanges, FileRecord, Manifest};
use crate::vector_store::{PreparedChunk, VectorStore};

/// Why a refresh fell back to a full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    MissingPerFileMetadata,
    IndexNotFound,
    NoCurrentIndex,
}

impl std::fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RebuildReason::MissingPerFileMetadata => "missing per-file metadata",
            RebuildReason::IndexNotFound => "on-disk index not found",
            RebuildReason::NoCurrentIndex => "no current in-memory index",
        };
        f.write_str(s)
    }
}

/// Outcome of one refresh pass. Callers branch exhaustively.
#[derive(Debug)]
pub enum RefreshResult {
    NoChange,
    Incremental {
        added: Vec<String>,
        modified: Vec<String>,
        deleted: Vec<String>,
    },
    FullRebuild {
        reason: RebuildReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    Updating,
    NotReady,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Ready => "ready",
            ReadyState::Updating => "updating",
            ReadyState::NotReady => "not_ready",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub state: ReadyState,
    pub count: usize,
    pub dimension: usize,
}

/// Clears the `refreshing` flag even when a refresh unwinds early.
struct RefreshFlag<'a>(&'a AtomicBool);

impl<'a> RefreshFlag<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A file's chunks, embedded and ready for insertion, plus its fresh record.
struct PreparedFile {
    path: String,
    record: FileRecord,
    chunks: Vec<PreparedChunk>,
}

pub struct IndexManager {
    layout: CacheLayout,
    manifest: Manifest,
    embedder: Arc<EmbeddingGenerator>,
    chunker: Arc<dyn Chunker>,
    clock: Arc<dyn Clock>,
    stability_window_secs: f64,
    index: RwLock<Option<VectorStore>>,
    /// Serializes refreshes and rebuilds; never held across a search.
    refresh_gate: Mutex<()>,
    refreshing: AtomicBool,
}

impl IndexManager {
    pub fn new(
        layout: CacheLayout,
        embedder: Arc<EmbeddingGenerator>,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        let manifest = Manifest::new(layout.manifest_path());
        Self {
            layout,
            manifest,
            embedder,
            chunker,
            clock: Arc::new(SystemClock),
            stability_window_secs: manifest::DEFAULT_STABILITY_WINDOW_SECS,
            index: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stability_window(mut self, secs: f64) -> Self {
        self.stability_window_secs = secs;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Run `f` against the live store under the shared lock.
    pub fn with_index<R>(&self, f: impl FnOnce(&VectorStore) -> R) -> Option<R> {
        let guard = self.index.read();
        guard.as_ref().map(f)
    }

    pub fn is_ready(&self) -> bool {
        self.index
            .read()
            .as_ref()
            .is_some_and(|store| store.is_valid())
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> IndexStatus {
        let (count, dimension, valid) = {
            let guard = self.index.read();
            match guard.as_ref() {
                Some(store) => (store.size(), store.dimension(), store.is_valid()),
                None => (0, 0, false),
            }
        };
        let state = if self.is_refreshing() {
            ReadyState::Updating
        } else if valid {
            ReadyState::Ready
        } else {
            ReadyState::NotReady
        };
        IndexStatus {
            state,
            count,
            dimension,
        }
    }

    /// Startup path: load the persisted index when it passes integrity
    /// validation, otherwise build from scratch. Either way the manifest
    /// ends up carrying per-file records for the loaded state.
    pub fn load_or_build(&self, index_name: &str, directories: &[String]) -> AppResult<()> {
        let _gate = self.refresh_gate.lock();
        let _flag = RefreshFlag::set(&self.refreshing);

        if self.layout.index_exists(index_name) {
            let (ann, meta) = self.layout.index_paths(index_name);
            match VectorStore::load(&ann, &meta) {
                Ok(store) if store.is_valid() => {
                    info!(
                        "loaded index '{}' from disk: {} chunks, {} dims",
                        index_name,
                        store.size(),
                        store.dimension()
                    );
                    if !self.manifest.has_per_file_metadata(index_name) {
                        // Pre-existing index from an older layout: rebuild
                        // the per-file records from the store itself.
                        let records = reconstruct_file_records(&store, directories);
                        let checksum = loader::compute_directories_checksum(directories);
                        self.manifest.replace_index_state(
                            index_name,
                            directories,
                            checksum,
                            records,
                        )?;
                    } else if self.manifest.get_checksum(index_name).is_none() {
                        let checksum = loader::compute_directories_checksum(directories);
                        self.manifest.update_checksum(index_name, &checksum)?;
                    }
                    *self.index.write() = Some(store);
                    return Ok(());
                }
                Ok(_) => {
                    warn!(
                        "index '{}' loaded but failed validation, rebuilding",
                        index_name
                    );
                }
                Err(e) => {
                    warn!("failed to load index '{}' ({}), rebuilding", index_name, e);
                }
            }
        }

        self.build_and_install(index_name, directories)
    }

    /// One refresh pass: incremental when possible, otherwise a full rebuild
    /// with the reason recorded in the result.
    pub fn refresh(&self, index_name: &str, directories: &[String]) -> AppResult<RefreshResult> {
        let _gate = self.refresh_gate.lock();
        let _flag = RefreshFlag::set(&self.refreshing);

        if !self.manifest.has_per_file_metadata(index_name) {
            return self.fallback_rebuild(
                index_name,
                directories,
                RebuildReason::MissingPerFileMetadata,
            );
        }
        if !self.layout.index_exists(index_name) {
            return self.fallback_rebuild(index_name, directories, RebuildReason::IndexNotFound);
        }
        if self.index.read().is_none() {
            return self.fallback_rebuild(index_name, directories, RebuildReason::NoCurrentIndex);
        }

        let changes = self.manifest.detect_changes(
            index_name,
            directories,
            self.clock.as_ref(),
            self.stability_window_secs,
        );
        if changes.is_empty() {
            return Ok(RefreshResult::NoChange);
        }

        self.apply_incremental(index_name, directories, changes)
    }

    /// Forced full rebuild, used when the configuration changes in ways the
    /// incremental path cannot reconcile (directory removals, renamed index).
    pub fn rebuild(&self, index_name: &str, directories: &[String]) -> AppResult<()> {
        let _gate = self.refresh_gate.lock();
        let _flag = RefreshFlag::set(&self.refreshing);
        self.build_and_install(index_name, directories)
    }

    fn fallback_rebuild(
        &self,
        index_name: &str,
        directories: &[String],
        reason: RebuildReason,
    ) -> AppResult<RefreshResult> {
        info!("refresh falling back to full rebuild: {}", reason);
        match self.build_and_install(index_name, directories) {
            Ok(()) => Ok(RefreshResult::FullRebuild { reason }),
            // An empty corpus is fatal at startup but benign on refresh.
            Err(AppError::CorpusEmpty(detail)) => {
                info!("corpus is empty, nothing to rebuild ({})", detail);
                Ok(RefreshResult::NoChange)
            }
            Err(e) => Err(e),
        }
    }

    /// Build a fresh store off-lock, persist it, then swap it in and write
    /// the manifest under the exclusive lock.
    fn build_and_install(&self, index_name: &str, directories: &[String]) -> AppResult<()> {
        let files = loader::load_markdown_files(directories)?;
        if files.is_empty() {
            return Err(AppError::CorpusEmpty(format!(
                "no markdown files under {:?}",
                directories
            )));
        }

        let prepared = self.prepare_files(&files)?;
        if prepared.iter().all(|p| p.chunks.is_empty()) {
            return Err(AppError::CorpusEmpty(
                "no chunks created from markdown files".into(),
            ));
        }

        let mut store = VectorStore::new();
        let mut records = BTreeMap::new();
        for file in prepared {
            store.add(file.chunks)?;
            records.insert(file.path, file.record);
        }

        let (ann, meta) = self.layout.index_paths(index_name);
        store.persist(&ann, &meta)?;
        let checksum = loader::compute_directories_checksum(directories);

        let mut guard = self.index.write();
        self.manifest
            .replace_index_state(index_name, directories, checksum, records)?;
        *guard = Some(store);
        info!(
            "index '{}' built: {} chunks from {} directories",
            index_name,
            guard.as_ref().map(|s| s.size()).unwrap_or(0),
            directories.len()
        );
        Ok(())
    }

    fn apply_incremental(
        &self,
        index_name: &str,
        directories: &[String],
        changes: FileChanges,
    ) -> AppResult<RefreshResult> {
        // Snapshot the chunk ownership of everything going away.
        let mut ids_to_remove: Vec<u64> = Vec::new();
        for path in changes.deleted.iter().chain(changes.modified.iter()) {
            ids_to_remove.extend(self.manifest.chunk_ids_for(index_name, path));
        }

        // Load, chunk and embed outside the lock.
        let to_load: Vec<PathBuf> = changes
            .added
            .iter()
            .chain(changes.modified.iter())
            .map(PathBuf::from)
            .collect();
        let loaded = loader::load_files(&to_load);
        let prepared = self.prepare_files(&loaded)?;

        // Delete-then-insert: recomputed IDs for re-ingested files join the
        // removal set so the insert below can never collide, even if the
        // manifest drifted from the persisted store.
        for file in &prepared {
            ids_to_remove.extend(file.record.chunk_ids.iter().copied());
        }

        let (ann, meta) = self.layout.index_paths(index_name);
        let checksum = loader::compute_directories_checksum(directories);

        let mut guard = self.index.write();
        let store = guard
            .as_mut()
            .ok_or_else(|| AppError::IndexState("live index vanished during refresh".into()))?;

        let removed = store.remove(&ids_to_remove);
        let mut records = self.manifest.all_file_records(index_name);
        for path in changes.deleted.iter().chain(changes.modified.iter()) {
            records.remove(path);
        }

        let mut inserted = 0usize;
        let mut failure: Option<AppError> = None;
        for file in prepared {
            inserted += file.chunks.len();
            if let Err(e) = store.add(file.chunks) {
                failure = Some(e);
                break;
            }
            records.insert(file.path, file.record);
        }
        if failure.is_none() {
            failure = store.persist(&ann, &meta).err();
        }
        if failure.is_none() {
            failure = self
                .manifest
                .replace_index_state(index_name, directories, checksum, records)
                .err();
        }
        if let Some(e) = failure {
            // Roll the in-memory state back to the last durable snapshot so
            // readers keep seeing something consistent with disk. A manifest
            // left behind the store self-heals on the next pass: the files it
            // still lists as stale get re-ingested, and re-ingested IDs join
            // the removal set before insertion.
            self.restore_from_disk(index_name, &mut guard);
            return Err(e);
        }

        info!(
            "incremental update: {} added, {} modified, {} deleted ({} chunks removed, {} inserted)",
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len(),
            removed,
            inserted
        );

        Ok(RefreshResult::Incremental {
            added: changes.added.into_iter().collect(),
            modified: changes.modified.into_iter().collect(),
            deleted: changes.deleted.into_iter().collect(),
        })
    }

    /// Chunk and embed a set of loaded files. A file that fails chunking
    /// (over the per-file chunk cap) is skipped with a warning so one bad
    /// document never blocks the rest of the corpus. Embedding failures are
    /// fatal for the whole batch.
    fn prepare_files(&self, files: &[LoadedFile]) -> AppResult<Vec<PreparedFile>> {
        let mut pending: Vec<(String, f64, Vec<crate::chunker::Chunk>)> = Vec::new();
        for file in files {
            let path = file.path.to_string_lossy().to_string();
            let chunks = self.chunker.chunk(&path, &file.content);
            if let Err(e) = identity::check_chunk_count(&path, chunks.len()) {
                warn!("skipping file: {}", e);
                continue;
            }
            pending.push((path, file.mtime, chunks));
        }

        let texts: Vec<String> = pending
            .iter()
            .flat_map(|(_, _, chunks)| chunks.iter().map(|c| c.text.clone()))
            .collect();
        let mut vectors = self.embedder.generate(&texts)?.into_iter();

        let mut prepared = Vec::with_capacity(pending.len());
        for (path, mtime, chunks) in pending {
            let mut chunk_ids = Vec::with_capacity(chunks.len());
            let mut prepared_chunks = Vec::with_capacity(chunks.len());
            for (i, chunk) in chunks.into_iter().enumerate() {
                let id = identity::chunk_id(&path, i);
                let vector = vectors.next().ok_or_else(|| {
                    AppError::EmbeddingFailure("embedding result shorter than input".into())
                })?;
                chunk_ids.push(id);
                prepared_chunks.push(PreparedChunk {
                    id,
                    text: chunk.text,
                    metadata: chunk.metadata,
                    vector,
                });
            }
            prepared.push(PreparedFile {
                path,
                record: FileRecord { mtime, chunk_ids },
                chunks: prepared_chunks,
            });
        }
        Ok(prepared)
    }

    fn restore_from_disk(&self, index_name: &str, guard: &mut Option<VectorStore>) {
        let (ann, meta) = self.layout.index_paths(index_name);
        match VectorStore::load(&ann, &meta) {
            Ok(store) => {
                warn!("restored index '{}' from last durable snapshot", index_name);
                *guard = Some(store);
            }
            Err(e) => {
                warn!(
                    "could not restore index '{}' from disk after failed persist: {}",
                    index_name, e
                );
            }
        }
    }
}

/// Group a store's chunks by source file and order each file's IDs by their
/// embedded chunk index. Files no longer on disk get an mtime of zero so the
/// next refresh classifies them as deleted.
fn reconstruct_file_records(
    store: &VectorStore,
    directories: &[String],
) -> BTreeMap<String, FileRecord> {
    let mtimes: BTreeMap<String, f64> = loader::scan_markdown_files(directories)
        .into_iter()
        .map(|f| (f.path.to_string_lossy().to_string(), f.mtime))
        .collect();

    let mut grouped: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (id, meta) in store.chunk_entries() {
        grouped.entry(meta.file_path.clone()).or_default().push(id);
    }

    grouped
        .into_iter()
        .map(|(path, mut chunk_ids)| {
            chunk_ids.sort_by_key(|id| id & 0xFFFF);
            let mtime = mtimes.get(&path).copied().unwrap_or(0.0);
            (path, FileRecord { mtime, chunk_ids })
        })
        .collect()
}
