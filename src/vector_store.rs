//! Vector store: a usearch index keyed by chunk ID, with the chunk texts and
//! metadata held in parallel arrays.
//!
//! The usearch structure and the arrays are mutated together under the
//! owner's writer lock and are never observed mid-mutation by readers. The
//! metric is squared L2, which keeps the ordering semantics of a flat L2
//! index. External u64 keys give the insert-by-ID / remove-by-ID / search-
//! returning-IDs capability the incremental updater needs.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::chunker::ChunkMeta;
use crate::error::{AppError, AppResult};

/// Bump when the companion record layout changes. Readers tolerate older
/// records by defaulting absent fields to empty.
const META_FORMAT_VERSION: u32 = 1;

/// Initial key capacity reserved on a fresh index.
const INITIAL_CAPACITY: usize = 1024;

/// One nearest-neighbour result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub text: String,
    pub metadata: ChunkMeta,
    pub distance: f32,
}

/// A chunk ready for insertion: ID, text, metadata, embedding.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub id: u64,
    pub text: String,
    pub metadata: ChunkMeta,
    pub vector: Vec<f32>,
}

/// Companion record persisted next to the serialized index structure.
#[derive(Serialize, Deserialize, Default)]
struct CompanionRecord {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    dimensions: usize,
    #[serde(default)]
    chunk_ids: Vec<u64>,
    #[serde(default)]
    texts: Vec<String>,
    #[serde(default)]
    metadatas: Vec<ChunkMeta>,
}

pub struct VectorStore {
    index: Option<usearch::Index>,
    dimensions: usize,
    chunk_ids: Vec<u64>,
    texts: Vec<String>,
    metadatas: Vec<ChunkMeta>,
    positions: HashMap<u64, usize>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dimensions", &self.dimensions)
            .field("chunk_ids", &self.chunk_ids)
            .field("texts", &self.texts)
            .field("metadatas", &self.metadatas)
            .field("positions", &self.positions)
            .finish()
    }
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorStore {
    /// An empty store. The vector dimensionality is fixed by the first
    /// inserted batch.
    pub fn new() -> Self {
        Self {
            index: None,
            dimensions: 0,
            chunk_ids: Vec::new(),
            texts: Vec::new(),
            metadatas: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn create_index(dimensions: usize) -> AppResult<usearch::Index> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::L2sq,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        usearch::Index::new(&options)
            .map_err(|e| AppError::IndexState(format!("failed to create vector index: {e}")))
    }

    fn ensure_index(&mut self, dimensions: usize) -> AppResult<()> {
        match &self.index {
            Some(_) if self.dimensions == dimensions => Ok(()),
            Some(_) => Err(AppError::IndexState(format!(
                "embedding dimension changed: index has {}, got {}",
                self.dimensions, dimensions
            ))),
            None => {
                let index = Self::create_index(dimensions)?;
                index
                    .reserve(INITIAL_CAPACITY)
                    .map_err(|e| AppError::IndexState(format!("failed to reserve capacity: {e}")))?;
                self.index = Some(index);
                self.dimensions = dimensions;
                Ok(())
            }
        }
    }

    /// Append a batch of chunks. Every ID must be absent; an ID that is
    /// already present (or repeated within the batch) rejects the whole
    /// batch before anything is written. A batch that fails midway is rolled
    /// back by removing the entries inserted by this call.
    pub fn add(&mut self, chunks: Vec<PreparedChunk>) -> AppResult<()> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };
        let dimensions = first.vector.len();
        if dimensions == 0 {
            return Err(AppError::IndexState("zero-dimensional embedding".into()));
        }
        self.ensure_index(dimensions)?;

        let mut batch_ids = std::collections::HashSet::with_capacity(chunks.len());
        for chunk in &chunks {
            if self.positions.contains_key(&chunk.id) || !batch_ids.insert(chunk.id) {
                return Err(AppError::IndexState(format!(
                    "chunk id {} already present in index",
                    chunk.id
                )));
            }
            if chunk.vector.len() != dimensions {
                return Err(AppError::IndexState(format!(
                    "embedding dimension mismatch in batch: {} vs {}",
                    chunk.vector.len(),
                    dimensions
                )));
            }
        }

        let index = self.index.as_ref().ok_or_else(|| {
            AppError::IndexState("vector index not initialized".into())
        })?;

        let needed = self.chunk_ids.len() + chunks.len();
        if needed > index.capacity() {
            index
                .reserve((needed * 2).max(INITIAL_CAPACITY))
                .map_err(|e| AppError::IndexState(format!("failed to grow capacity: {e}")))?;
        }

        let mut inserted: Vec<u64> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if let Err(e) = index.add(chunk.id, &chunk.vector) {
                let failed_id = chunk.id;
                self.rollback(&inserted);
                return Err(AppError::IndexState(format!(
                    "failed to insert chunk {failed_id}: {e}"
                )));
            }
            let position = self.chunk_ids.len();
            self.chunk_ids.push(chunk.id);
            self.texts.push(chunk.text);
            self.metadatas.push(chunk.metadata);
            self.positions.insert(chunk.id, position);
            inserted.push(chunk.id);
        }
        Ok(())
    }

    fn rollback(&mut self, inserted: &[u64]) {
        let undone = self.remove(inserted);
        if undone != inserted.len() {
            warn!(
                "rollback removed {} of {} partially inserted chunks",
                undone,
                inserted.len()
            );
        }
    }

    /// Remove entries by ID, returning how many were actually removed.
    /// Missing IDs are silently ignored.
    pub fn remove(&mut self, ids: &[u64]) -> usize {
        let mut removed = 0usize;
        for id in ids {
            let Some(position) = self.positions.remove(id) else {
                continue;
            };
            if let Some(index) = &self.index {
                if let Err(e) = index.remove(*id) {
                    warn!("failed to remove vector {}: {}", id, e);
                }
            }
            // Order of the parallel arrays is not meaningful: swap-remove
            // and repoint the entry that moved into the hole.
            self.chunk_ids.swap_remove(position);
            self.texts.swap_remove(position);
            self.metadatas.swap_remove(position);
            if position < self.chunk_ids.len() {
                let moved = self.chunk_ids[position];
                self.positions.insert(moved, position);
            }
            removed += 1;
        }
        removed
    }

    /// k nearest neighbours by squared L2 distance, ascending. Keys the
    /// underlying index reports that have no companion entry are dropped.
    pub fn search(&self, query: &[f32], k: usize) -> AppResult<Vec<SearchHit>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        if self.chunk_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimensions {
            return Err(AppError::IndexState(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimensions
            )));
        }

        let matches = index
            .search(query, k)
            .map_err(|e| AppError::IndexState(format!("vector search failed: {e}")))?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(&position) = self.positions.get(key) else {
                continue;
            };
            hits.push(SearchHit {
                id: *key,
                text: self.texts[position].clone(),
                metadata: self.metadatas[position].clone(),
                distance: *distance,
            });
        }
        Ok(hits)
    }

    /// Write the serialized index and its companion record. The companion is
    /// written atomically; the index file is written in one shot by usearch.
    pub fn persist(&self, ann_path: &Path, meta_path: &Path) -> AppResult<()> {
        let index = self.index.as_ref().ok_or_else(|| {
            AppError::IndexState("nothing to persist: store was never populated".into())
        })?;

        index
            .save(ann_path.to_string_lossy().as_ref())
            .map_err(|e| AppError::PersistFailure(format!("index save: {e}")))?;

        let record = CompanionRecord {
            version: META_FORMAT_VERSION,
            dimensions: self.dimensions,
            chunk_ids: self.chunk_ids.clone(),
            texts: self.texts.clone(),
            metadatas: self.metadatas.clone(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| AppError::PersistFailure(format!("companion encode: {e}")))?;
        let tmp = meta_path.with_extension("meta.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| AppError::PersistFailure(format!("companion write: {e}")))?;
        std::fs::rename(&tmp, meta_path)
            .map_err(|e| AppError::PersistFailure(format!("companion rename: {e}")))?;
        Ok(())
    }

    /// Load a store from its two persistence files, rebuilding the
    /// ID-to-position map. Older companion records with absent fields read
    /// as empty.
    pub fn load(ann_path: &Path, meta_path: &Path) -> AppResult<Self> {
        let json = std::fs::read_to_string(meta_path)
            .map_err(|e| AppError::IntegrityFailure(format!("companion unreadable: {e}")))?;
        let record: CompanionRecord = serde_json::from_str(&json)
            .map_err(|e| AppError::IntegrityFailure(format!("companion corrupt: {e}")))?;

        if record.chunk_ids.len() != record.texts.len()
            || record.chunk_ids.len() != record.metadatas.len()
        {
            return Err(AppError::IntegrityFailure(format!(
                "companion arrays disagree: {} ids, {} texts, {} metadatas",
                record.chunk_ids.len(),
                record.texts.len(),
                record.metadatas.len()
            )));
        }
        if record.dimensions == 0 {
            return Err(AppError::IntegrityFailure(
                "companion record has no dimensionality".into(),
            ));
        }

        let index = Self::create_index(record.dimensions)?;
        index
            .load(ann_path.to_string_lossy().as_ref())
            .map_err(|e| AppError::IntegrityFailure(format!("index load: {e}")))?;

        let positions: HashMap<u64, usize> = record
            .chunk_ids
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();
        if positions.len() != record.chunk_ids.len() {
            return Err(AppError::IntegrityFailure(
                "companion record contains duplicate chunk ids".into(),
            ));
        }

        Ok(Self {
            index: Some(index),
            dimensions: record.dimensions,
            chunk_ids: record.chunk_ids,
            texts: record.texts,
            metadatas: record.metadatas,
            positions,
        })
    }

    pub fn size(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn dimension(&self) -> usize {
        self.dimensions
    }

    /// True iff the index structure and the companion arrays agree and the
    /// store is non-empty.
    pub fn is_valid(&self) -> bool {
        let Some(index) = &self.index else {
            return false;
        };
        let n = self.chunk_ids.len();
        n > 0 && self.texts.len() == n && self.metadatas.len() == n && index.size() == n
    }

    /// Iterate over `(chunk_id, metadata)` pairs, used to reconstruct
    /// per-file ownership from a store that predates the manifest's
    /// per-file records.
    pub fn chunk_entries(&self) -> impl Iterator<Item = (u64, &ChunkMeta)> {
        self.chunk_ids
            .iter()
            .copied()
            .zip(self.metadatas.iter())
    }
}
