//! Shared test support: deterministic fakes and corpus fixtures.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use markdown_qa::cache::{CacheLayout, EmbeddingCache};
use markdown_qa::chunker::MarkdownChunker;
use markdown_qa::embeddings::{EmbeddingGenerator, EmbeddingProvider};
use markdown_qa::error::AppResult;
use markdown_qa::index_manager::IndexManager;
use markdown_qa::loader::Clock;
use tempfile::TempDir;

/// Deterministic embedding provider: the vector is a pure function of the
/// text, and every batch call is counted. An optional per-batch delay lets
/// concurrency tests stretch the refresh window.
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
    delay_ms: u64,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(delay_ms: u64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay_ms,
        }
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let sum: u32 = text.bytes().map(u32::from).sum();
        let first = text.bytes().next().unwrap_or(0) as f32;
        vec![sum as f32, first, text.len() as f32, 1.0]
    }
}

impl EmbeddingProvider for CountingEmbedder {
    fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
        }
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

/// A clock an hour ahead of the wall clock, so fixture files written moments
/// ago never trip the editing-stability heuristic.
pub struct FutureClock;

impl Clock for FutureClock {
    fn now_secs(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            + 3600.0
    }
}

pub struct TestHarness {
    pub tmp: TempDir,
    pub docs: PathBuf,
    pub dirs: Vec<String>,
    pub provider: Arc<CountingEmbedder>,
    pub manager: Arc<IndexManager>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(CountingEmbedder::new()))
    }

    pub fn with_provider(provider: Arc<CountingEmbedder>) -> Self {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();

        let layout = CacheLayout::new(tmp.path().join("cache")).unwrap();
        let embedder = Arc::new(EmbeddingGenerator::new(
            provider.clone(),
            EmbeddingCache::new(layout.embedding_dir().to_path_buf()),
        ));
        let manager = Arc::new(
            IndexManager::new(layout, embedder, Arc::new(MarkdownChunker::default()))
                .with_clock(Arc::new(FutureClock)),
        );

        let dirs = vec![docs.to_string_lossy().to_string()];
        Self {
            tmp,
            docs,
            dirs,
            provider,
            manager,
        }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.docs.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn bump_mtime(&self, path: &Path, secs_ahead: u64) {
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(secs_ahead))
            .unwrap();
    }

    pub fn store_ids(&self) -> std::collections::BTreeSet<u64> {
        self.manager
            .with_index(|store| store.chunk_entries().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    pub fn manifest_ids(&self, index: &str) -> std::collections::BTreeSet<u64> {
        self.manager
            .manifest()
            .all_file_records(index)
            .values()
            .flat_map(|record| record.chunk_ids.iter().copied())
            .collect()
    }
}
