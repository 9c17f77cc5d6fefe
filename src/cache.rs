//! On-disk cache layout and the content-addressed embedding cache.
//!
//! Everything durable lives under one cache root (default
//! `~/.markdown-qa/cache`): serialized indexes, the manifest, and cached
//! embeddings. The embedding cache is keyed by SHA-256 of the chunk text, so
//! identical text anywhere in the corpus resolves to one entry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::AppResult;

/// Resolved locations of all durable state under the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    cache_root: PathBuf,
    index_dir: PathBuf,
    embedding_dir: PathBuf,
}

impl CacheLayout {
    /// Create the layout, materializing the directory tree.
    pub fn new(cache_root: PathBuf) -> AppResult<Self> {
        let index_dir = cache_root.join("indexes");
        let embedding_dir = cache_root.join("embeddings");
        std::fs::create_dir_all(&index_dir)?;
        std::fs::create_dir_all(&embedding_dir)?;
        Ok(Self {
            cache_root,
            index_dir,
            embedding_dir,
        })
    }

    /// Default root under the user's home directory.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".markdown-qa")
            .join("cache")
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn embedding_dir(&self) -> &Path {
        &self.embedding_dir
    }

    /// Paths of the two persistence files for a named index.
    pub fn index_paths(&self, index_name: &str) -> (PathBuf, PathBuf) {
        let ann = self.index_dir.join(format!("{index_name}.ann"));
        let meta = self.index_dir.join(format!("{index_name}.meta"));
        (ann, meta)
    }

    /// True if both persistence files of a named index exist.
    pub fn index_exists(&self, index_name: &str) -> bool {
        let (ann, meta) = self.index_paths(index_name);
        ann.exists() && meta.exists()
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.cache_root.join("indexes.json")
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    embedding: Vec<f32>,
    /// First 100 characters of the source text, kept for manual inspection.
    text: String,
}

/// Disk-backed map from text content to its embedding vector.
///
/// The cache is an optimization, never a requirement: reads treat any parse
/// error as a miss and writes are best-effort.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
}

impl EmbeddingCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn cache_key(text: &str) -> String {
        format!("{:x}", Sha256::digest(text.as_bytes()))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up the embedding for `text`. Corrupt entries read as a miss.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let path = self.entry_path(&Self::cache_key(text));
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&json) {
            Ok(entry) => Some(entry.embedding),
            Err(_) => None,
        }
    }

    /// Store the embedding for `text`. Failures are logged and swallowed.
    pub fn put(&self, text: &str, embedding: &[f32]) {
        let entry = CacheEntry {
            embedding: embedding.to_vec(),
            text: text.chars().take(100).collect(),
        };
        let path = self.entry_path(&Self::cache_key(text));
        let result = serde_json::to_string(&entry)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&path, json));
        if let Err(e) = result {
            warn!("failed to write embedding cache entry {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, EmbeddingCache) {
        let tmp = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(tmp.path().to_path_buf());
        (tmp, cache)
    }

    #[test]
    fn round_trips_an_embedding() {
        let (_tmp, cache) = cache();
        assert!(cache.get("hello").is_none());
        cache.put("hello", &[0.1, 0.2, 0.3]);
        assert_eq!(cache.get("hello"), Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn identical_text_shares_one_entry() {
        let (tmp, cache) = cache();
        cache.put("same text", &[1.0]);
        cache.put("same text", &[1.0]);
        let entries = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn corrupt_entry_reads_as_miss() {
        let (tmp, cache) = cache();
        cache.put("doc", &[0.5]);
        let key = format!("{:x}", Sha256::digest("doc".as_bytes()));
        std::fs::write(tmp.path().join(format!("{key}.json")), "{not json").unwrap();
        assert!(cache.get("doc").is_none());
    }

    #[test]
    fn stored_text_is_truncated_to_100_chars() {
        let (tmp, cache) = cache();
        let long = "x".repeat(500);
        cache.put(&long, &[0.0]);
        let key = format!("{:x}", Sha256::digest(long.as_bytes()));
        let raw = std::fs::read_to_string(tmp.path().join(format!("{key}.json"))).unwrap();
        let entry: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry["text"].as_str().unwrap().len(), 100);
    }

    #[test]
    fn layout_creates_subdirectories() {
        let tmp = TempDir::new().unwrap();
        let layout = CacheLayout::new(tmp.path().join("cache")).unwrap();
        assert!(layout.embedding_dir().is_dir());
        let (ann, meta) = layout.index_paths("default");
        assert!(ann.ends_with("indexes/default.ann"));
        assert!(meta.ends_with("indexes/default.meta"));
        assert!(!layout.index_exists("default"));
    }
}
