//! Query-side retrieval: embed the question, search the live index, filter
//! by the optional distance threshold, and project to text + source tuples.

use std::sync::Arc;

use crate::embeddings::EmbeddingGenerator;
use crate::error::{AppError, AppResult};
use crate::index_manager::{IndexManager, IndexStatus};

/// One retrieved fragment with its provenance.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub file_path: String,
    pub distance: f32,
}

/// The interface the transport layer queries against.
pub struct QueryEngine {
    index_manager: Arc<IndexManager>,
    embedder: Arc<EmbeddingGenerator>,
    top_k: usize,
    /// Distance cutoff; `0.0` disables filtering.
    relevance_threshold: f32,
}

impl QueryEngine {
    pub fn new(
        index_manager: Arc<IndexManager>,
        embedder: Arc<EmbeddingGenerator>,
        top_k: usize,
        relevance_threshold: f32,
    ) -> Self {
        Self {
            index_manager,
            embedder,
            top_k,
            relevance_threshold,
        }
    }

    pub fn status(&self) -> IndexStatus {
        self.index_manager.status()
    }

    pub fn is_ready(&self) -> bool {
        self.index_manager.is_ready()
    }

    /// Retrieve the most relevant chunks for a question. The reader lock is
    /// held only for the duration of the search itself; the question is
    /// embedded before it is taken.
    pub fn retrieve(&self, question: &str) -> AppResult<Vec<RetrievedChunk>> {
        let query_vector = self.embedder.generate_one(question)?;

        let hits = self
            .index_manager
            .with_index(|store| store.search(&query_vector, self.top_k))
            .ok_or_else(|| AppError::IndexState("no index available".into()))??;

        let results: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|hit| {
                self.relevance_threshold == 0.0 || hit.distance <= self.relevance_threshold
            })
            .map(|hit| RetrievedChunk {
                text: hit.text,
                file_path: hit.metadata.file_path,
                distance: hit.distance,
            })
            .collect();

        if results.is_empty() {
            return Err(AppError::NoRelevantContent);
        }
        Ok(results)
    }

    /// Retrieve and assemble the prompt context plus the deduplicated list
    /// of source paths, in first-seen order.
    pub fn retrieve_context(&self, question: &str) -> AppResult<(String, Vec<String>)> {
        let results = self.retrieve(question)?;

        let mut sources: Vec<String> = Vec::new();
        let mut context_parts: Vec<String> = Vec::with_capacity(results.len());
        for chunk in &results {
            if !chunk.file_path.is_empty() && !sources.contains(&chunk.file_path) {
                sources.push(chunk.file_path.clone());
            }
            context_parts.push(format!("Source: {}\n{}", chunk.file_path, chunk.text));
        }

        Ok((context_parts.join("\n\n---\n\n"), sources))
    }
}
