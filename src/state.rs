//! Shared application state wiring.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{CacheLayout, EmbeddingCache};
use crate::chunker::MarkdownChunker;
use crate::config::ServerConfig;
use crate::embeddings::{EmbeddingGenerator, OpenAiEmbeddings};
use crate::error::AppResult;
use crate::index_manager::IndexManager;
use crate::llm::OpenAiChat;
use crate::qa::QuestionAnswerer;
use crate::retrieval::QueryEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<ServerConfig>>,
    pub index_manager: Arc<IndexManager>,
    pub query_engine: Arc<QueryEngine>,
    pub answerer: Arc<QuestionAnswerer>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> AppResult<Self> {
        let layout = CacheLayout::new(config.cache_root.clone())?;
        let embedder = Arc::new(EmbeddingGenerator::new(
            Arc::new(OpenAiEmbeddings::new(&config.api)),
            EmbeddingCache::new(layout.embedding_dir().to_path_buf()),
        ));
        let index_manager = Arc::new(
            IndexManager::new(
                layout,
                embedder.clone(),
                Arc::new(MarkdownChunker::default()),
            )
            .with_stability_window(config.stability_window_secs),
        );
        let query_engine = Arc::new(QueryEngine::new(
            index_manager.clone(),
            embedder,
            config.top_k,
            config.relevance_threshold,
        ));
        let answerer = Arc::new(QuestionAnswerer::new(
            query_engine.clone(),
            Arc::new(OpenAiChat::new(&config.api)),
        ));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            index_manager,
            query_engine,
            answerer,
        })
    }
}
