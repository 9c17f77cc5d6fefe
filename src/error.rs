use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("no markdown files found: {0}")]
    CorpusEmpty(String),

    #[error("chunk limit exceeded for {path}: {count} chunks (max {max})")]
    ChunkLimitExceeded {
        path: String,
        count: usize,
        max: usize,
    },

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("persist failed: {0}")]
    PersistFailure(String),

    #[error("index integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("no relevant content found in the loaded markdown files to answer this question")]
    NoRelevantContent,

    #[error("index state error: {0}")]
    IndexState(String),

    #[error("answer generation failed: {0}")]
    GenerationFailure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AppError {
    /// Machine-readable kind tag, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::CorpusEmpty(_) => "corpus_empty",
            AppError::ChunkLimitExceeded { .. } => "chunk_limit_exceeded",
            AppError::EmbeddingFailure(_) => "embedding_failure",
            AppError::PersistFailure(_) => "persist_failure",
            AppError::IntegrityFailure(_) => "integrity_failure",
            AppError::NoRelevantContent => "no_relevant_content",
            AppError::IndexState(_) => "index_state",
            AppError::GenerationFailure(_) => "generation_failure",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
