//! Retrieval-augmented Q&A over a corpus of Markdown files.
//!
//! The library is organized around the index core: a content-addressed,
//! incrementally updated vector index (`index_manager`, `vector_store`,
//! `manifest`, `identity`) fed by the corpus loader and chunker, queried
//! through `retrieval`/`qa`, and exposed over a WebSocket transport.

pub mod cache;
pub mod chunker;
pub mod config;
pub mod config_watcher;
pub mod embeddings;
pub mod error;
pub mod identity;
pub mod index_manager;
pub mod llm;
pub mod loader;
pub mod manifest;
pub mod messages;
pub mod qa;
pub mod retrieval;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod vector_store;

pub use error::{AppError, AppResult};
