//! Answer generation: retrieved context + question -> streamed answer.

use std::sync::Arc;

use crate::error::AppResult;
use crate::llm::LanguageModelProvider;
use crate::retrieval::QueryEngine;

/// A streaming answer: text chunks as the model produces them, plus the
/// deduplicated source paths known up front from retrieval.
pub struct AnswerStream {
    pub chunks: Box<dyn Iterator<Item = AppResult<String>> + Send>,
    pub sources: Vec<String>,
}

pub struct QuestionAnswerer {
    engine: Arc<QueryEngine>,
    llm: Arc<dyn LanguageModelProvider>,
}

impl QuestionAnswerer {
    pub fn new(engine: Arc<QueryEngine>, llm: Arc<dyn LanguageModelProvider>) -> Self {
        Self { engine, llm }
    }

    fn build_prompt(question: &str, context: &str) -> String {
        format!(
            "You are a helpful assistant that answers questions based on the \
             provided context from markdown documentation files.\n\n\
             Context from documentation:\n{context}\n\n\
             Question: {question}\n\n\
             Please provide a clear and concise answer based on the context \
             above. If the context does not contain enough information to \
             answer the question, say so explicitly. Do not make up \
             information that is not in the context."
        )
    }

    /// Retrieve context and start streaming the answer. Retrieval errors
    /// (including `NoRelevantContent`) surface before any chunk is emitted.
    pub fn answer_stream(&self, question: &str) -> AppResult<AnswerStream> {
        let (context, sources) = self.engine.retrieve_context(question)?;
        let prompt = Self::build_prompt(question, &context);
        let chunks = self.llm.stream(&prompt)?;
        Ok(AnswerStream { chunks, sources })
    }

    /// Non-streaming convenience: collect the full answer.
    pub fn answer(&self, question: &str) -> AppResult<(String, Vec<String>)> {
        let stream = self.answer_stream(question)?;
        let mut answer = String::new();
        for chunk in stream.chunks {
            answer.push_str(&chunk?);
        }
        Ok((answer, stream.sources))
    }
}
