//! Streaming language-model provider.
//!
//! The core only needs `prompt -> iterator of text chunks`; the concrete
//! implementation talks to an OpenAI-compatible chat-completions endpoint
//! with server-sent events and yields delta contents as they arrive.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::error::{AppError, AppResult};

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 500;

pub trait LanguageModelProvider: Send + Sync {
    /// Stream the completion for `prompt` as an iterator of text chunks.
    fn stream(&self, prompt: &str) -> AppResult<Box<dyn Iterator<Item = AppResult<String>> + Send>>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Blocking client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChat {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(api: &ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(300))
            .build();
        Self {
            agent,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            model: api.llm_model.clone(),
        }
    }
}

impl LanguageModelProvider for OpenAiChat {
    fn stream(&self, prompt: &str) -> AppResult<Box<dyn Iterator<Item = AppResult<String>> + Send>> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            stream: true,
        };

        let response = self
            .agent
            .post(&format!("{}/chat/completions", self.base_url))
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&request)
            .map_err(|e| AppError::GenerationFailure(e.to_string()))?;

        Ok(Box::new(SseStream {
            lines: BufReader::new(response.into_reader()).lines(),
            done: false,
        }))
    }
}

/// Iterator over the `data:` lines of a server-sent-events response,
/// yielding non-empty delta contents until `[DONE]`.
struct SseStream<R: Read> {
    lines: std::io::Lines<BufReader<R>>,
    done: bool,
}

impl<R: Read> Iterator for SseStream<R> {
    type Item = AppResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(AppError::GenerationFailure(format!(
                        "stream read: {e}"
                    ))));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };

            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload.trim() == "[DONE]" {
                self.done = true;
                return None;
            }

            match serde_json::from_str::<StreamChunk>(payload) {
                Ok(chunk) => {
                    let content = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .unwrap_or_default();
                    if !content.is_empty() {
                        return Some(Ok(content));
                    }
                    // Role-only or empty deltas: keep reading.
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(AppError::GenerationFailure(format!(
                        "stream decode: {e}"
                    ))));
                }
            }
        }
    }
}
