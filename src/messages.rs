//! WebSocket wire protocol.
//!
//! Clients send `query` and `status` messages; the server replies with
//! `response`/`error`/`status`, or the streaming triple `stream_start`,
//! `stream_chunk`*, `stream_end`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Query {
        question: String,
        /// Optional index name; the server currently serves one index and
        /// accepts but ignores mismatching names.
        #[serde(default)]
        index: Option<String>,
        /// Streaming is the default; `"stream": false` requests a single
        /// `response` message instead of the `stream_*` sequence.
        #[serde(default = "default_stream")]
        stream: bool,
    },
    Status,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        answer: String,
        sources: Vec<String>,
    },
    Error {
        message: String,
    },
    Status {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StreamStart,
    StreamChunk {
        chunk: String,
    },
    StreamEnd {
        sources: Vec<String>,
    },
}

impl ServerMessage {
    pub fn response(answer: String, sources: Vec<String>) -> Self {
        ServerMessage::Response {
            answer,
            sources: deduplicate_paths(sources),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn status(status: &'static str, message: impl Into<String>) -> Self {
        ServerMessage::Status {
            status,
            message: Some(message.into()),
        }
    }

    pub fn stream_end(sources: Vec<String>) -> Self {
        ServerMessage::StreamEnd {
            sources: deduplicate_paths(sources),
        }
    }
}

/// First-seen unique paths, order preserved.
pub fn deduplicate_paths(paths: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Validate a parsed query message before handling it.
pub fn validate_question(question: &str) -> Result<(), &'static str> {
    if question.trim().is_empty() {
        return Err("Question cannot be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_message_parses_with_and_without_index() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"query","question":"how?"}"#).unwrap();
        match msg {
            ClientMessage::Query {
                question,
                index,
                stream,
            } => {
                assert_eq!(question, "how?");
                assert!(index.is_none());
                assert!(stream);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"query","question":"how?","index":"docs"}"#)
                .unwrap();
        match msg {
            ClientMessage::Query { index, .. } => assert_eq!(index.as_deref(), Some("docs")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn query_message_can_opt_out_of_streaming() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"query","question":"how?","stream":false}"#)
                .unwrap();
        match msg {
            ClientMessage::Query { stream, .. } => assert!(!stream),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_type_is_a_parse_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"query"}"#).is_err());
    }

    #[test]
    fn server_messages_serialize_with_type_tags() {
        let json = serde_json::to_value(ServerMessage::response(
            "It works.".into(),
            vec!["/docs/a.md".into(), "/docs/a.md".into()],
        ))
        .unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["answer"], "It works.");
        assert_eq!(json["sources"], serde_json::json!(["/docs/a.md"]));

        let json = serde_json::to_value(ServerMessage::StreamChunk {
            chunk: "hi".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "stream_chunk");
        assert_eq!(json["chunk"], "hi");

        let json = serde_json::to_value(ServerMessage::status("ready", "Server ready")).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "ready");

        let json = serde_json::to_value(ServerMessage::StreamStart).unwrap();
        assert_eq!(json["type"], "stream_start");
    }

    #[test]
    fn stream_end_dedups_sources_preserving_order() {
        let msg = ServerMessage::stream_end(vec![
            "/docs/b.md".into(),
            "/docs/a.md".into(),
            "/docs/b.md".into(),
        ]);
        match msg {
            ServerMessage::StreamEnd { sources } => {
                assert_eq!(sources, vec!["/docs/b.md", "/docs/a.md"]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn blank_questions_are_rejected() {
        assert!(validate_question("   ").is_err());
        assert!(validate_question("why?").is_ok());
    }
}
