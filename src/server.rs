//! WebSocket transport and health endpoint.
//!
//! Each client message is handled in order on its connection. Queries run on
//! the blocking pool (retrieval and generation are synchronous) and stream
//! their answer back through a channel; the socket task forwards frames as
//! they arrive.

use axum::{
    Json, Router,
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::index_manager::ReadyState;
use crate::messages::{ClientMessage, ServerMessage, validate_question};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.index_manager.status();
    Json(serde_json::json!({
        "status": status.state.as_str(),
        "count": status.count,
        "dimension": status.dimension,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("client connected");

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let reply_failed = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Query {
                        question,
                        index,
                        stream,
                    }) => {
                        if let Some(name) = index {
                            debug!("query addressed to index '{}'", name);
                        }
                        handle_query(&mut socket, &state, &question, stream)
                            .await
                            .is_err()
                    }
                    Ok(ClientMessage::Status) => send(&mut socket, &status_message(&state))
                        .await
                        .is_err(),
                    Err(_) => send(&mut socket, &ServerMessage::error("Invalid message format"))
                        .await
                        .is_err(),
                };
                if reply_failed {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("client disconnected");
}

fn status_message(state: &AppState) -> ServerMessage {
    let status = state.index_manager.status();
    match status.state {
        ReadyState::Ready => ServerMessage::status("ready", "Server ready"),
        ReadyState::Updating => ServerMessage::status("indexing", "Server reloading indexes"),
        ReadyState::NotReady => ServerMessage::status("not_ready", "Server loading indexes"),
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"error","message":"internal serialization error"}"#.to_string()
    });
    socket.send(Message::Text(json.into())).await
}

/// Run one query: validate, then either stream `stream_start`, chunks, and
/// `stream_end`, or reply with a single `response` when the client opted
/// out of streaming (a single `error` in either mode). Returns `Err` only
/// when the socket itself is gone.
async fn handle_query(
    socket: &mut WebSocket,
    state: &AppState,
    question: &str,
    stream: bool,
) -> Result<(), axum::Error> {
    if let Err(reason) = validate_question(question) {
        return send(socket, &ServerMessage::error(reason)).await;
    }
    if !state.index_manager.is_ready() {
        return send(
            socket,
            &ServerMessage::error("Server is not ready. Indexes are still loading."),
        )
        .await;
    }

    let started = std::time::Instant::now();

    if !stream {
        let answerer = state.answerer.clone();
        let question_owned = question.to_string();
        let answered =
            tokio::task::spawn_blocking(move || answerer.answer(&question_owned)).await;
        let message = match answered {
            Ok(Ok((answer, sources))) => ServerMessage::response(answer, sources),
            Ok(Err(AppError::NoRelevantContent)) => {
                ServerMessage::error(AppError::NoRelevantContent.to_string())
            }
            Ok(Err(e)) => {
                warn!("query failed: {}", e);
                ServerMessage::error(format!("Error processing query: {e}"))
            }
            Err(e) => ServerMessage::error(format!("Error processing query: {e}")),
        };
        send(socket, &message).await?;
        info!(
            "request_completed type=query request_ms={:.2} streamed=false",
            started.elapsed().as_secs_f64() * 1000.0
        );
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let answerer = state.answerer.clone();
    let question_owned = question.to_string();

    tokio::task::spawn_blocking(move || {
        match answerer.answer_stream(&question_owned) {
            Ok(stream) => {
                if tx.blocking_send(ServerMessage::StreamStart).is_err() {
                    return;
                }
                for chunk in stream.chunks {
                    let message = match chunk {
                        Ok(text) => ServerMessage::StreamChunk { chunk: text },
                        Err(e) => {
                            let _ = tx.blocking_send(ServerMessage::error(format!(
                                "Error processing query: {e}"
                            )));
                            return;
                        }
                    };
                    if tx.blocking_send(message).is_err() {
                        // Client went away mid-stream.
                        return;
                    }
                }
                let _ = tx.blocking_send(ServerMessage::stream_end(stream.sources));
            }
            Err(AppError::NoRelevantContent) => {
                let _ = tx.blocking_send(ServerMessage::error(
                    AppError::NoRelevantContent.to_string(),
                ));
            }
            Err(e) => {
                warn!("query failed: {}", e);
                let _ = tx.blocking_send(ServerMessage::error(format!(
                    "Error processing query: {e}"
                )));
            }
        }
    });

    let mut chunk_count = 0usize;
    while let Some(message) = rx.recv().await {
        if matches!(message, ServerMessage::StreamChunk { .. }) {
            chunk_count += 1;
        }
        send(socket, &message).await?;
    }

    info!(
        "request_completed type=query request_ms={:.2} chunks={}",
        started.elapsed().as_secs_f64() * 1000.0,
        chunk_count
    );
    Ok(())
}
