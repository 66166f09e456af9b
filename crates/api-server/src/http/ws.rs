use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::models::{ChatMessage, ChatRequest, ResponsePart};
use shared::pipeline::{PipelineRequest, ResponsePipeline};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::observability::RequestContext;
use super::session::ConnectionSession;
use super::{AppState, pipeline_request};

const OUTBOUND_BUFFER: usize = 128;
const INVALID_JSON_MESSAGE: &str = "Invalid JSON format";
const MISSING_QUERY_MESSAGE: &str = "No query provided";

/// Channel mode: one persistent socket, many interleaved turns.
pub(super) async fn chat_socket(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_connection(socket, state, context.request_id))
}

async fn serve_connection(socket: WebSocket, state: AppState, request_id: String) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChatMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound chat message");
                    continue;
                }
            };
            if socket_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    info!(request_id = %request_id, "chat connection opened");
    let mut session = ConnectionSession::default();
    let mut turns = 0_u64;

    while let Some(frame) = socket_rx.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(request_id = %request_id, error = %err, "chat connection read failed");
                break;
            }
        };

        turns += 1;
        handle_frame(&raw, &state.pipeline, &mut session, &outbound_tx).await;
    }

    // In-flight turns keep running in their own tasks; only delivery stops.
    writer.abort();
    info!(request_id = %request_id, turns, "chat connection closed");
}

async fn handle_frame(
    raw: &str,
    pipeline: &ResponsePipeline,
    session: &mut ConnectionSession,
    outbound: &mpsc::Sender<ChatMessage>,
) {
    let request = match serde_json::from_str::<ChatRequest>(raw) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "rejected malformed chat frame");
            let reply = final_message(
                ResponsePart::error(INVALID_JSON_MESSAGE),
                None,
                &session.resolve(None),
            );
            let _ = outbound.send(reply).await;
            return;
        }
    };

    let session_id = session.resolve(request.client_session_id());
    let message_id = request.message_id.clone();
    let Some(pipeline_request) = pipeline_request(&request, &session_id) else {
        let reply = final_message(
            ResponsePart::error(MISSING_QUERY_MESSAGE),
            message_id,
            &session_id,
        );
        let _ = outbound.send(reply).await;
        return;
    };

    tokio::spawn(stream_turn(
        pipeline.clone(),
        pipeline_request,
        message_id,
        outbound.clone(),
    ));
}

/// Forwards one turn's parts, holding each back until the next arrives so
/// the last one can carry `is_last`. The part channel closes only after the
/// turn is recorded, so the final message always follows the memory write.
async fn stream_turn(
    pipeline: ResponsePipeline,
    request: PipelineRequest,
    message_id: Option<Value>,
    outbound: mpsc::Sender<ChatMessage>,
) {
    let session_id = request.session_id.clone();
    let mut parts = pipeline.run(request);
    let mut pending: Option<ResponsePart> = None;

    while let Some(part) = parts.recv().await {
        if let Some(previous) = pending.replace(part) {
            let message = chat_message(previous, message_id.clone(), &session_id, false);
            if outbound.send(message).await.is_err() {
                debug!(session_id = %session_id, "chat connection gone; dropping turn delivery");
                return;
            }
        }
    }

    let last = pending.unwrap_or_else(|| ResponsePart::response(""));
    let _ = outbound
        .send(final_message(last, message_id, &session_id))
        .await;
}

fn final_message(part: ResponsePart, message_id: Option<Value>, session_id: &str) -> ChatMessage {
    chat_message(part, message_id, session_id, true)
}

fn chat_message(
    part: ResponsePart,
    message_id: Option<Value>,
    session_id: &str,
    is_last: bool,
) -> ChatMessage {
    ChatMessage {
        kind: part.kind,
        content: part.content,
        message_id,
        session_id: session_id.to_string(),
        is_last,
    }
}
