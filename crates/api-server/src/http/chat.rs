use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shared::models::{ChatRequest, ChatResponse};
use tracing::{info, warn};

use super::errors::bad_request_response;
use super::observability::RequestContext;
use super::session::resolve_session_id;
use super::{AppState, pipeline_request};

/// Single-exchange mode: the whole turn in one JSON reply.
pub(super) async fn chat_exchange(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(
                request_id = %context.request_id,
                error = %rejection,
                "rejected malformed chat body"
            );
            return bad_request_response("invalid_request", "Invalid JSON format");
        }
    };

    let session_id = resolve_session_id(request.client_session_id());
    let Some(pipeline_request) = pipeline_request(&request, &session_id) else {
        return bad_request_response("missing_query", "No query provided");
    };

    let responses = state.pipeline.respond(pipeline_request).await;
    info!(
        request_id = %context.request_id,
        session_id = %session_id,
        parts = responses.len(),
        "completed chat exchange"
    );

    (
        StatusCode::OK,
        Json(ChatResponse {
            responses,
            session_id,
        }),
    )
        .into_response()
}
