use axum::routing::get;
use axum::{Router, middleware};
use shared::models::ChatRequest;
use shared::pipeline::{PipelineRequest, ResponsePipeline};
use tower_http::cors::CorsLayer;

mod chat;
mod errors;
mod health;
mod observability;
mod session;
mod ws;

pub use session::resolve_session_id;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: ResponsePipeline,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/chat", get(ws::chat_socket).post(chat::chat_exchange))
        .layer(middleware::from_fn(
            observability::request_observability_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Builds the pipeline input, or `None` when the query is missing or blank.
fn pipeline_request(request: &ChatRequest, session_id: &str) -> Option<PipelineRequest> {
    let query = request.trimmed_query()?;
    Some(PipelineRequest {
        query: query.to_string(),
        session_id: session_id.to_string(),
        institution_id: request.institution_id.clone(),
        personal_info: request.personal_info.clone(),
    })
}
