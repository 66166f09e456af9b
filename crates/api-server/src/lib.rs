use std::sync::Arc;

use shared::cache::ResponseCache;
use shared::config::Settings;
use shared::llm::{ChatCompletionsConfigError, ChatCompletionsGateway, ChatCompletionsGatewayConfig};
use shared::memory::MemoryStore;
use shared::pipeline::ResponsePipeline;
use shared::retrieval::{ContextRetriever, HttpKnowledgeBase, RetrievalError};
use thiserror::Error;

pub mod http;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build model gateway: {0}")]
    Gateway(#[from] ChatCompletionsConfigError),
    #[error("failed to build knowledge base client: {0}")]
    KnowledgeBase(#[from] RetrievalError),
}

/// Wires the production backends behind the response pipeline.
pub async fn build_app_state(settings: &Settings) -> Result<http::AppState, StartupError> {
    let memory = MemoryStore::connect(settings.memory.clone(), &settings.redis).await;
    let knowledge_base = HttpKnowledgeBase::new(&settings.knowledge_base)?;
    let retriever = ContextRetriever::new(
        Arc::new(knowledge_base),
        settings.knowledge_base.clone(),
        settings.retrieval.clone(),
    );
    let gateway = ChatCompletionsGateway::new(ChatCompletionsGatewayConfig::from(&settings.model))?;

    Ok(http::AppState {
        pipeline: ResponsePipeline::new(
            Arc::new(memory),
            ResponseCache::new(settings.cache.clone()),
            retriever,
            Arc::new(gateway),
            settings.knowledge_base.default_institution_id.clone(),
        ),
    })
}
