use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prompt::AssembledPrompt;

pub type LlmTokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmGatewayError>> + Send>>;

pub type LlmStreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LlmTokenStream, LlmGatewayError>> + Send + 'a>>;

pub type LlmGatewayFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LlmGatewayResponse, LlmGatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmGatewayRequest {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl From<AssembledPrompt> for LlmGatewayRequest {
    fn from(prompt: AssembledPrompt) -> Self {
        Self {
            system_prompt: prompt.system_prompt,
            user_prompt: prompt.user_prompt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmGatewayResponse {
    pub model: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum LlmGatewayError {
    #[error("llm provider request timed out")]
    Timeout,
    #[error("llm provider request failed: {0}")]
    ProviderFailure(String),
    #[error("llm provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
}

/// Remote completion service.
///
/// `stream` resolves once the provider has accepted the request; the returned
/// stream yields text deltas in order and ends only after the provider's
/// explicit end-of-stream signal. Ending any other way yields an error item.
pub trait LlmGateway: Send + Sync {
    fn model_id(&self) -> &str;

    fn stream<'a>(&'a self, request: LlmGatewayRequest) -> LlmStreamFuture<'a>;

    fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a> {
        Box::pin(async move {
            let mut deltas = self.stream(request).await?;
            let mut content = String::new();
            while let Some(delta) = deltas.next().await {
                content.push_str(&delta?);
            }

            Ok(LlmGatewayResponse {
                model: self.model_id().to_string(),
                content,
            })
        })
    }
}
