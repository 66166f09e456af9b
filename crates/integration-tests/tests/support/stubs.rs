#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream;
use shared::llm::{LlmGateway, LlmGatewayError, LlmGatewayRequest, LlmStreamFuture, LlmTokenStream};
use shared::retrieval::{KnowledgeBase, RetrievalFuture, RetrievalHit};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum ModelReply {
    Deltas(Vec<&'static str>),
    Fail(&'static str),
}

/// Scripted model: replies are consumed in order, an exhausted script fails.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    replies: Arc<Mutex<VecDeque<ModelReply>>>,
    requests: Arc<Mutex<Vec<LlmGatewayRequest>>>,
}

impl ScriptedGateway {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn requests(&self) -> Vec<LlmGatewayRequest> {
        self.requests.lock().await.clone()
    }
}

impl LlmGateway for ScriptedGateway {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    fn stream<'a>(&'a self, request: LlmGatewayRequest) -> LlmStreamFuture<'a> {
        Box::pin(async move {
            self.requests.lock().await.push(request);
            let reply = self
                .replies
                .lock()
                .await
                .pop_front()
                .unwrap_or(ModelReply::Fail("script exhausted"));

            match reply {
                ModelReply::Deltas(deltas) => {
                    let items = deltas
                        .into_iter()
                        .map(|delta| Ok(delta.to_string()))
                        .collect::<Vec<_>>();
                    Ok(Box::pin(stream::iter(items)) as LlmTokenStream)
                }
                ModelReply::Fail(reason) => {
                    Err(LlmGatewayError::ProviderFailure(reason.to_string()))
                }
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct StaticKnowledgeBase {
    hits: Vec<RetrievalHit>,
}

impl StaticKnowledgeBase {
    pub fn with_hits(hits: Vec<RetrievalHit>) -> Self {
        Self { hits }
    }
}

impl KnowledgeBase for StaticKnowledgeBase {
    fn retrieve<'a>(
        &'a self,
        _knowledge_base_id: &'a str,
        _query: &'a str,
        _number_of_results: usize,
    ) -> RetrievalFuture<'a> {
        Box::pin(async move { Ok(self.hits.clone()) })
    }
}
