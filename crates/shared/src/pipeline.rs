//! Staged answer generation for one inbound query.
//!
//! Stage order is fixed: special query, cache, retrieval, prompt, model. A
//! finished turn is recorded into session memory exactly once; a failed turn
//! produces a single error part and is not recorded.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::institutions::resolve_institution;
use crate::llm::{LlmGateway, LlmGatewayError, LlmGatewayRequest};
use crate::memory::MemoryStore;
use crate::models::{PersonalInfo, ResponsePart};
use crate::prompt::build_prompt;
use crate::retrieval::ContextRetriever;
use crate::special_query::{
    RAISE_QUERY_MARKER, SpecialQuery, classify_special_query, memory_recall_answer,
};

const PART_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] LlmGatewayError),
}

impl PipelineError {
    pub fn to_part(&self) -> ResponsePart {
        ResponsePart::error(format!("Error processing query: {self}"))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub query: String,
    pub session_id: String,
    pub institution_id: Option<String>,
    pub personal_info: Option<PersonalInfo>,
}

#[derive(Clone)]
pub struct ResponsePipeline {
    memory: Arc<MemoryStore>,
    cache: ResponseCache,
    retriever: ContextRetriever,
    gateway: Arc<dyn LlmGateway>,
    default_institution_id: String,
}

impl ResponsePipeline {
    pub fn new(
        memory: Arc<MemoryStore>,
        cache: ResponseCache,
        retriever: ContextRetriever,
        gateway: Arc<dyn LlmGateway>,
        default_institution_id: impl Into<String>,
    ) -> Self {
        Self {
            memory,
            cache,
            retriever,
            gateway,
            default_institution_id: default_institution_id.into(),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Runs the pipeline in its own task and returns the part stream.
    ///
    /// The task keeps going when the receiver is dropped, so a turn whose
    /// caller disconnected mid-stream is still recorded. The channel closes
    /// only after recording has finished.
    pub fn run(&self, request: PipelineRequest) -> mpsc::Receiver<ResponsePart> {
        let (tx, rx) = mpsc::channel(PART_BUFFER);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.execute(request, PartSink::new(tx)).await;
        });
        rx
    }

    /// Runs the pipeline to completion and returns every part in order.
    pub async fn respond(&self, request: PipelineRequest) -> Vec<ResponsePart> {
        let mut parts_rx = self.run(request);
        let mut parts = Vec::new();
        while let Some(part) = parts_rx.recv().await {
            parts.push(part);
        }
        parts
    }

    async fn execute(&self, request: PipelineRequest, mut sink: PartSink) {
        let memory = self.memory.get_memory(&request.session_id);

        if let Some(special) = classify_special_query(&request.query) {
            let answer = match special {
                SpecialQuery::Escalation => RAISE_QUERY_MARKER.to_string(),
                SpecialQuery::MemoryRecall => {
                    memory_recall_answer(memory.get_previous_question().await.as_deref())
                }
            };
            info!(
                session_id = %request.session_id,
                special = ?special,
                "answered special query"
            );
            memory.add_interaction(&request.query, &answer).await;
            sink.send(ResponsePart::response(answer)).await;
            return;
        }

        if let Some(answer) = self.cache.check(&request.query, &request.session_id) {
            info!(session_id = %request.session_id, "answered from response cache");
            memory.add_interaction(&request.query, &answer).await;
            sink.send(ResponsePart::response(answer)).await;
            return;
        }

        let institution = resolve_institution(
            request.institution_id.as_deref(),
            &self.default_institution_id,
        );
        let context = self
            .retriever
            .retrieve_and_format_context(&request.query, institution)
            .await;
        debug!(
            session_id = %request.session_id,
            institution_id = institution.id,
            passages = context.passages.len(),
            references = context.references.len(),
            "retrieved context"
        );

        let memory_context = memory.get_context().await;
        let prompt = build_prompt(
            &request.query,
            &memory_context,
            request.personal_info.as_ref(),
            &context,
            institution,
        );

        match self.invoke(prompt.into(), &mut sink).await {
            Ok(answer) => {
                self.cache
                    .store(&request.query, &request.session_id, &answer);
                memory.add_interaction(&request.query, &answer).await;
                if let Some(references) = context.references_block() {
                    sink.send(ResponsePart::response(references)).await;
                }
                info!(
                    session_id = %request.session_id,
                    answer_chars = answer.len(),
                    "completed model answer"
                );
            }
            Err(err) => {
                warn!(
                    session_id = %request.session_id,
                    error = %err,
                    "response pipeline failed"
                );
                sink.send(err.to_part()).await;
            }
        }
    }

    async fn invoke(
        &self,
        request: LlmGatewayRequest,
        sink: &mut PartSink,
    ) -> Result<String, PipelineError> {
        let mut deltas = self.gateway.stream(request).await?;
        let mut answer = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            answer.push_str(&delta);
            sink.send(ResponsePart::response(delta)).await;
        }
        Ok(answer)
    }
}

/// Sender that tolerates a departed receiver.
struct PartSink {
    tx: mpsc::Sender<ResponsePart>,
    closed: bool,
}

impl PartSink {
    fn new(tx: mpsc::Sender<ResponsePart>) -> Self {
        Self { tx, closed: false }
    }

    async fn send(&mut self, part: ResponsePart) {
        if self.closed {
            return;
        }
        if self.tx.send(part).await.is_err() {
            debug!("response receiver dropped; continuing without delivery");
            self.closed = true;
        }
    }
}
