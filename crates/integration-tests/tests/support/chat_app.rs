#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use api_server::http::{AppState, build_router};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::cache::ResponseCache;
use shared::config::{CacheSettings, KnowledgeBaseSettings, MemorySettings, RetrievalSettings};
use shared::memory::MemoryStore;
use shared::models::ChatMessage;
use shared::pipeline::ResponsePipeline;
use shared::retrieval::ContextRetriever;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::stubs::{ScriptedGateway, StaticKnowledgeBase};

pub type ChatSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_pipeline(gateway: ScriptedGateway, knowledge_base: StaticKnowledgeBase) -> ResponsePipeline {
    let retriever = ContextRetriever::new(
        Arc::new(knowledge_base),
        KnowledgeBaseSettings {
            retrieve_url: "http://127.0.0.1:1/retrieve".to_string(),
            api_key: None,
            timeout_ms: 1_000,
            default_kb_id: Some("kb-test".to_string()),
            institution_kb_ids: HashMap::new(),
            default_institution_id: "lpu".to_string(),
        },
        RetrievalSettings::default(),
    );

    ResponsePipeline::new(
        Arc::new(MemoryStore::local_only(MemorySettings::default())),
        ResponseCache::new(CacheSettings::default()),
        retriever,
        Arc::new(gateway),
        "lpu",
    )
}

pub fn test_router(gateway: ScriptedGateway) -> axum::Router {
    build_router(AppState {
        pipeline: test_pipeline(gateway, StaticKnowledgeBase::default()),
    })
}

/// The real router served on an ephemeral port.
pub struct TestChatServer {
    pub base_url: String,
    pub ws_url: String,
    pub pipeline: ResponsePipeline,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestChatServer {
    pub async fn start(gateway: ScriptedGateway) -> Self {
        Self::start_with(test_pipeline(gateway, StaticKnowledgeBase::default())).await
    }

    pub async fn start_with(pipeline: ResponsePipeline) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("chat server listener should bind");
        let bind_addr = listener
            .local_addr()
            .expect("chat server listener local address should exist");
        let app = build_router(AppState {
            pipeline: pipeline.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("chat server should run");
        });

        Self {
            base_url: format!("http://{bind_addr}"),
            ws_url: format!("ws://{bind_addr}/chat"),
            pipeline,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    pub async fn connect(&self) -> ChatSocket {
        let (socket, _) = connect_async(self.ws_url.as_str())
            .await
            .expect("websocket connect should succeed");
        socket
    }

    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for TestChatServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn send_frame(socket: &mut ChatSocket, frame: Value) {
    send_raw(socket, &frame.to_string()).await;
}

pub async fn send_raw(socket: &mut ChatSocket, raw: &str) {
    socket
        .send(Message::Text(raw.to_string().into()))
        .await
        .expect("websocket send should succeed");
}

/// Reads messages until the first one with `is_last`.
pub async fn read_turn(socket: &mut ChatSocket) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    loop {
        let message = next_message(socket).await;
        let is_last = message.is_last;
        messages.push(message);
        if is_last {
            return messages;
        }
    }
}

pub async fn next_message(socket: &mut ChatSocket) -> ChatMessage {
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("websocket message should arrive in time")
            .expect("websocket should stay open")
            .expect("websocket frame should be readable");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("outbound message should be json");
        }
    }
}

pub fn answer_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| message.content.as_str())
        .collect()
}
