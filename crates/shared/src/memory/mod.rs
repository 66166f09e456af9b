//! Session-scoped conversation history.
//!
//! Two interchangeable backends implement [`ConversationMemory`]: a durable
//! key-value store with per-session expiry and a process-local fallback.
//! [`MemoryStore::get_memory`] picks one per call.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::models::Interaction;

mod durable;
mod local;
mod store;

pub use durable::{DurableConversationMemory, DurableKv, InMemoryKv, RedisKv, conversation_key};
pub use local::LocalConversationMemory;
pub use store::MemoryStore;

pub const CONTEXT_HEADER: &str = "Previous conversation context:\n";

pub type MemoryFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("max history must be greater than zero")]
    InvalidMaxHistory,
    #[error("durable store request failed: {0}")]
    Store(String),
    #[error("stored history is malformed: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for MemoryError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Bounded history for one session.
///
/// Implementations never surface backend failures: reads degrade to an empty
/// history and writes are logged and dropped.
pub trait ConversationMemory: Send + Sync {
    fn session_id(&self) -> &str;

    /// Appends a turn and evicts the oldest entries beyond the history bound.
    fn add_interaction<'a>(&'a self, question: &'a str, answer: &'a str) -> MemoryFuture<'a, ()>;

    /// Stored turns, oldest first.
    fn history<'a>(&'a self) -> MemoryFuture<'a, Vec<Interaction>>;

    fn clear<'a>(&'a self) -> MemoryFuture<'a, ()>;

    fn get_context<'a>(&'a self) -> MemoryFuture<'a, String> {
        Box::pin(async move { format_context(&self.history().await) })
    }

    fn get_previous_question<'a>(&'a self) -> MemoryFuture<'a, Option<String>> {
        Box::pin(async move {
            self.history()
                .await
                .pop()
                .map(|interaction| interaction.question)
        })
    }
}

pub fn format_context(history: &[Interaction]) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut context = String::from(CONTEXT_HEADER);
    for interaction in history {
        context.push_str("Q: ");
        context.push_str(&interaction.question);
        context.push_str("\nA: ");
        context.push_str(&interaction.answer);
        context.push_str("\n\n");
    }
    context
}

pub(crate) fn trim_history(mut history: Vec<Interaction>, max_history: usize) -> Vec<Interaction> {
    if history.len() > max_history {
        history = history.split_off(history.len() - max_history);
    }
    history
}
