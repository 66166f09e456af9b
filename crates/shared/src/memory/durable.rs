use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{ConversationMemory, MemoryError, MemoryFuture, trim_history};
use crate::models::Interaction;

const CONVERSATION_KEY_PREFIX: &str = "conversation";

pub fn conversation_key(session_id: &str) -> String {
    format!("{CONVERSATION_KEY_PREFIX}:{session_id}")
}

/// Minimal key-value surface the durable backend needs.
pub trait DurableKv: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<Option<String>, MemoryError>>;

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl_seconds: u64,
    ) -> MemoryFuture<'a, Result<(), MemoryError>>;

    fn delete<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<(), MemoryError>>;

    fn ping<'a>(&'a self) -> MemoryFuture<'a, Result<(), MemoryError>>;
}

#[derive(Clone)]
pub struct RedisKv {
    connection: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self, MemoryError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        let kv = Self { connection };
        kv.ping_once().await?;
        Ok(kv)
    }

    async fn ping_once(&self) -> Result<(), MemoryError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|err| MemoryError::Store(format!("failed to connect to redis: {err}")))?;
        Ok(())
    }
}

impl DurableKv for RedisKv {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<Option<String>, MemoryError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value: Option<String> = connection.get(key).await?;
            Ok(value)
        })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl_seconds: u64,
    ) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let _: () = connection.set_ex(key, value, ttl_seconds).await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let _: i64 = connection.del(key).await?;
            Ok(())
        })
    }

    fn ping<'a>(&'a self) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(self.ping_once())
    }
}

/// Process-local [`DurableKv`]. Expiry is recorded but not enforced.
#[derive(Clone, Default)]
pub struct InMemoryKv {
    entries: Arc<Mutex<HashMap<String, (String, u64)>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl_seconds(&self, key: &str) -> Option<u64> {
        self.lock_entries().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock_entries().get(key).map(|(value, _)| value.clone())
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.lock_entries()
            .insert(key.to_string(), (value.to_string(), 0));
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, u64)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DurableKv for InMemoryKv {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<Option<String>, MemoryError>> {
        Box::pin(async move { Ok(self.raw(key)) })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl_seconds: u64,
    ) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            self.lock_entries()
                .insert(key.to_string(), (value, ttl_seconds));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            self.lock_entries().remove(key);
            Ok(())
        })
    }

    fn ping<'a>(&'a self) -> MemoryFuture<'a, Result<(), MemoryError>> {
        Box::pin(async { Ok(()) })
    }
}

/// History stored as a JSON array under `conversation:{session_id}`.
///
/// Each write replaces the whole array and refreshes the expiry. Concurrent
/// writers for the same session are last-writer-wins.
pub struct DurableConversationMemory {
    session_id: String,
    key: String,
    kv: Arc<dyn DurableKv>,
    max_history: usize,
    ttl_seconds: u64,
}

impl DurableConversationMemory {
    pub fn new(
        session_id: &str,
        kv: Arc<dyn DurableKv>,
        max_history: usize,
        ttl_seconds: u64,
    ) -> Result<Self, MemoryError> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::EmptySessionId);
        }
        if max_history == 0 {
            return Err(MemoryError::InvalidMaxHistory);
        }

        Ok(Self {
            session_id: session_id.to_string(),
            key: conversation_key(session_id),
            kv,
            max_history,
            ttl_seconds,
        })
    }

    async fn load(&self) -> Result<Vec<Interaction>, MemoryError> {
        let Some(raw) = self.kv.get(&self.key).await? else {
            return Ok(Vec::new());
        };

        serde_json::from_str::<Vec<Interaction>>(&raw)
            .map_err(|err| MemoryError::Malformed(err.to_string()))
    }

    async fn load_or_empty(&self) -> Vec<Interaction> {
        match self.load().await {
            Ok(history) => history,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "failed to read conversation history; treating as empty"
                );
                Vec::new()
            }
        }
    }

    async fn store(&self, history: &[Interaction]) -> Result<(), MemoryError> {
        let payload =
            serde_json::to_string(history).map_err(|err| MemoryError::Malformed(err.to_string()))?;
        self.kv
            .set_with_expiry(&self.key, payload, self.ttl_seconds)
            .await
    }
}

impl ConversationMemory for DurableConversationMemory {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn add_interaction<'a>(&'a self, question: &'a str, answer: &'a str) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            let mut history = match self.load().await {
                Ok(history) => history,
                // Unparseable payloads are replaced.
                Err(MemoryError::Malformed(err)) => {
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        "replacing malformed conversation history"
                    );
                    Vec::new()
                }
                Err(err) => {
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        "failed to read conversation history; turn not stored"
                    );
                    return;
                }
            };
            history.push(Interaction::now(question, answer));
            let history = trim_history(history, self.max_history);

            match self.store(&history).await {
                Ok(()) => debug!(
                    session_id = %self.session_id,
                    turns = history.len(),
                    "stored conversation turn"
                ),
                Err(err) => warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "failed to store conversation turn"
                ),
            }
        })
    }

    fn history<'a>(&'a self) -> MemoryFuture<'a, Vec<Interaction>> {
        Box::pin(self.load_or_empty())
    }

    fn clear<'a>(&'a self) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.kv.delete(&self.key).await {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "failed to clear conversation history"
                );
            }
        })
    }
}
