use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::{
    ConversationMemory, DurableConversationMemory, DurableKv, LocalConversationMemory,
    MemoryError, RedisKv,
};
use crate::config::{MemorySettings, RedisSettings};

/// Hands out per-session memory handles.
///
/// The durable backend is used whenever it was connected at start-up. The
/// process-local map only sees sessions served while no durable handle could
/// be built, so it is additive and never shadows durable history.
pub struct MemoryStore {
    settings: MemorySettings,
    durable: Option<Arc<dyn DurableKv>>,
    local: DashMap<String, Arc<LocalConversationMemory>>,
}

impl MemoryStore {
    pub fn new(settings: MemorySettings, durable: Option<Arc<dyn DurableKv>>) -> Self {
        Self {
            settings,
            durable,
            local: DashMap::new(),
        }
    }

    pub fn local_only(settings: MemorySettings) -> Self {
        Self::new(settings, None)
    }

    /// Connects to Redis when it is enabled. A failed connection leaves the
    /// store on the local backend for the lifetime of the process.
    pub async fn connect(settings: MemorySettings, redis: &RedisSettings) -> Self {
        if !redis.enabled {
            info!("durable conversation memory disabled; using local memory");
            return Self::local_only(settings);
        }

        let redis_url = match redis.connection_url() {
            Ok(redis_url) => redis_url,
            Err(err) => {
                warn!(error = %err, "invalid redis settings; falling back to local memory");
                return Self::local_only(settings);
            }
        };

        match RedisKv::connect(&redis_url).await {
            Ok(kv) => {
                info!(
                    host = %redis.host,
                    port = redis.port,
                    db = redis.db,
                    "connected durable conversation memory"
                );
                Self::new(settings, Some(Arc::new(kv)))
            }
            Err(err) => {
                warn!(error = %err, "redis unavailable; falling back to local memory");
                Self::local_only(settings)
            }
        }
    }

    pub fn durable_enabled(&self) -> bool {
        self.durable.is_some()
    }

    pub fn get_memory(&self, session_id: &str) -> Arc<dyn ConversationMemory> {
        if let Some(kv) = self.durable.as_ref() {
            match DurableConversationMemory::new(
                session_id,
                Arc::clone(kv),
                self.settings.max_history,
                self.settings.session_ttl_seconds,
            ) {
                Ok(memory) => return Arc::new(memory),
                Err(err) => warn!(
                    session_id = %session_id,
                    error = %err,
                    "failed to build durable memory; using local memory"
                ),
            }
        }

        self.local_memory(session_id)
    }

    /// Local sessions currently held in process.
    pub fn local_session_count(&self) -> usize {
        self.local.len()
    }

    pub async fn ping(&self) -> Result<(), MemoryError> {
        match self.durable.as_ref() {
            Some(kv) => kv.ping().await,
            None => Ok(()),
        }
    }

    fn local_memory(&self, session_id: &str) -> Arc<dyn ConversationMemory> {
        let memory: Arc<LocalConversationMemory> = self
            .local
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(LocalConversationMemory::bounded(
                    session_id,
                    self.settings.max_history,
                ))
            })
            .clone();
        memory
    }
}
