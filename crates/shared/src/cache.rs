use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::CacheSettings;
use crate::special_query::normalize_query;

#[derive(Debug, Clone)]
struct CachedAnswer {
    answer: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedAnswer>,
    order: VecDeque<String>,
}

/// Process-local answers keyed by normalized query and session.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    settings: CacheSettings,
    state: Arc<Mutex<CacheState>>,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled && self.settings.max_entries > 0
    }

    pub fn check(&self, query: &str, session_id: &str) -> Option<String> {
        self.check_at(query, session_id, Instant::now())
    }

    pub fn store(&self, query: &str, session_id: &str, answer: &str) {
        self.store_at(query, session_id, answer, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_at(&self, query: &str, session_id: &str, now: Instant) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        let key = cache_key(query, session_id);
        let mut state = self.lock_state();
        match state.entries.get(&key) {
            Some(entry) if now < entry.expires_at => Some(entry.answer.clone()),
            Some(_) => {
                state.entries.remove(&key);
                state.order.retain(|cached_key| cached_key != &key);
                None
            }
            None => None,
        }
    }

    fn store_at(&self, query: &str, session_id: &str, answer: &str, now: Instant) {
        if !self.is_enabled() {
            return;
        }

        let key = cache_key(query, session_id);
        let expires_at = now + Duration::from_secs(self.settings.expiry_seconds);
        let mut state = self.lock_state();

        state.entries.retain(|_, entry| now < entry.expires_at);
        let CacheState { entries, order } = &mut *state;
        order.retain(|cached_key| cached_key != &key && entries.contains_key(cached_key));

        entries.insert(
            key.clone(),
            CachedAnswer {
                answer: answer.to_string(),
                expires_at,
            },
        );
        order.push_back(key);

        while entries.len() > self.settings.max_entries {
            let Some(oldest_key) = order.pop_front() else {
                break;
            };
            entries.remove(&oldest_key);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn cache_key(query: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(normalize_query(query).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
}
