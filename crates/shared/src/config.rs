use std::collections::HashMap;

use thiserror::Error;
use url::Url;

use crate::config_env::{
    optional_trimmed_env, parse_bool_env, parse_f64_env, parse_u16_env, parse_u32_env,
    parse_u64_env, parse_usize_env, require_env,
};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_CHAT_COMPLETIONS_URL: &str = "http://127.0.0.1:4000/v1/chat/completions";
const DEFAULT_MODEL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MODEL_MAX_RETRIES: u32 = 2;
const DEFAULT_MODEL_RETRY_BASE_BACKOFF_MS: u64 = 250;
const DEFAULT_KB_RETRIEVE_URL: &str = "http://127.0.0.1:4001/retrieve";
const DEFAULT_KB_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRIEVAL_NUM_RESULTS: usize = 5;
const DEFAULT_RETRIEVAL_MIN_SCORE: f64 = 0.5;
const DEFAULT_INSTITUTION_ID: &str = "lpu";
const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_MAX_HISTORY: usize = 5;
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;
const DEFAULT_CACHE_EXPIRY_SECONDS: u64 = 3_600;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1_024;

/// Process-wide settings, built once at start-up and shared read-only.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub knowledge_base: KnowledgeBaseSettings,
    pub retrieval: RetrievalSettings,
    pub redis: RedisSettings,
    pub memory: MemorySettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_name: String,
    pub model_arn: Option<String>,
    pub chat_completions_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
}

impl ModelSettings {
    /// Identifier sent to the provider. A configured ARN wins over the bare model name.
    pub fn model_id(&self) -> &str {
        self.model_arn.as_deref().unwrap_or(&self.model_name)
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeBaseSettings {
    pub retrieve_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub default_kb_id: Option<String>,
    /// Institution id -> knowledge base id.
    pub institution_kb_ids: HashMap<String, String>,
    pub default_institution_id: String,
}

impl KnowledgeBaseSettings {
    pub fn kb_id_for(&self, institution_id: &str) -> Option<&str> {
        self.institution_kb_ids
            .get(institution_id)
            .map(String::as_str)
            .or(self.default_kb_id.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub num_results: usize,
    pub min_score: f64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            num_results: DEFAULT_RETRIEVAL_NUM_RESULTS,
            min_score: DEFAULT_RETRIEVAL_MIN_SCORE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            password: None,
            db: 0,
        }
    }
}

impl RedisSettings {
    /// Explicit `REDIS_URL`, or a URL assembled from the parts with the
    /// password percent-encoded.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = self.url.as_deref() {
            return Ok(url.to_string());
        }

        let invalid = || {
            ConfigError::InvalidConfiguration(format!(
                "REDIS_HOST {} does not form a valid redis url",
                self.host
            ))
        };
        let mut url = Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))
            .map_err(|_| invalid())?;
        if let Some(password) = self.password.as_deref() {
            url.set_password(Some(password)).map_err(|_| invalid())?;
        }
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub max_history: usize,
    pub session_ttl_seconds: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub expiry_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_seconds: DEFAULT_CACHE_EXPIRY_SECONDS,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid number in env var {0}")]
    ParseFloat(String),
    #[error("invalid boolean in env var {0}")]
    ParseBool(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            server: ServerSettings {
                bind_addr: bind_addr_from_env()?,
            },
            model: ModelSettings {
                model_name: require_env("MODEL_NAME")?,
                model_arn: optional_trimmed_env("MODEL_ARN"),
                chat_completions_url: optional_trimmed_env("MODEL_CHAT_COMPLETIONS_URL")
                    .unwrap_or_else(|| DEFAULT_CHAT_COMPLETIONS_URL.to_string()),
                api_key: optional_trimmed_env("MODEL_API_KEY"),
                timeout_ms: parse_u64_env("MODEL_TIMEOUT_MS", DEFAULT_MODEL_TIMEOUT_MS)?,
                max_retries: parse_u32_env("MODEL_MAX_RETRIES", DEFAULT_MODEL_MAX_RETRIES)?,
                retry_base_backoff_ms: parse_u64_env(
                    "MODEL_RETRY_BASE_BACKOFF_MS",
                    DEFAULT_MODEL_RETRY_BASE_BACKOFF_MS,
                )?,
            },
            knowledge_base: knowledge_base_from_env()?,
            retrieval: RetrievalSettings {
                num_results: parse_usize_env(
                    "RETRIEVAL_NUM_RESULTS",
                    DEFAULT_RETRIEVAL_NUM_RESULTS,
                )?,
                min_score: parse_f64_env("RETRIEVAL_MIN_SCORE", DEFAULT_RETRIEVAL_MIN_SCORE)?,
            },
            redis: RedisSettings {
                enabled: parse_bool_env("REDIS_ENABLED", false)?,
                url: optional_trimmed_env("REDIS_URL"),
                host: optional_trimmed_env("REDIS_HOST")
                    .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
                port: parse_u16_env("REDIS_PORT", DEFAULT_REDIS_PORT)?,
                password: optional_trimmed_env("REDIS_PASSWORD"),
                db: parse_u32_env("REDIS_DB", 0)?,
            },
            memory: MemorySettings {
                max_history: parse_usize_env("MEMORY_MAX_HISTORY", DEFAULT_MAX_HISTORY)?,
                session_ttl_seconds: parse_u64_env(
                    "MEMORY_SESSION_TTL",
                    DEFAULT_SESSION_TTL_SECONDS,
                )?,
            },
            cache: CacheSettings {
                enabled: parse_bool_env("CACHE_ENABLED", true)?,
                expiry_seconds: parse_u64_env(
                    "CACHE_EXPIRY_SECONDS",
                    DEFAULT_CACHE_EXPIRY_SECONDS,
                )?,
                max_entries: parse_usize_env("CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES)?,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.model.chat_completions_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidConfiguration(
                "MODEL_CHAT_COMPLETIONS_URL must start with http:// or https://".to_string(),
            ));
        }
        if self.memory.max_history == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "MEMORY_MAX_HISTORY must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.num_results == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "RETRIEVAL_NUM_RESULTS must be greater than zero".to_string(),
            ));
        }
        if self.redis.enabled {
            self.redis.connection_url()?;
        }
        Ok(())
    }
}

fn bind_addr_from_env() -> Result<String, ConfigError> {
    if let Some(bind_addr) = optional_trimmed_env("API_BIND_ADDR") {
        return Ok(bind_addr);
    }

    match optional_trimmed_env("PORT") {
        Some(_) => Ok(format!("0.0.0.0:{}", parse_u16_env("PORT", 8000)?)),
        None => Ok(DEFAULT_BIND_ADDR.to_string()),
    }
}

fn knowledge_base_from_env() -> Result<KnowledgeBaseSettings, ConfigError> {
    let default_kb_id = optional_trimmed_env("KB_ID");

    let mut institution_kb_ids = HashMap::new();
    if let Some(lpu_kb_id) = optional_trimmed_env("LPU_KB_ID").or_else(|| default_kb_id.clone())
    {
        institution_kb_ids.insert("lpu".to_string(), lpu_kb_id);
    }
    if let Some(amity_kb_id) = optional_trimmed_env("AMITY_KB_ID") {
        institution_kb_ids.insert("amity".to_string(), amity_kb_id);
    }

    Ok(KnowledgeBaseSettings {
        retrieve_url: optional_trimmed_env("KB_RETRIEVE_URL")
            .unwrap_or_else(|| DEFAULT_KB_RETRIEVE_URL.to_string()),
        api_key: optional_trimmed_env("KB_API_KEY"),
        timeout_ms: parse_u64_env("KB_TIMEOUT_MS", DEFAULT_KB_TIMEOUT_MS)?,
        default_kb_id,
        institution_kb_ids,
        default_institution_id: optional_trimmed_env("DEFAULT_INSTITUTION_ID")
            .map(|id| id.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_INSTITUTION_ID.to_string()),
    })
}
