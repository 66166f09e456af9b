pub mod cache;
pub mod config;
mod config_env;
pub mod institutions;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod special_query;
