use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub service: String,
    pub model: String,
    pub timeout_secs: u64,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub service: String,
    pub endpoint: String,
    pub model: String,
    pub access_token: Option<String>,
    pub timeout_secs: u64,
    pub batch_size: usize,
    /// Blend weight for the cross-encoder score in the final ranking.
    pub score_weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rrf_k: f32,
    pub dense_weight: f32,
    pub lexical_weight: f32,
    /// Bounded worker pool for multi-variant fan-out.
    pub pool_size: usize,
    pub task_timeout_secs: u64,
    pub num_variants: usize,
    pub max_tokens_limit: usize,
    pub relevance_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_history: usize,
    pub session_timeout_hours: i64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("DATA_DIR", "./storage")),
            embedding: EmbeddingConfig {
                service: env_or("EMBEDDING_SERVICE", "http://localhost:11434"),
                model: env_or("EMBEDDING_MODEL", "bge-m3:latest"),
                timeout_secs: env_parse("EMBEDDING_TIMEOUT_SECS", 60),
                cache_size: env_parse("EMBEDDING_CACHE_SIZE", 1000),
            },
            rerank: RerankConfig {
                service: env_or("RERANK_SERVICE", "http://localhost:11434"),
                endpoint: env_or("RERANK_ENDPOINT", "/api/rerank"),
                model: env_or("RERANK_MODEL", "bge-reranker-base"),
                access_token: std::env::var("RERANK_ACCESS_TOKEN").ok(),
                timeout_secs: env_parse("RERANK_TIMEOUT_SECS", 60),
                batch_size: 10,
                score_weight: 0.7,
            },
            llm: LlmConfig {
                api_base: env_or("LLM_API_BASE", "https://api.deepseek.com"),
                api_key: env_or("LLM_API_KEY", ""),
                model: env_or("LLM_MODEL", "deepseek-chat"),
                timeout_secs: env_parse("LLM_TIMEOUT_SECS", 60),
            },
            retrieval: RetrievalConfig {
                top_k: env_parse("RETRIEVAL_TOP_K", 10),
                rrf_k: 60.0,
                dense_weight: 0.6,
                lexical_weight: 0.4,
                pool_size: env_parse("RETRIEVAL_POOL_SIZE", 3),
                task_timeout_secs: 30,
                num_variants: 3,
                max_tokens_limit: env_parse("MAX_TOKENS_LIMIT", 4000),
                relevance_threshold: env_parse("RELEVANCE_THRESHOLD", 0.6),
            },
            memory: MemoryConfig {
                max_history: 10,
                session_timeout_hours: env_parse("SESSION_TIMEOUT_HOURS", 24),
            },
            log_level: env_or("LOG_LEVEL", "info"),
        }
    }

    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.retrieval.relevance_threshold) {
            return Err("retrieval.relevance_threshold must be in [0.0, 1.0]".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if self.retrieval.pool_size == 0 {
            return Err("retrieval.pool_size must be > 0".into());
        }
        if self.retrieval.max_tokens_limit == 0 {
            return Err("retrieval.max_tokens_limit must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.rerank.score_weight) {
            return Err("rerank.score_weight must be in [0.0, 1.0]".into());
        }
        if self.memory.session_timeout_hours <= 0 {
            return Err("memory.session_timeout_hours must be > 0".into());
        }
        Ok(())
    }

    pub fn vector_store_path(&self) -> PathBuf {
        self.data_dir.join("lance")
    }

    pub fn lexical_index_path(&self) -> PathBuf {
        self.data_dir.join("lexical")
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::from_env();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.max_tokens_limit, 4000);
        assert!((config.retrieval.relevance_threshold - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn bad_threshold_rejected() {
        let mut config = AppConfig::from_env();
        config.retrieval.relevance_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
