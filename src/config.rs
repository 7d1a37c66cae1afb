//! Environment configuration
//!
//! Everything the engine needs from its environment: the chat endpoint, the
//! per-tier model identifiers, the store location, and the per-stage
//! concurrency knobs for deployments on stricter rate limits.

use crate::llm::TierModels;
use crate::pipeline::StageConcurrency;
use std::path::PathBuf;

/// Runtime configuration, usually read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenAI-compatible endpoint base URL (up to and including `/v1`).
    pub api_base_url: String,
    /// Bearer token for the endpoint.
    pub api_key: String,
    /// Model identifier per tier.
    pub models: TierModels,
    /// SQLite database location.
    pub db_path: PathBuf,
    /// Signing key for session tokens; consumed by the (external) auth layer.
    pub session_signing_key: Option<String>,
    /// Fan-out widths per stage.
    pub concurrency: StageConcurrency,
}

impl Config {
    /// Read configuration from `ALEMBIC_*` environment variables, with
    /// defaults for everything except the API key.
    pub fn from_env() -> Self {
        let models = TierModels {
            extraction: var_or("ALEMBIC_MODEL_EXTRACTION", "gpt-4o-mini"),
            filtering: var_or("ALEMBIC_MODEL_FILTERING", "gpt-4o-mini"),
            reasoning: var_or("ALEMBIC_MODEL_REASONING", "gpt-4o"),
        };
        let concurrency = StageConcurrency {
            chunks: var_parsed("ALEMBIC_CHUNK_CONCURRENCY", 5),
            filter_batches: var_parsed("ALEMBIC_FILTER_CONCURRENCY", 5),
            chapters: var_parsed("ALEMBIC_CHAPTER_CONCURRENCY", 3),
        };
        Self {
            api_base_url: var_or("ALEMBIC_API_BASE_URL", "https://api.openai.com/v1"),
            api_key: var_or("ALEMBIC_API_KEY", ""),
            models,
            db_path: std::env::var("ALEMBIC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            session_signing_key: std::env::var("ALEMBIC_SESSION_KEY").ok(),
            concurrency,
        }
    }

    /// Override the database path (CLI `--db`).
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn var_parsed(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alembic")
        .join("alembic.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        // Serialized access to the environment is not needed here: we only
        // check unset variables fall back.
        let config = Config::from_env();
        assert!(config.api_base_url.ends_with("/v1"));
        assert_eq!(config.concurrency.chunks, 5);
        assert_eq!(config.concurrency.chapters, 3);
        assert!(config.db_path.to_string_lossy().contains("alembic"));
    }
}
