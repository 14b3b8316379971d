//! Engine configuration.
//!
//! Figment merges the built-in defaults, an optional TOML file and `KB_*`
//! environment variables (nested keys separated by `__`, for example
//! `KB_RETRIEVAL__MIN_CANDIDATES=20`).
use crate::artifact::ArtifactPaths;
use crate::chunking::ChunkingConfig;
use crate::error::ConfigError;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "KB_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    /// Hashed character n-grams; offline and deterministic.
    Ngram,
    Fastembed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerankerBackend {
    Lexical,
    Fastembed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub encoder: EncoderBackend,
    pub reranker: RerankerBackend,
    pub ngram_dimensions: usize,
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderBackend::Ngram,
            reranker: RerankerBackend::Lexical,
            ngram_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Coarse candidates requested per final result.
    pub candidate_multiplier: usize,
    pub min_candidates: usize,
    /// Characters of each candidate the reranker sees.
    pub rerank_max_chars: usize,
    /// Characters of each chunk emitted into the assembled context.
    pub context_max_chars: usize,
    pub rerank_max_batch: usize,
    pub rerank_timeout_ms: u64,
    /// Candidates must score strictly above this after reranking.
    pub relevance_floor: Option<f32>,
    pub embed_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 4,
            min_candidates: 10,
            rerank_max_chars: 512,
            context_max_chars: 700,
            rerank_max_batch: 32,
            rerank_timeout_ms: 2_000,
            relevance_floor: Some(0.0),
            embed_batch_size: 32,
        }
    }
}

impl RetrievalConfig {
    /// Number of coarse candidates fetched for a final target of `k`.
    pub fn candidate_count(&self, k: usize) -> usize {
        if k == 0 {
            return 0;
        }
        k.saturating_mul(self.candidate_multiplier).max(self.min_candidates).max(k)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub corpus_dir: PathBuf,
    pub index_dir: PathBuf,
    pub index_name: String,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub models: ModelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("data"),
            index_dir: PathBuf::from("data/index"),
            index_name: "knowledge".to_string(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            models: ModelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = file {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: EngineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking
            .validate()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        if self.index_name.trim().is_empty() || self.index_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "index_name must be a plain file stem, got `{}`",
                self.index_name
            )));
        }
        if self.retrieval.rerank_max_chars == 0 || self.retrieval.context_max_chars == 0 {
            return Err(ConfigError::Invalid(
                "truncation budgets must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.rerank_max_batch == 0 || self.retrieval.embed_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.models.ngram_dimensions == 0 {
            return Err(ConfigError::Invalid(
                "ngram_dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.index_dir, &self.index_name)
    }
}
