#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::embeddings::{ChunkingConfig, EmbeddingConfig};
use crate::guard::GuardConfig;
use crate::pipeline::PipelineConfig;
use crate::rerank::RerankConfig;
use crate::retrieval::RetrievalConfig;

/// Environment variable that overrides the configuration directory
pub const CONFIG_DIR_ENV: &str = "SAFE_RECALL_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "safe-recall";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// When false every embedding comes from the local fallback
    pub enabled: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid request timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid target chunk size: {0} (must be between 64 and 8192)")]
    InvalidTargetChunkSize(usize),
    #[error("Overlap ({0}) must be smaller than the target chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("Target chunk size ({0}) must be greater than min chunk size ({1})")]
    TargetChunkSizeTooSmall(usize, usize),
    #[error("Invalid {name}: {value} (must be between 0 and 1)")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("Invalid {0}: must be greater than 0")]
    ZeroValue(&'static str),
    #[error("Invalid collection name: cannot be empty")]
    EmptyCollection,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Resolve the configuration directory.
    ///
    /// An explicit directory wins, then `SAFE_RECALL_CONFIG_DIR`, then the
    /// platform config directory.
    #[inline]
    pub fn config_dir(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        resolve_config_dir(explicit, std::env::var_os(CONFIG_DIR_ENV))
    }

    /// Load `config.toml` from `config_dir`, falling back to defaults when the
    /// file does not exist
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.validate_chunking_config()?;
        self.validate_retrieval_config()?;
        self.validate_rerank_config()?;
        self.validate_guard_config()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(64..=8192).contains(&config.target_chunk_chars) {
            return Err(ConfigError::InvalidTargetChunkSize(
                config.target_chunk_chars,
            ));
        }

        if config.overlap_chars >= config.target_chunk_chars {
            return Err(ConfigError::OverlapTooLarge(
                config.overlap_chars,
                config.target_chunk_chars,
            ));
        }

        if config.target_chunk_chars <= config.min_chunk_chars {
            return Err(ConfigError::TargetChunkSizeTooSmall(
                config.target_chunk_chars,
                config.min_chunk_chars,
            ));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if config.collection.trim().is_empty() {
            return Err(ConfigError::EmptyCollection);
        }
        if config.max_results == 0 {
            return Err(ConfigError::ZeroValue("max_results"));
        }
        unit_range("relevance_floor", config.relevance_floor)?;
        unit_range("semantic_weight", config.semantic_weight)?;
        unit_range("keyword_weight", config.keyword_weight)?;
        Ok(())
    }

    fn validate_rerank_config(&self) -> Result<(), ConfigError> {
        let config = &self.rerank;

        if config.top_k == 0 {
            return Err(ConfigError::ZeroValue("top_k"));
        }
        if config.half_life_hours <= 0.0 {
            return Err(ConfigError::ZeroValue("half_life_hours"));
        }
        unit_range("score_threshold", config.score_threshold)?;
        unit_range("context_decay", config.context_decay)?;
        unit_range("contextual_boost_threshold", config.contextual_boost_threshold)?;
        unit_range("default_importance", config.default_importance)?;

        let weights = &config.weights;
        unit_range("weights.semantic", weights.semantic)?;
        unit_range("weights.lexical", weights.lexical)?;
        unit_range("weights.recency", weights.recency)?;
        unit_range("weights.importance", weights.importance)?;
        unit_range("weights.contextual", weights.contextual)?;
        Ok(())
    }

    fn validate_guard_config(&self) -> Result<(), ConfigError> {
        let config = &self.guard;

        if config.knowledge_collection.trim().is_empty() {
            return Err(ConfigError::EmptyCollection);
        }
        unit_range(
            "claim_similarity_threshold",
            config.claim_similarity_threshold,
        )
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(64..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.timeout_secs));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.ollama_url()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn set_embedding_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(64..=4096).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.embedding_dimension = dimension;
        Ok(())
    }
}

fn resolve_config_dir(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Some(value) = env_value {
        if !value.is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(ConfigError::DirectoryError)
}

fn unit_range(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}
