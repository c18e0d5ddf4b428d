//! TOML configuration.
//!
//! Every section is optional. A missing config file yields
//! [`Config::default`], so `folio` runs without any setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use folio_core::chunk::{ChunkConfig, ChunkStrategy};
use folio_core::search::{SearchMode, SearchParams};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

/// Chunking strategy and global overrides for the per-extension sizes.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default)]
    pub overlap_bytes: Option<usize>,
}

impl ChunkingConfig {
    /// Apply overrides on top of the per-extension default for `path`.
    pub fn for_path(&self, path: &Path) -> ChunkConfig {
        let mut cfg = folio_core::chunk::config_for_path(path);
        if let Some(max) = self.max_bytes {
            cfg.max_bytes = max;
        }
        if let Some(overlap) = self.overlap_bytes {
            cfg.overlap_bytes = overlap;
        }
        cfg
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            timeout_secs: default_embed_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extract_timeout_secs")]
    pub timeout_secs: u64,
    /// External OCR command. `{path}` is replaced by the image path; the
    /// command's stdout is the extracted text. Empty disables OCR.
    #[serde(default)]
    pub ocr_command: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_extract_timeout_secs(),
            ocr_command: Vec::new(),
        }
    }
}

fn default_extract_timeout_secs() -> u64 {
    60
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Mode used when a request does not name one.
    #[serde(default)]
    pub mode: SearchMode,
    /// Semantic weight in hybrid mode: `(1 - α) × keyword + α × semantic`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            candidate_multiplier: default_candidate_multiplier(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            mode: SearchMode::default(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_hybrid_alpha() -> f32 {
    0.6
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            candidate_multiplier: self.candidate_multiplier,
            max_chunks_per_doc: self.max_chunks_per_doc,
            hybrid_alpha: self.hybrid_alpha,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    2000
}

/// What happens when an indexing job is requested for a container that
/// already has one running.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPolicy {
    /// Fail the new request with `IndexingInProgress`.
    #[default]
    Reject,
    /// Cancel the running job and start the new one once it has stopped.
    Supersede,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexingConfig {
    #[serde(default)]
    pub job_policy: JobPolicy,
}

impl Config {
    pub fn registry_path(&self) -> PathBuf {
        self.data.dir.join("registry.json")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.data.dir.join("containers")
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        Config::default()
    };
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_bytes == Some(0) {
        anyhow::bail!("chunking.max_bytes must be > 0");
    }

    if config.scanner.max_file_bytes == 0 {
        anyhow::bail!("scanner.max_file_bytes must be > 0");
    }

    if config.retrieval.default_k == 0 {
        anyhow::bail!("retrieval.default_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if config.retrieval.max_chunks_per_doc == 0 {
        anyhow::bail!("retrieval.max_chunks_per_doc must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be between 0.0 and 1.0");
    }

    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be > 0");
    }
    if config.extraction.timeout_secs == 0 {
        anyhow::bail!("extraction.timeout_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        "fastembed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or fastembed.",
            other
        ),
    }

    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if let Some(first) = config.extraction.ocr_command.first() {
        if first.trim().is_empty() {
            anyhow::bail!("extraction.ocr_command must start with a program name");
        }
    }

    Ok(())
}
