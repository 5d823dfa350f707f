use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Search mode over the consumed index: `keyword`, `semantic`, or `hybrid`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: i64,
    /// Brand token used when ranking source citations (title/URL match).
    #[serde(default = "default_brand")]
    pub brand: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            hybrid_alpha: default_hybrid_alpha(),
            top_k: default_top_k(),
            fetch_k: default_fetch_k(),
            brand: default_brand(),
        }
    }
}

fn default_mode() -> String {
    "keyword".to_string()
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_top_k() -> usize {
    10
}
fn default_fetch_k() -> i64 {
    20
}
fn default_brand() -> String {
    "srmist".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Query-embedding provider for semantic/hybrid retrieval:
    /// `disabled` or `openai`. Stored chunk vectors come from the
    /// external ingestion pipeline either way.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_gen_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_retries: default_gen_retries(),
            timeout_secs: default_gen_timeout(),
            max_prompt_chars: default_max_prompt_chars(),
            temperature: default_temperature(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gen_retries() -> u32 {
    3
}
fn default_gen_timeout() -> u64 {
    60
}
fn default_max_prompt_chars() -> usize {
    30_000
}
fn default_temperature() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Free queries an anonymous session gets before email capture.
    #[serde(default = "default_free_query_limit")]
    pub free_query_limit: u32,
    /// Idle seconds before a session is evicted.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            free_query_limit: default_free_query_limit(),
            ttl_secs: default_session_ttl(),
        }
    }
}

fn default_free_query_limit() -> u32 {
    2
}
fn default_session_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UsageConfig {
    /// When false, email capture and query logs are not persisted.
    #[serde(default = "default_usage_enabled")]
    pub enabled: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: default_usage_enabled(),
        }
    }
}

fn default_usage_enabled() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate retrieval
    match config.retrieval.mode.as_str() {
        "keyword" | "semantic" | "hybrid" => {}
        other => anyhow::bail!(
            "Unknown retrieval mode: '{}'. Must be keyword, semantic, or hybrid.",
            other
        ),
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be > 0");
    }

    if config.retrieval.fetch_k < config.retrieval.top_k as i64 {
        anyhow::bail!("retrieval.fetch_k must be >= retrieval.top_k");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    // Semantic/hybrid modes need a query-embedding provider
    if config.retrieval.mode != "keyword" && !config.embedding.is_enabled() {
        anyhow::bail!(
            "retrieval.mode = '{}' requires [embedding] provider to be set",
            config.retrieval.mode
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    // Validate generation
    if config.generation.model.trim().is_empty() {
        anyhow::bail!("generation.model must not be empty");
    }

    if config.generation.max_prompt_chars < 1000 {
        anyhow::bail!("generation.max_prompt_chars must be >= 1000");
    }

    // Validate session gating
    if config.session.free_query_limit == 0 {
        anyhow::bail!("session.free_query_limit must be > 0");
    }

    if config.session.ttl_secs == 0 {
        anyhow::bail!("session.ttl_secs must be > 0");
    }

    Ok(config)
}
