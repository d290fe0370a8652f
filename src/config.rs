use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_opportunities_url")]
    pub opportunities_url: String,
    /// Download URL for a notice's attachment bundle; `{notice_id}` is substituted.
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    #[serde(default = "default_hierarchy_url")]
    pub hierarchy_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Largest attachment bundle accepted from the download endpoint.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            opportunities_url: default_opportunities_url(),
            archive_url: default_archive_url(),
            hierarchy_url: default_hierarchy_url(),
            api_key_env: default_api_key_env(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_archive_bytes: default_max_archive_bytes(),
        }
    }
}

fn default_opportunities_url() -> String {
    "https://api.sam.gov/opportunities/v2/search".to_string()
}
fn default_archive_url() -> String {
    "https://api.sam.gov/prod/opportunities/v3/opportunities/{notice_id}/resources/download/zip"
        .to_string()
}
fn default_hierarchy_url() -> String {
    "https://api.sam.gov/prod/federalorganizations/v1/orgs".to_string()
}
fn default_api_key_env() -> String {
    "SAM_API_KEY".to_string()
}
fn default_page_size() -> u32 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_max_archive_bytes() -> u64 {
    1024 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// Qualifying NAICS codes. Shorter codes qualify every code they prefix.
    #[serde(default = "default_naics")]
    pub naics: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            naics: default_naics(),
        }
    }
}

fn default_naics() -> Vec<String> {
    [
        "334111", "334118", "3343", "33451", "334516", "334614", "5112", "518", "54169",
        "54121", "5415", "61142",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Maximum decompressed bytes accepted for a single archive entry.
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,
    /// Parent directory for per-solicitation working areas. System temp dir if unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: default_max_entry_bytes(),
            work_dir: None,
        }
    }
}

fn default_max_entry_bytes() -> u64 {
    200 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
    /// Documents processed concurrently within one solicitation.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_extraction_timeout_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_extraction_timeout_secs() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Solicitations processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Dispatches a pending notice gets before it is dropped from the queue.
    #[serde(default = "default_max_pending_attempts")]
    pub max_pending_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            run_timeout_secs: default_run_timeout_secs(),
            max_pending_attempts: default_max_pending_attempts(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_run_timeout_secs() -> u64 {
    50 * 60
}
fn default_max_pending_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    /// Validated-but-untrained predictions that make retraining due.
    #[serde(default = "default_revalidation_threshold")]
    pub revalidation_threshold: i64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            revalidation_threshold: default_revalidation_threshold(),
        }
    }
}

fn default_revalidation_threshold() -> i64 {
    1000
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .with_context(|| format!("{} environment variable not set", self.api_key_env))
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.upstream.page_size == 0 {
        anyhow::bail!("upstream.page_size must be > 0");
    }

    if config.upstream.max_archive_bytes == 0 {
        anyhow::bail!("upstream.max_archive_bytes must be > 0");
    }

    if !config.upstream.archive_url.contains("{notice_id}") {
        anyhow::bail!("upstream.archive_url must contain a {{notice_id}} placeholder");
    }

    if config.filter.naics.is_empty() {
        anyhow::bail!("filter.naics must list at least one code");
    }

    if let Some(bad) = config
        .filter
        .naics
        .iter()
        .find(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_digit()))
    {
        anyhow::bail!("filter.naics contains an invalid code: '{}'", bad);
    }

    if config.extraction.timeout_secs == 0 {
        anyhow::bail!("extraction.timeout_secs must be > 0");
    }

    if config.extraction.max_concurrent == 0 {
        anyhow::bail!("extraction.max_concurrent must be > 0");
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }

    if config.pipeline.run_timeout_secs == 0 {
        anyhow::bail!("pipeline.run_timeout_secs must be > 0");
    }

    if config.pipeline.max_pending_attempts == 0 {
        anyhow::bail!("pipeline.max_pending_attempts must be > 0");
    }

    Ok(())
}
