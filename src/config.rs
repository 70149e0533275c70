use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::llm;
use crate::normalize::{YearMonthMode, MAX_ROWS_PER_BATCH, TOKEN_BUDGET};

pub const DEFAULT_CONFIG_FILE: &str = "auction_ingest.toml";
pub const ENV_PREFIX: &str = "AUCTION";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSetting {
    pub url: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_llm_attempts")]
    pub llm_attempts: u32,
    #[serde(default = "default_max_rows")]
    pub max_rows_per_batch: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default)]
    pub year_month: YearMonthMode,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceSetting>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/auctions.sqlite")
}
fn default_base_url() -> String {
    llm::DEFAULT_BASE_URL.to_string()
}
fn default_model() -> String {
    llm::DEFAULT_MODEL.to_string()
}
fn default_http_timeout() -> u64 {
    60
}
fn default_llm_attempts() -> u32 {
    3
}
fn default_max_rows() -> usize {
    MAX_ROWS_PER_BATCH
}
fn default_token_budget() -> usize {
    TOKEN_BUDGET
}
fn default_refresh_interval() -> u64 {
    86_400
}

impl Settings {
    /// Optional TOML file, overridden by `AUCTION_*` environment variables.
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("load configuration")?
            .try_deserialize()
            .context("parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path is empty");
        }
        if self.http_timeout_secs == 0 {
            bail!("http_timeout_secs must be positive");
        }
        if self.llm_attempts == 0 {
            bail!("llm_attempts must be positive");
        }
        if self.max_rows_per_batch == 0 {
            bail!("max_rows_per_batch must be positive");
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be positive");
        }
        Ok(())
    }

    /// Only commands that talk to the model need a key.
    pub fn api_key(&self) -> Result<&str> {
        let key = self.openai_api_key.trim();
        if key.is_empty() {
            bail!("openai_api_key is not set (AUCTION_OPENAI_API_KEY)");
        }
        Ok(key)
    }
}
