use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::source::PopularityRequest;
use crate::staleness::MIN_RUN_HOUR;
use crate::store::{CacheTables, DEFAULT_CACHE_TABLE, DEFAULT_CATALOG_TABLE};

pub const DEFAULT_USER_AGENT: &str = "wikipop/0.1";
pub const DEFAULT_LANG: &str = "en";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikipopConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SourceSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    pub max_records: Option<usize>,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            api_url: None,
            user_agent: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_records: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub lang: Option<String>,
    pub table: Option<String>,
    pub catalog_table: Option<String>,
    pub min_run_hour: Option<u32>,
}

impl WikipopConfig {
    /// env WIKIPOP_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        env_override("WIKIPOP_API_URL").or_else(|| self.source.api_url.clone())
    }

    /// env WIKIPOP_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKIPOP_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// env WIKIPOP_LANG > config > DEFAULT_LANG.
    pub fn lang(&self) -> String {
        env_override("WIKIPOP_LANG")
            .or_else(|| self.cache.lang.clone())
            .unwrap_or_else(|| DEFAULT_LANG.to_string())
    }

    /// env WIKIPOP_TABLE > config > DEFAULT_CACHE_TABLE.
    pub fn table(&self) -> String {
        env_override("WIKIPOP_TABLE")
            .or_else(|| self.cache.table.clone())
            .unwrap_or_else(|| DEFAULT_CACHE_TABLE.to_string())
    }

    pub fn catalog_table(&self) -> String {
        self.cache
            .catalog_table
            .clone()
            .unwrap_or_else(|| DEFAULT_CATALOG_TABLE.to_string())
    }

    pub fn min_run_hour(&self) -> Result<u32> {
        let hour = self.cache.min_run_hour.unwrap_or(MIN_RUN_HOUR);
        if hour > 23 {
            bail!("[cache].min_run_hour must be between 0 and 23 (got {hour})");
        }
        Ok(hour)
    }

    pub fn tables(&self) -> Result<CacheTables> {
        CacheTables::new(&self.table(), &self.catalog_table())
    }

    pub fn popularity_request(&self) -> PopularityRequest {
        PopularityRequest {
            lang: self.lang(),
            max_records: self.source.max_records,
        }
    }
}

/// Load and parse a WikipopConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WikipopConfig> {
    if !config_path.exists() {
        return Ok(WikipopConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WikipopConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}
