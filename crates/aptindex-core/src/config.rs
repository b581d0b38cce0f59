//! Process-level configuration.
//!
//! Loaded once at startup from a YAML file or from environment variables,
//! then validated before anything touches the network or the database.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::chain::SupportedChain;
use crate::error::IndexerError;
use crate::retry::RetryConfig;

/// Configuration for one indexer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub chain_id: u64,
    /// Transaction stream endpoint. Empty means the chain's default.
    #[serde(default)]
    pub stream_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_api_key: Option<String>,
    /// Genesis version of the super stream. Must stay fixed for a deployment.
    #[serde(deserialize_with = "underscore_number")]
    pub starting_version: u64,
    /// `sqlite:`, `postgres://`/`postgresql://` or `memory:`.
    pub db_connection_uri: String,
    /// Transactions per stream batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Stream polling interval once caught up with the ledger tip (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_batch_size() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"info,aptindex_core=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

impl IndexerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| IndexerError::Config(format!("invalid YAML config: {e}")))?;
        config.with_defaults()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Build the config from process environment variables.
    pub fn from_env() -> Result<Self, IndexerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup.
    ///
    /// Reads `CHAIN_ID`, `GENESIS_VERSION_<id>`, `API_KEY_<id>`, an optional
    /// `STREAM_ENDPOINT`, and either `DATABASE_URL` or the `DB_HOST`,
    /// `DB_PORT`, `DB_USERNAME`, `DB_PASSWORD`, `DB_NAME` parts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, IndexerError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| IndexerError::Config(format!("environment variable {key} is not set")))
        };

        let chain_id = parse_underscore_number(&required("CHAIN_ID")?)?;
        let chain = SupportedChain::from_id(chain_id)?;

        let starting_version =
            parse_underscore_number(&required(&format!("GENESIS_VERSION_{chain_id}"))?)?;

        let db_connection_uri = match lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            Some(url) => url,
            None => format!(
                "postgresql://{}:{}@{}:{}/{}",
                required("DB_USERNAME")?,
                required("DB_PASSWORD")?,
                required("DB_HOST")?,
                required("DB_PORT")?,
                required("DB_NAME")?,
            ),
        };

        let mut config = Self {
            chain_id,
            stream_endpoint: lookup("STREAM_ENDPOINT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| chain.default_stream_endpoint().to_string()),
            stream_api_key: lookup(&format!("API_KEY_{chain_id}")).filter(|v| !v.is_empty()),
            starting_version,
            db_connection_uri,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        };
        if let Some(level) = lookup("LOG_LEVEL").filter(|v| !v.is_empty()) {
            config.log.level = level;
        }
        if let Some(size) = lookup("BATCH_SIZE").filter(|v| !v.is_empty()) {
            config.batch_size = parse_underscore_number(&size)?;
        }
        Ok(config)
    }

    /// Fill the stream endpoint from the chain when it was left empty.
    fn with_defaults(mut self) -> Result<Self, IndexerError> {
        if self.stream_endpoint.is_empty() {
            let chain = SupportedChain::from_id(self.chain_id)?;
            self.stream_endpoint = chain.default_stream_endpoint().to_string();
        }
        Ok(self)
    }

    pub fn chain(&self) -> Result<SupportedChain, IndexerError> {
        SupportedChain::from_id(self.chain_id)
    }

    /// Check the config once before the pipeline starts.
    pub fn validate(&self) -> Result<(), IndexerError> {
        self.chain()?;
        if self.stream_endpoint.trim().is_empty() {
            return Err(IndexerError::Config("stream_endpoint is empty".into()));
        }
        if self.db_connection_uri.trim().is_empty() {
            return Err(IndexerError::Config("db_connection_uri is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be greater than 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IndexerError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse `"635_567_537"` style numbers.
pub fn parse_underscore_number(s: &str) -> Result<u64, IndexerError> {
    s.trim()
        .replace('_', "")
        .parse()
        .map_err(|_| IndexerError::Config(format!("invalid number format: {s}")))
}

fn underscore_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => parse_underscore_number(&s).map_err(serde::de::Error::custom),
    }
}
