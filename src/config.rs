//! Orchestrator configuration.
//!
//! Configuration is read from a YAML file. Every key is optional; missing keys
//! fall back to the defaults below, which are tuned for a handful of sources
//! processed by a slow external rewriter.
//!
//! ```yaml
//! max_concurrent_sources: 2
//! max_concurrent_articles: 3
//! max_retries: 3
//! retry_delays_secs: [60, 120, 300]
//! sources:
//!   - name: golf.com
//!     weight: 1.3
//!     index_url: https://golf.com/news/
//!     link_selector: "a[href*='/news/']"
//!     discovery_limit: 50
//! processor:
//!   command: ./rewrite_article
//!   args: ["--publish"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A news source the orchestrator discovers articles from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Priority weight; sources believed to yield more value use values > 1.0.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Page listing recent articles.
    #[serde(default)]
    pub index_url: Option<String>,
    /// CSS selector matching article links on the index page.
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    /// Maximum number of URLs taken from one discovery pass.
    #[serde(default = "default_discovery_limit")]
    pub discovery_limit: usize,
}

impl SourceConfig {
    pub fn named(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            index_url: None,
            link_selector: default_link_selector(),
            discovery_limit: default_discovery_limit(),
        }
    }
}

/// URL-path segment that marks higher-value content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMultiplier {
    pub segment: String,
    pub multiplier: f64,
}

/// External article processing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_processor_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_sources: usize,
    pub max_concurrent_articles: usize,
    /// Attempts after which a task is permanently failed.
    pub max_retries: u32,
    /// Progressive backoff tiers, indexed by `attempts - 1`.
    pub retry_delays_secs: Vec<u64>,
    /// Upper bound of random jitter added to each backoff delay.
    pub retry_jitter_ms: u64,
    pub resource_restart_interval_secs: u64,
    pub memory_threshold_mb: u64,
    pub stuck_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub progress_interval_secs: u64,
    /// Snapshots older than this are discarded on startup.
    pub snapshot_freshness_secs: u64,
    pub idle_poll_ms: u64,
    pub state_file: PathBuf,
    pub progress_file: PathBuf,
    pub user_agent: String,
    pub sources: Vec<SourceConfig>,
    pub content_multipliers: Vec<ContentMultiplier>,
    pub processor: Option<ProcessorConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 2,
            max_concurrent_articles: 3,
            max_retries: 3,
            retry_delays_secs: vec![60, 120, 300],
            retry_jitter_ms: 0,
            resource_restart_interval_secs: 30 * 60,
            memory_threshold_mb: 2048,
            stuck_timeout_secs: 30 * 60,
            health_check_interval_secs: 30,
            snapshot_interval_secs: 60,
            progress_interval_secs: 30,
            snapshot_freshness_secs: 12 * 60 * 60,
            idle_poll_ms: 1000,
            state_file: PathBuf::from("news_relay_state.json"),
            progress_file: PathBuf::from("news_relay_progress.json"),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            sources: Vec::new(),
            content_multipliers: default_content_multipliers(),
            processor: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a YAML configuration file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: OrchestratorConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        info!(sources = config.sources.len(), "Loaded configuration");
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sources == 0 || self.max_concurrent_articles == 0 {
            return Err(ConfigError::Invalid(
                "concurrency caps must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        if self.retry_delays_secs.is_empty() {
            return Err(ConfigError::Invalid(
                "retry_delays_secs needs at least one tier".to_string(),
            ));
        }
        for (key, value) in [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("progress_interval_secs", self.progress_interval_secs),
            ("idle_poll_ms", self.idle_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !(source.weight > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "source {} has non-positive weight {}",
                    source.name, source.weight
                )));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source {} is configured twice",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// Source names to run, in configured order.
    ///
    /// An empty `only` selects every configured source; otherwise unknown
    /// names are ignored.
    pub fn select_sources(&self, only: &[String]) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| only.is_empty() || only.contains(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn resource_restart_interval(&self) -> Duration {
        Duration::from_secs(self.resource_restart_interval_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn snapshot_freshness(&self) -> Duration {
        Duration::from_secs(self.snapshot_freshness_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

fn default_discovery_limit() -> usize {
    30
}

fn default_processor_timeout_secs() -> u64 {
    15 * 60
}

fn default_content_multipliers() -> Vec<ContentMultiplier> {
    [("/news/", 1.2), ("/equipment/", 1.1), ("/instruction/", 1.05)]
        .into_iter()
        .map(|(segment, multiplier)| ContentMultiplier {
            segment: segment.to_string(),
            multiplier,
        })
        .collect()
}
