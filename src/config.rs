//! Configuration for techletter services.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (KAFKA_BOOTSTRAP_SERVERS, KAFKA_GROUP_ID, TECHLETTER_DB, LOG_LEVEL)
//! 2. Config file (`--config`, TECHLETTER_CONFIG, or `.techletter/config.yaml`)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .techletter/config.yaml
//! - A relative store path is resolved against the config file's project root

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::feed::{BlogSource, FeedConfig};
use crate::adapters::renderer::RendererConfig;
use crate::adapters::summarizer::SummarizerConfig;
use crate::eventbus::{RetryLadder, Topic, DEFAULT_BASE_TOPIC};
use crate::pipeline::QuotaSettings;

/// Name of the per-project config directory
pub const CONFIG_DIR: &str = ".techletter";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub eventbus: EventBusConfig,
    #[serde(default)]
    pub summary_quota: QuotaSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Feeds polled by `aggregate run`
    #[serde(default)]
    pub blogs: Vec<BlogSource>,
    #[serde(default)]
    pub feeds: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Comma-separated bootstrap servers (default: localhost:9092)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Consumer group id (default: tech-letter)
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Base topics to consume
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Retry ladder as Go duration strings
    #[serde(default = "default_retry_delays")]
    pub retry_delays: Vec<String>,

    #[serde(default = "default_base_partitions")]
    pub base_partitions: i32,

    #[serde(default = "default_dlq_partitions")]
    pub dlq_partitions: i32,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Wait for a publish acknowledgement (default: 30s)
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// Retry worker sleep floor while a record is not ready (default: 50ms)
    #[serde(default = "default_reinject_min_wait_ms")]
    pub reinject_min_wait_ms: u64,

    /// Retry worker sleep ceiling while a record is not ready (default: 500ms)
    #[serde(default = "default_reinject_max_wait_ms")]
    pub reinject_max_wait_ms: u64,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}
fn default_group_id() -> String {
    "tech-letter".to_string()
}
fn default_topics() -> Vec<String> {
    vec![DEFAULT_BASE_TOPIC.to_string()]
}
fn default_retry_delays() -> Vec<String> {
    ["10s", "30s", "1m0s", "5m0s", "10m0s"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_base_partitions() -> i32 {
    3
}
fn default_dlq_partitions() -> i32 {
    1
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_publish_timeout_secs() -> u64 {
    30
}
fn default_reinject_min_wait_ms() -> u64 {
    50
}
fn default_reinject_max_wait_ms() -> u64 {
    500
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topics: default_topics(),
            retry_delays: default_retry_delays(),
            base_partitions: default_base_partitions(),
            dlq_partitions: default_dlq_partitions(),
            poll_timeout_ms: default_poll_timeout_ms(),
            publish_timeout_secs: default_publish_timeout_secs(),
            reinject_min_wait_ms: default_reinject_min_wait_ms(),
            reinject_max_wait_ms: default_reinject_max_wait_ms(),
        }
    }
}

impl EventBusConfig {
    pub fn retry_ladder(&self) -> Result<RetryLadder> {
        RetryLadder::parse(&self.retry_delays).context("Invalid eventbus.retry_delays")
    }

    /// Configured base topics, each with the shared ladder
    pub fn topics(&self) -> Result<Vec<Topic>> {
        let ladder = self.retry_ladder()?;
        if self.topics.is_empty() {
            anyhow::bail!("eventbus.topics must name at least one topic");
        }
        Ok(self
            .topics
            .iter()
            .map(|base| Topic::new(base.clone(), ladder.clone()))
            .collect())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Floor and ceiling of the retry worker's not-ready sleep
    pub fn reinject_wait_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reinject_min_wait_ms),
            Duration::from_millis(self.reinject_max_wait_ms),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file (default: ~/.techletter/posts.db)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset (default: info)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration after file discovery, env overrides and path resolution
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: ConfigFile,
    /// Absolute path of the SQLite store
    pub store_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl ConfigFile {
    /// Apply environment overrides; `lookup` is `std::env::var` in production
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(brokers) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            self.eventbus.brokers = brokers;
        }
        if let Some(group_id) = lookup("KAFKA_GROUP_ID") {
            self.eventbus.group_id = group_id;
        }
        if let Some(db) = lookup("TECHLETTER_DB") {
            self.store.path = Some(PathBuf::from(db));
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

/// Load configuration from all sources
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let env_path = std::env::var_os("TECHLETTER_CONFIG").map(PathBuf::from);
    let config_file = match explicit.map(Path::to_path_buf).or(env_path) {
        Some(path) => Some(path),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config_file(&cwd)),
    };

    let mut settings = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    settings.apply_env_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));

    // Validate early so every command fails the same way on a bad ladder
    settings.eventbus.topics()?;

    let store_path = match (&settings.store.path, &config_file) {
        (Some(path), Some(config_path)) => {
            // Project root is the parent of .techletter/
            let base = config_path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(Path::new("."));
            resolve_path(base, path)
        }
        (Some(path), None) => path.clone(),
        (None, _) => default_home()?.join("posts.db"),
    };

    Ok(ResolvedConfig {
        settings,
        store_path,
        config_file,
    })
}

/// ~/.techletter
pub fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ConfigFile::default();
        assert_eq!(config.eventbus.brokers, "localhost:9092");
        assert_eq!(config.eventbus.group_id, "tech-letter");
        let topics = config.eventbus.topics().unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].base(), DEFAULT_BASE_TOPIC);
        assert_eq!(topics[0].ladder(), &RetryLadder::standard());
        assert_eq!(config.summary_quota.requests_per_minute, 15);
        assert!(config.blogs.is_empty());
        assert_eq!(config.feeds.batch_size, 10);
        assert_eq!(config.feeds.interval(), Duration::from_secs(1800));
        assert_eq!(
            config.eventbus.reinject_wait_bounds(),
            (Duration::from_millis(50), Duration::from_millis(500))
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
eventbus:
  group_id: processor-a
  retry_delays: [\"1s\", \"2s\"]
summary_quota:
  requests_per_day: 50
";
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.eventbus.group_id, "processor-a");
        assert_eq!(config.eventbus.brokers, "localhost:9092");
        assert_eq!(config.eventbus.retry_ladder().unwrap().len(), 2);
        assert_eq!(config.summary_quota.requests_per_day, 50);
        assert_eq!(config.summary_quota.requests_per_minute, 15);
    }

    #[test]
    fn test_blogs_section() {
        let yaml = "
blogs:
  - name: Example Engineering
    url: https://blog.example.com
    rss_url: https://blog.example.com/feed.xml
  - name: Atom Blog
    rss_url: https://atom.example.com/atom.xml
feeds:
  batch_size: 5
";
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.blogs.len(), 2);
        assert_eq!(config.blogs[0].url.as_deref(), Some("https://blog.example.com"));
        assert_eq!(config.blogs[1].rss_url, "https://atom.example.com/atom.xml");
        assert_eq!(config.feeds.batch_size, 5);
        assert_eq!(config.feeds.interval_secs, 1800);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KAFKA_BOOTSTRAP_SERVERS", "kafka-1:9092,kafka-2:9092"),
            ("KAFKA_GROUP_ID", "g2"),
            ("TECHLETTER_DB", "/var/lib/techletter/posts.db"),
        ]
        .into_iter()
        .collect();

        let mut config = ConfigFile::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.eventbus.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.eventbus.group_id, "g2");
        assert_eq!(
            config.store.path.as_deref(),
            Some(Path::new("/var/lib/techletter/posts.db"))
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_ladder_rejected() {
        let mut config = ConfigFile::default();
        config.eventbus.retry_delays = vec!["soon".to_string()];
        assert!(config.eventbus.topics().is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.yaml"), "eventbus: {}\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_dir.join("config.yaml"));
        let parsed = load_config_file(&found).unwrap();
        assert_eq!(parsed.eventbus.group_id, "tech-letter");
    }
}
