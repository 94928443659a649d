//! RSS/Atom feed fetching with reqwest and feed-rs.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A blog whose feed is polled for new posts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogSource {
    pub name: String,

    /// Blog home page (informational)
    #[serde(default)]
    pub url: Option<String>,

    pub rss_url: String,
}

/// Feed polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Newest items taken from each feed per pass; 0 takes all (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between collection passes (default: 1800)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_interval_secs() -> u64 {
    1800
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl FeedConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One entry of a feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Fetches the items of a feed
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Return at most `limit` items (0 = all) in feed order
    async fn fetch(&self, rss_url: &str, limit: usize) -> Result<Vec<FeedItem>>;
}

/// Feed source that downloads feeds over HTTP
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("techletter/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for HttpFeedFetcher {
    async fn fetch(&self, rss_url: &str, limit: usize) -> Result<Vec<FeedItem>> {
        let response = self
            .client
            .get(rss_url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", rss_url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Fetching feed {} returned HTTP {}", rss_url, status);
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read feed {}", rss_url))?;

        parse_feed(&body, limit).with_context(|| format!("Invalid feed {}", rss_url))
    }
}

/// Parse an RSS or Atom document into items.
///
/// Control characters that XML forbids are removed first; some blogs ship
/// them in titles. Entries without a link are dropped.
pub fn parse_feed(body: &[u8], limit: usize) -> Result<Vec<FeedItem>> {
    let cleaned = strip_control_chars(body);
    let feed = feed_rs::parser::parse(cleaned.as_slice()).context("Failed to parse feed")?;

    let mut items: Vec<FeedItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
                .or_else(|| entry.links.first())?
                .href
                .trim()
                .to_string();
            if link.is_empty() {
                return None;
            }

            let title = entry
                .title
                .map(|t| t.content.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| link.clone());

            Some(FeedItem {
                title,
                link,
                published_at: entry.published.or(entry.updated),
            })
        })
        .collect();

    if limit > 0 {
        items.truncate(limit);
    }
    Ok(items)
}

/// Drop C0 control bytes other than tab, LF and CR
fn strip_control_chars(body: &[u8]) -> Vec<u8> {
    body.iter()
        .copied()
        .filter(|b| *b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r'))
        .collect()
}
