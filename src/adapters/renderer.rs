//! HTTP renderer fetching article pages with reqwest.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Renderer;

/// Configuration for the HTTP renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("techletter/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Renderer that GETs the article URL and returns the response body
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    fn name(&self) -> &str {
        "http"
    }

    async fn render(&self, link: &str) -> Result<String> {
        let response = self
            .client
            .get(link)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", link))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Fetching {} returned HTTP {}", link, status);
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", link))?;

        if body.trim().is_empty() {
            anyhow::bail!("Empty page body for {}", link);
        }

        Ok(body)
    }
}
