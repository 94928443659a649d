//! Adapter interfaces for the external systems each stage calls.
//!
//! - Renderer: fetches the rendered HTML of an article
//! - ContentParser: turns HTML into plain text and a thumbnail
//! - Summarizer: produces categories, tags and a summary from text
//! - FeedSource: lists the newest items of a blog feed

pub mod feed;
pub mod parser;
pub mod renderer;
pub mod summarizer;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use feed::{parse_feed, BlogSource, FeedConfig, FeedItem, FeedSource, HttpFeedFetcher};
pub use parser::HtmlParser;
pub use renderer::HttpRenderer;
pub use summarizer::CommandSummarizer;

/// Text extracted from rendered HTML
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContent {
    pub plain_text: String,
    pub thumbnail_url: Option<String>,
}

/// Output of a summarizer call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub summary: String,

    /// Model that produced the summary (if reported)
    #[serde(default)]
    pub model_name: Option<String>,

    /// Tokens used (if available)
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

/// Fetches article HTML
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Human-readable renderer name
    fn name(&self) -> &str;

    async fn render(&self, link: &str) -> Result<String>;
}

/// Extracts readable text from HTML
pub trait ContentParser: Send + Sync {
    fn parse(&self, html: &str, link: &str) -> Result<ParsedContent>;
}

/// Summarizes article text
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Human-readable summarizer name, also the fallback model name
    fn name(&self) -> &str;

    async fn summarize(&self, text: &str) -> Result<SummaryOutput>;
}
