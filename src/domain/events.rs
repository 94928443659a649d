//! Domain events exchanged on the post events topic.
//!
//! Events are JSON objects discriminated by a `type` field. Types this build
//! does not know decode to [`PostEvent::Unknown`] and are acknowledged without
//! work, so producers can roll out new event types first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::post::{AiSummary, Post, PostId};

/// Schema version stamped on every event
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Fields common to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was emitted
    pub timestamp: DateTime<Utc>,

    /// Emitting service
    pub source: String,

    pub version: String,
}

impl EventMeta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            version: EVENT_SCHEMA_VERSION.to_string(),
        }
    }
}

/// A post was registered and needs rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostCreated {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub post_id: PostId,
    pub blog_name: String,
    pub title: String,
    pub link: String,
}

/// HTML was rendered and stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostHtmlRendered {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub post_id: PostId,
    pub link: String,
}

/// Plain text was extracted and stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTextParsed {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub post_id: PostId,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Summary was generated and stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostSummarized {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub post_id: PostId,
    pub link: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub model_name: String,
}

/// Every event carried on the post events topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PostEvent {
    #[serde(rename = "post.created")]
    Created(PostCreated),

    #[serde(rename = "post.html_rendered")]
    HtmlRendered(PostHtmlRendered),

    #[serde(rename = "post.text_parsed")]
    TextParsed(PostTextParsed),

    #[serde(rename = "post.summarized")]
    Summarized(PostSummarized),

    #[serde(other)]
    Unknown,
}

impl PostEvent {
    pub fn created(post: &Post, source: &str) -> Self {
        PostEvent::Created(PostCreated {
            meta: EventMeta::new(source),
            post_id: post.id.clone(),
            blog_name: post.blog_name.clone(),
            title: post.title.clone(),
            link: post.link.clone(),
        })
    }

    pub fn html_rendered(post_id: &PostId, link: &str, source: &str) -> Self {
        PostEvent::HtmlRendered(PostHtmlRendered {
            meta: EventMeta::new(source),
            post_id: post_id.clone(),
            link: link.to_string(),
        })
    }

    pub fn text_parsed(post_id: &PostId, link: &str, thumbnail_url: Option<String>, source: &str) -> Self {
        PostEvent::TextParsed(PostTextParsed {
            meta: EventMeta::new(source),
            post_id: post_id.clone(),
            link: link.to_string(),
            thumbnail_url,
        })
    }

    pub fn summarized(post_id: &PostId, link: &str, summary: &AiSummary, source: &str) -> Self {
        PostEvent::Summarized(PostSummarized {
            meta: EventMeta::new(source),
            post_id: post_id.clone(),
            link: link.to_string(),
            categories: summary.categories.clone(),
            tags: summary.tags.clone(),
            summary: summary.summary.clone(),
            model_name: summary.model_name.clone(),
        })
    }

    /// Wire name of the event type
    pub fn type_name(&self) -> &'static str {
        match self {
            PostEvent::Created(_) => "post.created",
            PostEvent::HtmlRendered(_) => "post.html_rendered",
            PostEvent::TextParsed(_) => "post.text_parsed",
            PostEvent::Summarized(_) => "post.summarized",
            PostEvent::Unknown => "unknown",
        }
    }

    pub fn post_id(&self) -> Option<&PostId> {
        match self {
            PostEvent::Created(e) => Some(&e.post_id),
            PostEvent::HtmlRendered(e) => Some(&e.post_id),
            PostEvent::TextParsed(e) => Some(&e.post_id),
            PostEvent::Summarized(e) => Some(&e.post_id),
            PostEvent::Unknown => None,
        }
    }

    pub fn meta(&self) -> Option<&EventMeta> {
        match self {
            PostEvent::Created(e) => Some(&e.meta),
            PostEvent::HtmlRendered(e) => Some(&e.meta),
            PostEvent::TextParsed(e) => Some(&e.meta),
            PostEvent::Summarized(e) => Some(&e.meta),
            PostEvent::Unknown => None,
        }
    }
}
