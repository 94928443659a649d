//! Post entity and its processing stage.
//!
//! A post moves strictly forward through `Created -> Rendered -> Parsed ->
//! Summarized`. Each stage stores the output it produced, so a later stage can
//! never exist without the earlier ones.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Stable post identifier derived from the article link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// SHA256 of the link, 16 hex chars
    pub fn from_link(link: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(link.trim().as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash[..8]))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Processing stage, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Rendered,
    Parsed,
    Summarized,
}

#[derive(Debug, Error)]
#[error("Unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Created => Some(Stage::Rendered),
            Stage::Rendered => Some(Stage::Parsed),
            Stage::Parsed => Some(Stage::Summarized),
            Stage::Summarized => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Rendered => "rendered",
            Stage::Parsed => "parsed",
            Stage::Summarized => "summarized",
        }
    }

    /// Numeric rank used for storage
    pub fn rank(self) -> i64 {
        match self {
            Stage::Created => 0,
            Stage::Rendered => 1,
            Stage::Parsed => 2,
            Stage::Summarized => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Stage> {
        match rank {
            0 => Some(Stage::Created),
            1 => Some(Stage::Rendered),
            2 => Some(Stage::Parsed),
            3 => Some(Stage::Summarized),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Stage::Created),
            "rendered" => Ok(Stage::Rendered),
            "parsed" => Ok(Stage::Parsed),
            "summarized" => Ok(Stage::Summarized),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

/// Output of the summarize stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSummary {
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub model_name: String,
    pub generated_at: DateTime<Utc>,
}

/// What a stage produced; applying it advances the post one stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Rendered {
        html: String,
    },
    Parsed {
        plain_text: String,
        thumbnail_url: Option<String>,
    },
    Summarized(AiSummary),
}

impl StageOutput {
    /// Stage the post reaches once this output is stored
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Rendered { .. } => Stage::Rendered,
            StageOutput::Parsed { .. } => Stage::Parsed,
            StageOutput::Summarized(_) => Stage::Summarized,
        }
    }
}

/// An article moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,

    /// Source blog or feed name
    pub blog_name: String,

    pub title: String,

    /// Canonical article URL
    pub link: String,

    pub stage: Stage,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set once rendered
    pub rendered_html: Option<String>,

    /// Set once parsed
    pub plain_text: Option<String>,

    pub thumbnail_url: Option<String>,

    /// Set once summarized
    pub summary: Option<AiSummary>,
}

impl Post {
    pub fn new(blog_name: impl Into<String>, title: impl Into<String>, link: impl Into<String>) -> Self {
        let link = link.into();
        let now = Utc::now();
        Self {
            id: PostId::from_link(&link),
            blog_name: blog_name.into(),
            title: title.into(),
            link,
            stage: Stage::Created,
            created_at: now,
            updated_at: now,
            rendered_html: None,
            plain_text: None,
            thumbnail_url: None,
            summary: None,
        }
    }

    /// Whether the post already reached `stage`
    pub fn has_reached(&self, stage: Stage) -> bool {
        self.stage >= stage
    }

    /// Store `output` if it is the immediate next stage.
    ///
    /// Returns `false` and leaves the post untouched otherwise.
    pub fn apply(&mut self, output: &StageOutput) -> bool {
        if self.stage.next() != Some(output.stage()) {
            return false;
        }

        match output {
            StageOutput::Rendered { html } => {
                self.rendered_html = Some(html.clone());
            }
            StageOutput::Parsed {
                plain_text,
                thumbnail_url,
            } => {
                self.plain_text = Some(plain_text.clone());
                self.thumbnail_url = thumbnail_url.clone();
            }
            StageOutput::Summarized(summary) => {
                self.summary = Some(summary.clone());
            }
        }
        self.stage = output.stage();
        self.updated_at = Utc::now();
        true
    }
}
