//! SQLite-backed post store.
//!
//! One row per post. Stage advances are single `UPDATE ... WHERE stage = ?`
//! statements, so the compare-and-set happens inside the database.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::store::{PostStore, StoreError};
use crate::domain::{AiSummary, Post, PostId, Stage, StageOutput};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    id            TEXT PRIMARY KEY,
    blog_name     TEXT NOT NULL,
    title         TEXT NOT NULL,
    link          TEXT NOT NULL UNIQUE,
    stage         INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    rendered_html TEXT,
    plain_text    TEXT,
    thumbnail_url TEXT,
    summary_json  TEXT
);
CREATE INDEX IF NOT EXISTS posts_updated_at ON posts(updated_at);
";

const SELECT_COLUMNS: &str = "id, blog_name, title, link, stage, created_at, updated_at, \
     rendered_html, plain_text, thumbnail_url, summary_json";

/// Post store persisted in a SQLite file
#[derive(Clone)]
pub struct SqlitePostStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePostStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        debug!(path = %path.display(), "Opened post store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn parse_time(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp {:?}: {}", value, e),
        })
}

struct RawPost {
    id: String,
    blog_name: String,
    title: String,
    link: String,
    stage: i64,
    created_at: String,
    updated_at: String,
    rendered_html: Option<String>,
    plain_text: Option<String>,
    thumbnail_url: Option<String>,
    summary_json: Option<String>,
}

impl RawPost {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            blog_name: row.get(1)?,
            title: row.get(2)?,
            link: row.get(3)?,
            stage: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            rendered_html: row.get(7)?,
            plain_text: row.get(8)?,
            thumbnail_url: row.get(9)?,
            summary_json: row.get(10)?,
        })
    }

    fn into_post(self) -> Result<Post, StoreError> {
        let stage = Stage::from_rank(self.stage).ok_or_else(|| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("unknown stage rank {}", self.stage),
        })?;
        let summary: Option<AiSummary> = match self.summary_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };

        Ok(Post {
            created_at: parse_time(&self.id, &self.created_at)?,
            updated_at: parse_time(&self.id, &self.updated_at)?,
            id: PostId::new(self.id),
            blog_name: self.blog_name,
            title: self.title,
            link: self.link,
            stage,
            rendered_html: self.rendered_html,
            plain_text: self.plain_text,
            thumbnail_url: self.thumbnail_url,
            summary,
        })
    }
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn insert_if_absent(&self, post: &Post) -> Result<bool, StoreError> {
        let post = post.clone();
        self.with_conn(move |conn| {
            let summary_json = post.summary.as_ref().map(serde_json::to_string).transpose()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO posts (id, blog_name, title, link, stage, created_at, \
                 updated_at, rendered_html, plain_text, thumbnail_url, summary_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    post.id.as_str(),
                    post.blog_name,
                    post.title,
                    post.link,
                    post.stage.rank(),
                    post.created_at.to_rfc3339(),
                    post.updated_at.to_rfc3339(),
                    post.rendered_html,
                    post.plain_text,
                    post.thumbnail_url,
                    summary_json,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn find(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM posts WHERE id = ?1", SELECT_COLUMNS),
                    params![id.as_str()],
                    RawPost::from_row,
                )
                .optional()?;
            raw.map(RawPost::into_post).transpose()
        })
        .await
    }

    async fn advance(&self, id: &PostId, output: &StageOutput) -> Result<bool, StoreError> {
        let id = id.clone();
        let output = output.clone();
        self.with_conn(move |conn| {
            let target = output.stage();
            let previous = target.rank() - 1;
            let now = Utc::now().to_rfc3339();

            let updated = match &output {
                StageOutput::Rendered { html } => conn.execute(
                    "UPDATE posts SET rendered_html = ?1, stage = ?2, updated_at = ?3 \
                     WHERE id = ?4 AND stage = ?5",
                    params![html, target.rank(), now, id.as_str(), previous],
                )?,
                StageOutput::Parsed {
                    plain_text,
                    thumbnail_url,
                } => conn.execute(
                    "UPDATE posts SET plain_text = ?1, thumbnail_url = ?2, stage = ?3, \
                     updated_at = ?4 WHERE id = ?5 AND stage = ?6",
                    params![plain_text, thumbnail_url, target.rank(), now, id.as_str(), previous],
                )?,
                StageOutput::Summarized(summary) => conn.execute(
                    "UPDATE posts SET summary_json = ?1, stage = ?2, updated_at = ?3 \
                     WHERE id = ?4 AND stage = ?5",
                    params![
                        serde_json::to_string(summary)?,
                        target.rank(),
                        now,
                        id.as_str(),
                        previous
                    ],
                )?,
            };

            if updated == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT stage FROM posts WHERE id = ?1",
                        params![id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(id));
                }
            }
            Ok(updated == 1)
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Post>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM posts ORDER BY updated_at DESC LIMIT ?1",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], RawPost::from_row)?;
            let mut posts = Vec::new();
            for raw in rows {
                posts.push(raw?.into_post()?);
            }
            Ok(posts)
        })
        .await
    }
}
