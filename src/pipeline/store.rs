//! Post persistence.
//!
//! Stage progress is written with `advance`, a field-level compare-and-set:
//! it only succeeds when the post sits exactly one stage behind the output, so
//! concurrent or replayed handlers cannot move a post backwards or skip a stage.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Post, PostId, StageOutput};

/// Errors that can occur in a post store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Post not found: {0}")]
    NotFound(PostId),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt row for post {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Insert `post` unless a post with the same id exists; `true` if inserted
    async fn insert_if_absent(&self, post: &Post) -> Result<bool, StoreError>;

    async fn find(&self, id: &PostId) -> Result<Option<Post>, StoreError>;

    /// Store a stage output; `true` if the post moved forward
    async fn advance(&self, id: &PostId, output: &StageOutput) -> Result<bool, StoreError>;

    /// Most recently updated posts first
    async fn recent(&self, limit: usize) -> Result<Vec<Post>, StoreError>;
}

/// Load a post or fail with `NotFound`
pub async fn require(store: &dyn PostStore, id: &PostId) -> Result<Post, StoreError> {
    store
        .find(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.clone()))
}

/// In-memory store, used by tests and the memory-backed processor
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    posts: Mutex<HashMap<PostId, Post>>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PostId, Post>>, StoreError> {
        self.posts.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn insert_if_absent(&self, post: &Post) -> Result<bool, StoreError> {
        let mut posts = self.lock()?;
        if posts.contains_key(&post.id) {
            return Ok(false);
        }
        posts.insert(post.id.clone(), post.clone());
        Ok(true)
    }

    async fn find(&self, id: &PostId) -> Result<Option<Post>, StoreError> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn advance(&self, id: &PostId, output: &StageOutput) -> Result<bool, StoreError> {
        let mut posts = self.lock()?;
        let post = posts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(post.apply(output))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Post>, StoreError> {
        let mut posts: Vec<Post> = self.lock()?.values().cloned().collect();
        posts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        posts.truncate(limit);
        Ok(posts)
    }
}
