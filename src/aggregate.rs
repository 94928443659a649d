//! Link registration: the entry point of the pipeline.
//!
//! Registering a link is idempotent. The post id is derived from the link, so
//! the same article discovered twice maps to one post and one `post.created`.
//! A post that exists but never left `Created` gets its event emitted again,
//! which recovers posts whose first emission was lost.
//!
//! Feed collection walks the configured blogs and registers every item link.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{BlogSource, FeedSource};
use crate::domain::{Post, PostEvent, PostId, Stage};
use crate::eventbus::Shutdown;
use crate::pipeline::{EventEmitter, PostStore};

/// Result of registering a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResult {
    /// New post stored and announced
    Created(PostId),

    /// Post existed but was still at `Created`; its event was emitted again
    Requeued(PostId),

    /// Post already past `Created`; nothing emitted
    AlreadyExists(PostId, Stage),
}

impl RegisterResult {
    pub fn post_id(&self) -> &PostId {
        match self {
            RegisterResult::Created(id)
            | RegisterResult::Requeued(id)
            | RegisterResult::AlreadyExists(id, _) => id,
        }
    }
}

/// A link discovered in a feed
#[derive(Debug, Clone)]
pub struct NewPost {
    pub blog_name: String,
    pub title: String,
    pub link: String,
}

/// Counts from one pass over the configured feeds
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub feeds_failed: usize,
    pub items_seen: usize,
    pub created: usize,
    pub requeued: usize,
    pub register_failed: usize,
}

pub struct Aggregator {
    store: Arc<dyn PostStore>,
    emitter: EventEmitter,
}

impl Aggregator {
    pub fn new(store: Arc<dyn PostStore>, emitter: EventEmitter) -> Self {
        Self { store, emitter }
    }

    #[instrument(skip_all, fields(link = %new_post.link))]
    pub async fn register_link(&self, new_post: NewPost, shutdown: &Shutdown) -> Result<RegisterResult> {
        let link = new_post.link.trim();
        if link.is_empty() {
            anyhow::bail!("Link is empty");
        }

        let post = Post::new(new_post.blog_name, new_post.title, link);

        let inserted = self
            .store
            .insert_if_absent(&post)
            .await
            .context("Failed to store post")?;

        let (post, result) = if inserted {
            let id = post.id.clone();
            (post, RegisterResult::Created(id))
        } else {
            let existing = self
                .store
                .find(&post.id)
                .await
                .context("Failed to load existing post")?
                .with_context(|| format!("Post {} vanished after insert conflict", post.id))?;

            if existing.stage > Stage::Created {
                info!(post_id = %existing.id, stage = %existing.stage, "Post already registered");
                return Ok(RegisterResult::AlreadyExists(existing.id, existing.stage));
            }
            let id = existing.id.clone();
            (existing, RegisterResult::Requeued(id))
        };

        let event = PostEvent::created(&post, self.emitter.source());
        self.emitter
            .emit(&event, shutdown)
            .await
            .with_context(|| format!("Failed to emit post.created for {}", post.id))?;

        info!(post_id = %post.id, result = ?result, "Link registered");
        Ok(result)
    }

    /// Fetch each blog's feed and register the newest `batch_size` links.
    ///
    /// A failing feed or link is logged and skipped. The pass stops early on
    /// shutdown.
    pub async fn collect_feeds(
        &self,
        source: &dyn FeedSource,
        blogs: &[BlogSource],
        batch_size: usize,
        shutdown: &Shutdown,
    ) -> CollectionReport {
        let mut report = CollectionReport::default();
        if blogs.is_empty() {
            warn!("No blogs configured (key: blogs)");
            return report;
        }

        for blog in blogs {
            if shutdown.is_cancelled() {
                break;
            }

            let items = match source.fetch(&blog.rss_url, batch_size).await {
                Ok(items) => items,
                Err(e) => {
                    error!(
                        blog = %blog.name,
                        rss_url = %blog.rss_url,
                        error = %format!("{:#}", e),
                        "Feed fetch failed"
                    );
                    report.feeds_failed += 1;
                    continue;
                }
            };
            debug!(blog = %blog.name, items = items.len(), "Feed fetched");

            for item in items {
                if shutdown.is_cancelled() {
                    break;
                }
                report.items_seen += 1;

                let new_post = NewPost {
                    blog_name: blog.name.clone(),
                    title: item.title,
                    link: item.link,
                };
                match self.register_link(new_post, shutdown).await {
                    Ok(RegisterResult::Created(_)) => report.created += 1,
                    Ok(RegisterResult::Requeued(_)) => report.requeued += 1,
                    Ok(RegisterResult::AlreadyExists(..)) => {}
                    Err(e) => {
                        error!(
                            blog = %blog.name,
                            error = %format!("{:#}", e),
                            "Failed to register feed item"
                        );
                        report.register_failed += 1;
                    }
                }
            }
        }

        info!(
            created = report.created,
            requeued = report.requeued,
            seen = report.items_seen,
            feeds_failed = report.feeds_failed,
            "Feed collection finished"
        );
        report
    }
}
