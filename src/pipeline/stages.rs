//! Stage handlers for the post pipeline.
//!
//! Each handler loads the post, skips work the post already has, calls its
//! collaborator, stores the output with a compare-and-set advance, then emits
//! the event that triggers the next stage. Redelivered events therefore never
//! repeat a completed stage.
//!
//! The stored stage is saved before the next event is published. When that
//! publish fails the handler reports an error, and the redelivered trigger finds
//! the post sitting exactly at the handler's target stage and publishes the next
//! event again.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::emitter::EventEmitter;
use super::quota::{QuotaError, SummaryQuota};
use super::store::{require, PostStore, StoreError};
use crate::adapters::{ContentParser, Renderer, Summarizer};
use crate::domain::{
    AiSummary, PostCreated, PostEvent, PostHtmlRendered, PostTextParsed, Stage, StageOutput,
};
use crate::eventbus::{EventBusError, HandlerError, Shutdown};

/// Errors a stage handler reports back to the dispatcher
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Rendering failed: {0:#}")]
    Render(anyhow::Error),

    #[error("Parsing failed: {0:#}")]
    Parse(anyhow::Error),

    #[error("Summarizing failed: {0:#}")]
    Summarize(anyhow::Error),

    #[error("Post {post_id} has no {field} for stage {stage}")]
    MissingInput {
        post_id: String,
        stage: Stage,
        field: &'static str,
    },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("Failed to emit {event}: {source}")]
    Emit {
        event: &'static str,
        #[source]
        source: EventBusError,
    },
}

impl From<StageError> for HandlerError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Quota(QuotaError::Cancelled) => HandlerError::Cancelled,
            StageError::Emit {
                source: EventBusError::Cancelled,
                ..
            } => HandlerError::Cancelled,
            other => HandlerError::failed(other),
        }
    }
}

/// Result of a stage handler that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and the post advanced
    Completed,
    /// The post already had this stage; no collaborator was called
    AlreadyDone,
    /// The stage was skipped without work (daily quota exhausted)
    Skipped,
}

/// Collaborators shared by all stage handlers
pub struct StageHandlers {
    store: Arc<dyn PostStore>,
    renderer: Arc<dyn Renderer>,
    parser: Arc<dyn ContentParser>,
    summarizer: Arc<dyn Summarizer>,
    quota: Arc<SummaryQuota>,
    emitter: EventEmitter,
}

impl StageHandlers {
    pub fn new(
        store: Arc<dyn PostStore>,
        renderer: Arc<dyn Renderer>,
        parser: Arc<dyn ContentParser>,
        summarizer: Arc<dyn Summarizer>,
        quota: Arc<SummaryQuota>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            store,
            renderer,
            parser,
            summarizer,
            quota,
            emitter,
        }
    }

    /// post.created -> render HTML
    #[instrument(skip_all, fields(post_id = %event.post_id))]
    pub async fn handle_created(
        &self,
        event: &PostCreated,
        _shutdown: &Shutdown,
    ) -> Result<StageOutcome, StageError> {
        let post = require(self.store.as_ref(), &event.post_id).await?;
        if post.has_reached(Stage::Rendered) {
            if post.stage == Stage::Rendered {
                debug!("Already rendered, re-emitting html_rendered");
                let next = PostEvent::html_rendered(&post.id, &post.link, self.emitter.source());
                self.emit_next(next).await?;
            } else {
                debug!(stage = %post.stage, "Already rendered, skipping");
            }
            return Ok(StageOutcome::AlreadyDone);
        }

        let html = self
            .renderer
            .render(&post.link)
            .await
            .map_err(StageError::Render)?;

        let output = StageOutput::Rendered { html };
        if !self.store.advance(&post.id, &output).await? {
            debug!("Post advanced concurrently, skipping emit");
            return Ok(StageOutcome::AlreadyDone);
        }
        info!(renderer = self.renderer.name(), "Rendered");

        let next = PostEvent::html_rendered(&post.id, &post.link, self.emitter.source());
        self.emit_next(next).await?;
        Ok(StageOutcome::Completed)
    }

    /// post.html_rendered -> extract plain text
    #[instrument(skip_all, fields(post_id = %event.post_id))]
    pub async fn handle_rendered(
        &self,
        event: &PostHtmlRendered,
        _shutdown: &Shutdown,
    ) -> Result<StageOutcome, StageError> {
        let post = require(self.store.as_ref(), &event.post_id).await?;
        if post.has_reached(Stage::Parsed) {
            if post.stage == Stage::Parsed {
                debug!("Already parsed, re-emitting text_parsed");
                let next = PostEvent::text_parsed(
                    &post.id,
                    &post.link,
                    post.thumbnail_url.clone(),
                    self.emitter.source(),
                );
                self.emit_next(next).await?;
            } else {
                debug!(stage = %post.stage, "Already parsed, skipping");
            }
            return Ok(StageOutcome::AlreadyDone);
        }

        let html = post
            .rendered_html
            .as_deref()
            .ok_or_else(|| StageError::MissingInput {
                post_id: post.id.to_string(),
                stage: Stage::Parsed,
                field: "rendered_html",
            })?;

        let parsed = self
            .parser
            .parse(html, &post.link)
            .map_err(StageError::Parse)?;

        let thumbnail_url = parsed.thumbnail_url.clone();
        let output = StageOutput::Parsed {
            plain_text: parsed.plain_text,
            thumbnail_url: parsed.thumbnail_url,
        };
        if !self.store.advance(&post.id, &output).await? {
            debug!("Post advanced concurrently, skipping emit");
            return Ok(StageOutcome::AlreadyDone);
        }
        info!(has_thumbnail = thumbnail_url.is_some(), "Parsed");

        let next = PostEvent::text_parsed(&post.id, &post.link, thumbnail_url, self.emitter.source());
        self.emit_next(next).await?;
        Ok(StageOutcome::Completed)
    }

    /// post.text_parsed -> summarize, subject to the summary quota
    #[instrument(skip_all, fields(post_id = %event.post_id))]
    pub async fn handle_parsed(
        &self,
        event: &PostTextParsed,
        shutdown: &Shutdown,
    ) -> Result<StageOutcome, StageError> {
        let post = require(self.store.as_ref(), &event.post_id).await?;
        if post.has_reached(Stage::Summarized) {
            match &post.summary {
                Some(summary) if post.stage == Stage::Summarized => {
                    debug!("Already summarized, re-emitting summarized");
                    let next =
                        PostEvent::summarized(&post.id, &post.link, summary, self.emitter.source());
                    self.emit_next(next).await?;
                }
                _ => debug!(stage = %post.stage, "Already summarized, skipping"),
            }
            return Ok(StageOutcome::AlreadyDone);
        }

        let text = post
            .plain_text
            .as_deref()
            .ok_or_else(|| StageError::MissingInput {
                post_id: post.id.to_string(),
                stage: Stage::Summarized,
                field: "plain_text",
            })?;

        if !self.quota.wait_and_reserve(shutdown).await? {
            warn!("Daily summary quota exhausted, skipping summary");
            return Ok(StageOutcome::Skipped);
        }

        let result = self
            .summarizer
            .summarize(text)
            .await
            .map_err(StageError::Summarize)?;

        let summary = AiSummary {
            categories: result.categories,
            tags: result.tags,
            summary: result.summary,
            model_name: result
                .model_name
                .unwrap_or_else(|| self.summarizer.name().to_string()),
            generated_at: Utc::now(),
        };

        if !self
            .store
            .advance(&post.id, &StageOutput::Summarized(summary.clone()))
            .await?
        {
            debug!("Post advanced concurrently, skipping emit");
            return Ok(StageOutcome::AlreadyDone);
        }
        info!(model = %summary.model_name, tags = summary.tags.len(), "Summarized");

        let next = PostEvent::summarized(&post.id, &post.link, &summary, self.emitter.source());
        self.emit_next(next).await?;
        Ok(StageOutcome::Completed)
    }

    /// Publish the next-stage event once the new stage is stored.
    ///
    /// Shutdown does not interrupt this publish; the publisher's ack timeout
    /// bounds it instead. A failure is returned so the trigger is retried.
    async fn emit_next(&self, event: PostEvent) -> Result<(), StageError> {
        match self.emitter.emit(&event, &Shutdown::never()).await {
            Ok(envelope) => {
                debug!(event = event.type_name(), event_id = %envelope.id, "Emitted");
                Ok(())
            }
            Err(source) => {
                error!(
                    event = event.type_name(),
                    error = %source,
                    "Failed to emit next-stage event"
                );
                Err(StageError::Emit {
                    event: event.type_name(),
                    source,
                })
            }
        }
    }
}
