//! Domain types for the post pipeline.
//!
//! - Post: the article entity and its ordered stages
//! - Events: messages announcing stage completions

pub mod events;
pub mod post;

pub use events::{
    EventMeta, PostCreated, PostEvent, PostHtmlRendered, PostSummarized, PostTextParsed,
    EVENT_SCHEMA_VERSION,
};
pub use post::{AiSummary, Post, PostId, Stage, StageOutput};
