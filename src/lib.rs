//! techletter - at-least-once processing of RSS articles over Kafka
//!
//! Posts discovered in feeds move through render -> parse -> summarize. Each
//! stage is triggered by an event on a Kafka topic and announces its
//! completion with the next event.
//!
//! # Architecture
//!
//! The system is built around a small reliability layer:
//! - Every event travels in an envelope with a stable id and retry counters
//! - Offsets are committed only after success or durable escalation
//! - Failures go to delayed retry topics, then to a dead-letter topic
//! - A retry worker moves due retries back to the base topic
//! - Stage handlers are idempotent, so redelivery never repeats work
//!
//! # Modules
//!
//! - `eventbus`: envelope, topics, publisher, dispatcher, retry reinjector
//! - `pipeline`: stage handlers, post store, summary quota
//! - `domain`: Post entity and domain events
//! - `adapters`: feed, renderer, parser and summarizer collaborators
//! - `aggregate`: feed collection and link registration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Provision topics and run the services
//! techletter topics ensure
//! techletter processor
//! techletter retry-worker
//!
//! # Poll the configured blogs, or register one link by hand
//! techletter aggregate run
//! techletter aggregate ingest https://blog.example.com/post
//! techletter status https://blog.example.com/post
//! ```

pub mod adapters;
pub mod aggregate;
pub mod cli;
pub mod config;
pub mod domain;
pub mod eventbus;
pub mod pipeline;

// Re-export main types at crate root for convenience
pub use aggregate::{Aggregator, CollectionReport, NewPost, RegisterResult};
pub use domain::{Post, PostEvent, PostId, Stage};
pub use eventbus::{Dispatcher, Envelope, Publisher, RetryReinjector, Shutdown, Topic};
pub use pipeline::{PostEventRouter, StageHandlers, SummaryQuota};
