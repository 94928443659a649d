//! Post processing pipeline: render -> parse -> summarize.
//!
//! - `stages`: one idempotent handler per stage
//! - `router`: maps post events onto stages for the dispatcher
//! - `store` / `sqlite_store`: post persistence with compare-and-set advances
//! - `quota`: daily and per-minute limits on summarizer calls
//! - `emitter`: publishes next-stage events

pub mod emitter;
pub mod quota;
pub mod router;
pub mod sqlite_store;
pub mod stages;
pub mod store;

pub use emitter::EventEmitter;
pub use quota::{Clock, QuotaError, QuotaSettings, SummaryQuota, SystemClock};
pub use router::PostEventRouter;
pub use sqlite_store::SqlitePostStore;
pub use stages::{StageError, StageHandlers, StageOutcome};
pub use store::{MemoryPostStore, PostStore, StoreError};
