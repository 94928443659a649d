//! At-least-once event bus over a Kafka-compatible broker.
//!
//! - `envelope`: wire wrapper carrying id, retry counters and payload
//! - `topic`: base/retry/DLQ naming and the retry ladder
//! - `publisher`: acknowledged publish keyed by envelope id
//! - `dispatcher`: base-topic consumer with retry/DLQ escalation
//! - `reinjector`: moves due retry records back to the base topic
//! - `broker`: capability traits, with `memory` and `kafka` implementations

pub mod broker;
pub mod dispatcher;
pub mod duration;
pub mod envelope;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod publisher;
pub mod reinjector;
pub mod shutdown;
pub mod topic;

pub use broker::{
    ensure_topics, topic_specs, Broker, BrokerError, Consumer, InboundRecord, OutboundRecord,
    TopicSpec,
};
pub use dispatcher::{Dispatcher, EventHandler};
pub use duration::{format_go_duration, parse_go_duration, DurationParseError};
pub use envelope::Envelope;
pub use error::{EventBusError, HandlerError};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use reinjector::{retry_worker_group, RetryReinjector};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use topic::{parse_retry_delay, RetryLadder, Topic, DEFAULT_BASE_TOPIC};
