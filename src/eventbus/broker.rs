//! Broker capability traits.
//!
//! The bus only needs a handful of operations from the broker: acknowledged
//! publish, group consumption with manual commit, rewind to a record, and topic
//! provisioning. Kafka implements these in production; the in-memory broker
//! implements them for tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use super::topic::Topic;

/// Errors surfaced by a broker implementation
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Failed to provision topic {topic}: {reason}")]
    Provision { topic: String, reason: String },

    /// Unrecoverable client state; loops stop when they see this
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

/// A record handed to the broker for publishing
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// A record delivered to a consumer
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// Broker-assigned publish time
    pub timestamp: DateTime<Utc>,
}

/// Topic to create with its partition count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable broker name
    fn name(&self) -> &str;

    /// Publish and wait for the broker acknowledgement
    async fn publish(&self, record: OutboundRecord) -> Result<(), BrokerError>;

    /// Join `group_id` and subscribe to `topics`.
    ///
    /// A fresh consumer resumes from the group's committed offsets.
    async fn subscribe(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn Consumer>, BrokerError>;

    /// Create topics that do not exist yet; existing ones are left untouched
    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError>;

    /// Names of the topics the broker currently knows about
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Wait up to `timeout` for the next record
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, BrokerError>;

    /// Mark `record` as processed for the group
    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError>;

    /// Rewind the record's partition so `record` is delivered again
    async fn seek(&mut self, record: &InboundRecord) -> Result<(), BrokerError>;
}

/// Every topic a base topic needs: base, retries and DLQ
pub fn topic_specs(topic: &Topic, base_partitions: i32, dlq_partitions: i32) -> Vec<TopicSpec> {
    let mut specs = Vec::with_capacity(topic.ladder().len() + 2);
    specs.push(TopicSpec {
        name: topic.base().to_string(),
        partitions: base_partitions,
    });
    specs.extend(topic.retry_topics().into_iter().map(|name| TopicSpec {
        name,
        partitions: base_partitions,
    }));
    specs.push(TopicSpec {
        name: topic.dlq(),
        partitions: dlq_partitions,
    });
    specs
}

/// Idempotently create the base, retry and DLQ topics of `topic`
pub async fn ensure_topics(
    broker: &dyn Broker,
    topic: &Topic,
    base_partitions: i32,
    dlq_partitions: i32,
) -> Result<(), BrokerError> {
    let specs = topic_specs(topic, base_partitions, dlq_partitions);
    broker.create_topics(&specs).await?;
    info!(
        broker = broker.name(),
        base = topic.base(),
        count = specs.len(),
        "Topics ensured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::topic::RetryLadder;

    #[test]
    fn test_topic_specs_cover_base_retries_and_dlq() {
        let topic = Topic::new("a.b.events", RetryLadder::standard());
        let specs = topic_specs(&topic, 3, 1);

        assert_eq!(specs.len(), 7);
        assert_eq!(specs[0].name, "a.b.events");
        assert_eq!(specs[0].partitions, 3);
        assert_eq!(specs[1].name, "a.b.events.retry.10s");
        assert_eq!(specs[6].name, "a.b.events.dlq");
        assert_eq!(specs[6].partitions, 1);
    }
}
