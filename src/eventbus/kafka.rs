//! Kafka-backed broker (enabled with the `kafka` feature).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as KafkaConsumerExt, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::broker::{Broker, BrokerError, Consumer, InboundRecord, OutboundRecord, TopicSpec};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn map_error(err: KafkaError, wrap: impl FnOnce(String) -> BrokerError) -> BrokerError {
    if err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
        BrokerError::Fatal(err.to_string())
    } else {
        wrap(err.to_string())
    }
}

/// Broker connected to a Kafka cluster
pub struct KafkaBroker {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaBroker {
    /// Connect a producer to `brokers` (comma-separated host:port list)
    pub fn connect(brokers: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("retries", "5")
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        info!(brokers, "Kafka producer connected");
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
        })
    }

    fn admin(&self) -> Result<AdminClient<DefaultClientContext>, BrokerError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn publish(&self, record: OutboundRecord) -> Result<(), BrokerError> {
        let future_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload);

        match self.producer.send(future_record, QUEUE_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(topic = %record.topic, partition, offset, "Kafka ack");
                Ok(())
            }
            Err((err, _)) => Err(map_error(err, |reason| BrokerError::Rejected {
                topic: record.topic.clone(),
                reason,
            })),
        }
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("partition.assignment.strategy", "range")
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| map_error(e, BrokerError::Consumer))?;

        info!(group_id, topics = ?names, "Kafka consumer subscribed");
        Ok(Box::new(KafkaConsumer { inner: consumer }))
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError> {
        let admin = self.admin()?;
        let new_topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|s| NewTopic::new(&s.name, s.partitions, TopicReplication::Fixed(1)))
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = admin
            .create_topics(&new_topics, &options)
            .await
            .map_err(|e| BrokerError::Provision {
                topic: "*".to_string(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Provision {
                        topic: name,
                        reason: code.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(None, METADATA_TIMEOUT)
            .map_err(|e| map_error(e, BrokerError::Unavailable))?;
        let mut names: Vec<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Group consumer with manual commits
pub struct KafkaConsumer {
    inner: StreamConsumer,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, BrokerError> {
        let message = match tokio::time::timeout(timeout, self.inner.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(map_error(e, BrokerError::Consumer)),
            Ok(Ok(message)) => message,
        };

        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Some(InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp,
        }))
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| map_error(e, BrokerError::Commit))?;
        self.inner
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| map_error(e, BrokerError::Commit))
    }

    async fn seek(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        self.inner
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| map_error(e, BrokerError::Consumer))
    }
}
