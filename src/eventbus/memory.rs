//! In-process broker with Kafka-like semantics.
//!
//! Records land in partitioned, append-only logs. Consumer groups keep
//! committed offsets, so dropping a consumer and subscribing again resumes from
//! the last commit, which is how a process restart looks to the bus. Each
//! consumer also keeps its own read position that `seek` can rewind.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::broker::{Broker, BrokerError, Consumer, InboundRecord, OutboundRecord, TopicSpec};

const DEFAULT_PARTITIONS: i32 = 1;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    /// topic -> partitions -> log
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, i32), i64>,
    /// topic -> number of upcoming publishes to reject
    publish_failures: HashMap<String, usize>,
}

impl State {
    fn ensure_topic(&mut self, name: &str, partitions: i32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize])
    }
}

/// In-memory broker shared by producers and consumers through `Arc`
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    default_partitions: i32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Auto-created topics get `partitions` partitions
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            default_partitions: partitions.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("memory broker state poisoned".to_string()))
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject the next `count` publishes to `topic`
    pub fn fail_next_publishes(&self, topic: &str, count: usize) {
        self.lock_or_recover()
            .publish_failures
            .insert(topic.to_string(), count);
    }

    /// Every record on `topic`, ordered by publish time
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        let state = self.lock_or_recover();
        let mut out: Vec<InboundRecord> = state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .enumerate()
                    .flat_map(|(partition, log)| {
                        log.iter()
                            .enumerate()
                            .map(move |(offset, r)| to_inbound(topic, partition as i32, offset as i64, r))
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|r| (r.timestamp, r.partition, r.offset));
        out
    }

    /// Committed next-offset for a group on one partition
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock_or_recover()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Records of `topic` the group has not committed yet
    pub fn lag(&self, group_id: &str, topic: &str) -> usize {
        let state = self.lock_or_recover();
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };
        partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let committed = state
                    .committed
                    .get(&(group_id.to_string(), topic.to_string(), partition as i32))
                    .copied()
                    .unwrap_or(0);
                log.len().saturating_sub(committed.max(0) as usize)
            })
            .sum()
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.lock_or_recover()
            .topics
            .get(topic)
            .map(|p| p.len() as i32)
    }
}

fn to_inbound(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> InboundRecord {
    InboundRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(record.key.clone()),
        payload: record.payload.clone(),
        timestamp: record.timestamp,
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, record: OutboundRecord) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;

            if let Some(remaining) = state.publish_failures.get_mut(&record.topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BrokerError::Rejected {
                        topic: record.topic,
                        reason: "injected publish failure".to_string(),
                    });
                }
            }

            let partitions = state.ensure_topic(&record.topic, self.default_partitions);
            let idx = partition_for(&record.key, partitions.len());
            partitions[idx].push(StoredRecord {
                key: record.key,
                payload: record.payload,
                timestamp: Utc::now(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        {
            let mut state = self.lock()?;
            for topic in topics {
                state.ensure_topic(topic, self.default_partitions);
            }
        }
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topics: topics.to_vec(),
            positions: HashMap::new(),
            cursor: 0,
        }))
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        for spec in specs {
            state.ensure_topic(&spec.name, spec.partitions);
        }
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<String> = self.lock()?.topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Consumer handle returned by [`MemoryBroker::subscribe`]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    topics: Vec<String>,
    /// (topic, partition) -> next offset this consumer reads
    positions: HashMap<(String, i32), i64>,
    /// Round-robin start index over (topic, partition) pairs
    cursor: usize,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Result<Option<InboundRecord>, BrokerError> {
        let state = self.broker.lock()?;

        let mut slots: Vec<(String, i32)> = Vec::new();
        for topic in &self.topics {
            if let Some(partitions) = state.topics.get(topic) {
                for partition in 0..partitions.len() {
                    slots.push((topic.clone(), partition as i32));
                }
            }
        }
        if slots.is_empty() {
            return Ok(None);
        }

        for step in 0..slots.len() {
            let idx = (self.cursor + step) % slots.len();
            let (topic, partition) = &slots[idx];

            let position = match self.positions.get(&(topic.clone(), *partition)) {
                Some(p) => *p,
                None => state
                    .committed
                    .get(&(self.group_id.clone(), topic.clone(), *partition))
                    .copied()
                    .unwrap_or(0),
            };

            let log = &state.topics[topic][*partition as usize];
            if let Some(record) = log.get(position.max(0) as usize) {
                let inbound = to_inbound(topic, *partition, position, record);
                self.positions
                    .insert((topic.clone(), *partition), position + 1);
                self.cursor = idx + 1;
                return Ok(Some(inbound));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);

        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = notify.notified();

            if let Some(record) = self.try_next()? {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_next();
            }
        }
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        let mut state = self.broker.lock()?;
        state.committed.insert(
            (self.group_id.clone(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    async fn seek(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        self.positions
            .insert((record.topic.clone(), record.partition), record.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(topic: &str, key: &str, payload: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_publish_then_poll() {
        let broker = MemoryBroker::new();
        broker.publish(outbound("t", "k", "one")).await.unwrap();

        let mut consumer = broker.subscribe("g", &["t".to_string()]).await.unwrap();
        let record = consumer
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, b"one");
        assert_eq!(record.offset, 0);
        assert!(consumer
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_record_redelivered_to_new_consumer() {
        let broker = MemoryBroker::new();
        broker.publish(outbound("t", "k", "one")).await.unwrap();
        broker.publish(outbound("t", "k", "two")).await.unwrap();

        let mut first = broker.subscribe("g", &["t".to_string()]).await.unwrap();
        let one = first.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        first.commit(&one).await.unwrap();
        let _two = first.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        drop(first);

        let mut second = broker.subscribe("g", &["t".to_string()]).await.unwrap();
        let again = second.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.payload, b"two");
        assert_eq!(broker.lag("g", "t"), 1);
    }

    #[tokio::test]
    async fn test_seek_rewinds_partition() {
        let broker = MemoryBroker::new();
        broker.publish(outbound("t", "k", "one")).await.unwrap();

        let mut consumer = broker.subscribe("g", &["t".to_string()]).await.unwrap();
        let record = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        consumer.seek(&record).await.unwrap();
        let again = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.offset, record.offset);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.subscribe("g", &["t".to_string()]).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(outbound("t", "k", "late")).await.unwrap();
        });

        let record = consumer.poll(Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.unwrap().payload, b"late");
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes("t", 1);

        assert!(broker.publish(outbound("t", "k", "x")).await.is_err());
        assert!(broker.publish(outbound("t", "k", "x")).await.is_ok());
        assert_eq!(broker.records("t").len(), 1);
    }

    #[tokio::test]
    async fn test_create_topics_keeps_existing() {
        let broker = MemoryBroker::new();
        let specs = vec![TopicSpec {
            name: "t".to_string(),
            partitions: 3,
        }];
        broker.create_topics(&specs).await.unwrap();
        broker.create_topics(&specs).await.unwrap();
        assert_eq!(broker.partition_count("t"), Some(3));
        assert_eq!(broker.list_topics().await.unwrap(), vec!["t".to_string()]);
    }
}
