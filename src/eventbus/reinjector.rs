//! Retry reinjection loop.
//!
//! Consumes every retry topic of a base topic and republishes each envelope to
//! the base topic once its delay, encoded in the retry topic name, has elapsed
//! since the record was published. Records that are not ready yet are rewound
//! and looked at again after a short, bounded sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, Instrument, Span};

use super::broker::{Broker, Consumer, InboundRecord};
use super::dispatcher::{DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_TIMEOUT};
use super::envelope::Envelope;
use super::error::EventBusError;
use super::publisher::Publisher;
use super::shutdown::Shutdown;
use super::topic::{parse_retry_delay, Topic};

/// Shortest pause while waiting for a record to become ready
pub const MIN_REINJECT_WAIT: Duration = Duration::from_millis(50);

/// Longest pause while waiting for a record to become ready
pub const MAX_REINJECT_WAIT: Duration = Duration::from_millis(500);

/// Consumer-group id the retry worker uses for a base topic
pub fn retry_worker_group(group_prefix: &str, base: &str) -> String {
    format!("{}-retry-worker-{}", group_prefix, base.replace('.', "-"))
}

enum Step {
    Continue,
    Stop,
}

pub struct RetryReinjector {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    topic: Topic,
    group_id: String,
    poll_timeout: Duration,
    error_backoff: Duration,
    min_wait: Duration,
    max_wait: Duration,
    span: Span,
}

impl RetryReinjector {
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: Publisher,
        topic: Topic,
        group_id: impl Into<String>,
    ) -> Self {
        let group_id = group_id.into();
        let span = info_span!("retry_worker", base = %topic.base(), group = %group_id);
        Self {
            broker,
            publisher,
            topic,
            group_id,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            min_wait: MIN_REINJECT_WAIT,
            max_wait: MAX_REINJECT_WAIT,
            span,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Bounds of the sleep taken while a record is not ready yet
    pub fn with_wait_bounds(mut self, min_wait: Duration, max_wait: Duration) -> Self {
        self.min_wait = min_wait.min(max_wait);
        self.max_wait = max_wait;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run until shutdown or a fatal broker error
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), EventBusError> {
        self.run_loop(shutdown).instrument(self.span.clone()).await
    }

    async fn run_loop(&self, shutdown: Shutdown) -> Result<(), EventBusError> {
        let retry_topics = self.topic.retry_topics();
        if retry_topics.is_empty() {
            info!("Retry ladder is empty, nothing to reinject");
            shutdown.cancelled().await;
            return Ok(());
        }

        let mut consumer = self.broker.subscribe(&self.group_id, &retry_topics).await?;
        info!(topics = retry_topics.len(), "Retry worker started");

        loop {
            if shutdown.is_cancelled() {
                info!("Retry worker stopping");
                return Ok(());
            }

            let record = match consumer.poll(self.poll_timeout).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal consumer error");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    if !shutdown.sleep(self.error_backoff).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if let Step::Stop = self.handle_record(consumer.as_mut(), record, &shutdown).await {
                return Ok(());
            }
        }
    }

    async fn handle_record(
        &self,
        consumer: &mut dyn Consumer,
        record: InboundRecord,
        shutdown: &Shutdown,
    ) -> Step {
        let Some(ready_at) = ready_at(&record) else {
            error!(topic = %record.topic, offset = record.offset, "Unparseable retry topic, skipping");
            commit(consumer, &record).await;
            return Step::Continue;
        };

        let now = Utc::now();
        if now < ready_at {
            let remaining = (ready_at - now).to_std().unwrap_or(Duration::ZERO);
            let wait = remaining.clamp(self.min_wait, self.max_wait);
            if let Err(e) = consumer.seek(&record).await {
                error!(error = %e, offset = record.offset, "Seek failed");
            }
            return if shutdown.sleep(wait).await {
                Step::Continue
            } else {
                Step::Stop
            };
        }

        let envelope = match Envelope::from_bytes(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, topic = %record.topic, offset = record.offset, "Undecodable envelope, skipping");
                commit(consumer, &record).await;
                return Step::Continue;
            }
        };

        match self
            .publisher
            .publish(self.topic.base(), &envelope, shutdown)
            .await
        {
            Ok(()) => {
                info!(
                    event_id = %envelope.id,
                    retry = envelope.retry,
                    from = %record.topic,
                    "Reinjected to base topic"
                );
                commit(consumer, &record).await;
                Step::Continue
            }
            Err(EventBusError::Cancelled) => Step::Stop,
            Err(e) => {
                error!(event_id = %envelope.id, error = %e, "Reinjection publish failed, will retry");
                if let Err(e) = consumer.seek(&record).await {
                    error!(error = %e, offset = record.offset, "Seek failed");
                }
                if shutdown.sleep(self.error_backoff).await {
                    Step::Continue
                } else {
                    Step::Stop
                }
            }
        }
    }
}

/// Publish time plus the delay encoded in the record's topic name
fn ready_at(record: &InboundRecord) -> Option<DateTime<Utc>> {
    let delay = parse_retry_delay(&record.topic)?;
    let delay = chrono::Duration::from_std(delay).ok()?;
    record.timestamp.checked_add_signed(delay)
}

async fn commit(consumer: &mut dyn Consumer, record: &InboundRecord) {
    match consumer.commit(record).await {
        Ok(()) => debug!(topic = %record.topic, offset = record.offset, "Committed"),
        Err(e) => error!(error = %e, topic = %record.topic, offset = record.offset, "Offset commit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_worker_group_name() {
        assert_eq!(
            retry_worker_group("tech-letter", "tech-letter.post.events"),
            "tech-letter-retry-worker-tech-letter-post-events"
        );
    }

    #[test]
    fn test_ready_at_adds_topic_delay() {
        let published = Utc::now();
        let record = InboundRecord {
            topic: "a.events.retry.1m0s".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Vec::new(),
            timestamp: published,
        };
        assert_eq!(ready_at(&record), Some(published + chrono::Duration::seconds(60)));

        let bad = InboundRecord {
            topic: "a.events.retry.later".to_string(),
            ..record
        };
        assert_eq!(ready_at(&bad), None);
    }
}
