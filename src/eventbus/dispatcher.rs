//! Base-topic consumer loop.
//!
//! Each delivered record is decoded, handed to the registered handler, and
//! committed only once the handler succeeded or the failure was durably
//! escalated to a retry topic or the DLQ.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::broker::{Broker, BrokerError, Consumer, InboundRecord};
use super::envelope::Envelope;
use super::error::{EventBusError, HandlerError};
use super::publisher::Publisher;
use super::shutdown::Shutdown;
use super::topic::Topic;

/// Default poll tick
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a broker error before polling again
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Processes one decoded event
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(
        &self,
        event: E,
        envelope: &Envelope,
        shutdown: &Shutdown,
    ) -> Result<(), HandlerError>;
}

/// What to do with the consumed record after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Commit,
    Redeliver,
    Stop,
}

/// Consumes one base topic for one consumer group
pub struct Dispatcher<E> {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    topic: Topic,
    group_id: String,
    handler: Arc<dyn EventHandler<E>>,
    poll_timeout: Duration,
    error_backoff: Duration,
    span: Span,
    _event: PhantomData<fn() -> E>,
}

impl<E> Dispatcher<E>
where
    E: DeserializeOwned + Send + 'static,
{
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: Publisher,
        topic: Topic,
        group_id: impl Into<String>,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Self {
        let group_id = group_id.into();
        let span = info_span!("dispatcher", topic = %topic.base(), group = %group_id);
        Self {
            broker,
            publisher,
            topic,
            group_id,
            handler,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            span,
            _event: PhantomData,
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

    /// Replace the span every log line of this dispatcher is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Run until shutdown or a fatal broker error
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), EventBusError> {
        self.run_loop(shutdown).instrument(self.span.clone()).await
    }

    async fn run_loop(&self, shutdown: Shutdown) -> Result<(), EventBusError> {
        let topics = vec![self.topic.base().to_string()];
        let mut consumer = self.broker.subscribe(&self.group_id, &topics).await?;
        info!("Dispatcher started");

        loop {
            if shutdown.is_cancelled() {
                info!("Dispatcher stopping");
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

            match self.process(&record, &shutdown).await {
                Disposition::Commit => commit(consumer.as_mut(), &record).await,
                Disposition::Redeliver => {
                    if let Err(e) = consumer.seek(&record).await {
                        error!(error = %e, offset = record.offset, "Seek failed");
                    }
                    if !shutdown.sleep(self.error_backoff).await {
                        return Ok(());
                    }
                }
                Disposition::Stop => {
                    info!(offset = record.offset, "Shutdown during processing, leaving record uncommitted");
                    return Ok(());
                }
            }
        }
    }

    async fn process(&self, record: &InboundRecord, shutdown: &Shutdown) -> Disposition {
        let mut envelope = match Envelope::from_bytes(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    error = %e,
                    partition = record.partition,
                    offset = record.offset,
                    "Undecodable envelope, skipping"
                );
                return Disposition::Commit;
            }
        };
        envelope.clamp_max_retry(self.topic.ladder().len());

        let event: E = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, event_id = %envelope.id, "Undecodable payload, skipping");
                return Disposition::Commit;
            }
        };

        if envelope.retry > 0 {
            info!(
                event_id = %envelope.id,
                retry = envelope.retry,
                max_retry = envelope.max_retry,
                "Processing retried event"
            );
        } else {
            debug!(event_id = %envelope.id, "Processing event");
        }

        match self.handler.handle(event, &envelope, shutdown).await {
            Ok(()) => {
                debug!(event_id = %envelope.id, "Event handled");
                Disposition::Commit
            }
            Err(HandlerError::Cancelled) => Disposition::Stop,
            Err(HandlerError::Failed(cause)) => self.escalate(envelope, &cause, shutdown).await,
        }
    }

    /// Route a failed envelope to its next retry slot or to the DLQ
    async fn escalate(
        &self,
        mut envelope: Envelope,
        cause: &anyhow::Error,
        shutdown: &Shutdown,
    ) -> Disposition {
        envelope.last_error = Some(cause.to_string());
        let next = envelope.retry + 1;

        let target = if next > envelope.max_retry {
            error!(
                event_id = %envelope.id,
                retry = envelope.retry,
                error = %cause,
                "Retries exhausted, sending to DLQ"
            );
            self.topic.dlq()
        } else {
            match self.topic.retry_topic(next) {
                Ok(retry_topic) => {
                    envelope.retry = next;
                    warn!(
                        event_id = %envelope.id,
                        retry = next,
                        max_retry = envelope.max_retry,
                        topic = %retry_topic,
                        error = %cause,
                        "Handler failed, scheduling retry"
                    );
                    retry_topic
                }
                Err(e) => {
                    error!(event_id = %envelope.id, error = %e, "No retry slot, sending to DLQ");
                    self.topic.dlq()
                }
            }
        };

        match self.publisher.publish(&target, &envelope, shutdown).await {
            Ok(()) => Disposition::Commit,
            Err(EventBusError::Cancelled) => Disposition::Stop,
            Err(e) => {
                error!(
                    event_id = %envelope.id,
                    topic = %target,
                    error = %e,
                    "Escalation publish failed, record will be redelivered"
                );
                Disposition::Redeliver
            }
        }
    }
}

async fn commit(consumer: &mut dyn Consumer, record: &InboundRecord) {
    if let Err(e) = consumer.commit(record).await {
        log_commit_error(&e, record);
    }
}

fn log_commit_error(e: &BrokerError, record: &InboundRecord) {
    error!(
        error = %e,
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        "Offset commit failed"
    );
}
