use crate::domain::PostEvent;
use crate::eventbus::{Envelope, EventBusError, Publisher, Shutdown, Topic};

/// Publishes domain events to the post events base topic
#[derive(Clone)]
pub struct EventEmitter {
    publisher: Publisher,
    topic: Topic,
    source: String,
}

impl EventEmitter {
    pub fn new(publisher: Publisher, topic: Topic, source: impl Into<String>) -> Self {
        Self {
            publisher,
            topic,
            source: source.into(),
        }
    }

    /// Service name stamped into emitted events
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wrap `event` in a fresh envelope and publish it to the base topic
    pub async fn emit(&self, event: &PostEvent, shutdown: &Shutdown) -> Result<Envelope, EventBusError> {
        let envelope = Envelope::from_event(event)?
            .with_max_retry(u32::try_from(self.topic.ladder().len()).unwrap_or(u32::MAX));
        self.publisher
            .publish(self.topic.base(), &envelope, shutdown)
            .await?;
        Ok(envelope)
    }
}
