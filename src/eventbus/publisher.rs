use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::broker::{Broker, OutboundRecord};
use super::envelope::Envelope;
use super::error::EventBusError;
use super::shutdown::Shutdown;

/// Default wait for a broker acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializes envelopes and publishes them keyed by envelope id
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    ack_timeout: Duration,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish `envelope` to `topic` and wait for the acknowledgement.
    ///
    /// Returns `Cancelled` if shutdown fires first and `Timeout` if the broker
    /// does not answer within the ack timeout.
    pub async fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
        shutdown: &Shutdown,
    ) -> Result<(), EventBusError> {
        let record = OutboundRecord {
            topic: topic.to_string(),
            key: envelope.id.clone(),
            payload: envelope.to_bytes()?,
        };

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(EventBusError::Cancelled),
            result = tokio::time::timeout(self.ack_timeout, self.broker.publish(record)) => result,
        };

        match result {
            Ok(Ok(())) => {
                debug!(topic, event_id = %envelope.id, retry = envelope.retry, "Published");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EventBusError::Timeout {
                topic: topic.to_string(),
                timeout: self.ack_timeout,
            }),
        }
    }
}
