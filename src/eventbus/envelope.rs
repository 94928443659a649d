//! Wire envelope carried on every bus topic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use super::error::EventBusError;

/// Transport wrapper around a domain event.
///
/// `id` stays the same across every retry of one logical message and doubles as
/// the broker partition key. `payload` is kept as raw JSON so the bus never needs
/// to know the event schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,

    pub payload: Box<RawValue>,

    /// Attempts already made (0 on first delivery)
    #[serde(default)]
    pub retry: u32,

    /// Retry ceiling; 0 means "use the ladder length"
    #[serde(default)]
    pub max_retry: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    /// Wrap a domain event under a freshly generated id
    pub fn from_event<T: Serialize>(event: &T) -> Result<Self, EventBusError> {
        let payload = serde_json::value::to_raw_value(event).map_err(EventBusError::Encode)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            payload,
            retry: 0,
            max_retry: 0,
            last_error: None,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Decode the payload into a concrete event type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventBusError> {
        serde_json::from_str(self.payload.get()).map_err(EventBusError::Payload)
    }

    /// Pin `max_retry` to the ladder length when unset or larger than the ladder
    pub fn clamp_max_retry(&mut self, ladder_len: usize) {
        let ceiling = u32::try_from(ladder_len).unwrap_or(u32::MAX);
        if self.max_retry == 0 || self.max_retry > ceiling {
            self.max_retry = ceiling;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(self).map_err(EventBusError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventBusError> {
        serde_json::from_slice(bytes).map_err(EventBusError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_from_event_generates_id_and_wraps_payload() {
        let env = Envelope::from_event(&Ping { n: 7 }).unwrap();
        assert!(!env.id.is_empty());
        assert_eq!(env.retry, 0);
        assert_eq!(env.decode::<Ping>().unwrap(), Ping { n: 7 });
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let env = Envelope::from_bytes(br#"{"id":"abc","payload":{"n":1}}"#).unwrap();
        assert_eq!(env.id, "abc");
        assert_eq!(env.retry, 0);
        assert_eq!(env.max_retry, 0);
        assert!(env.last_error.is_none());
    }

    #[test]
    fn test_last_error_omitted_when_absent() {
        let env = Envelope::from_event(&Ping { n: 1 }).unwrap().with_id("x");
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"id": "x", "payload": {"n": 1}, "retry": 0, "max_retry": 0})
        );
    }

    #[test]
    fn test_clamp_max_retry() {
        let mut env = Envelope::from_event(&Ping { n: 1 }).unwrap();
        env.clamp_max_retry(5);
        assert_eq!(env.max_retry, 5);

        env.max_retry = 9;
        env.clamp_max_retry(5);
        assert_eq!(env.max_retry, 5);

        env.max_retry = 2;
        env.clamp_max_retry(5);
        assert_eq!(env.max_retry, 2);
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let env = Envelope::from_bytes(br#"{"id":"abc","payload":"not an object"}"#).unwrap();
        assert!(matches!(env.decode::<Ping>(), Err(EventBusError::Payload(_))));
        assert!(matches!(
            Envelope::from_bytes(b"{not json"),
            Err(EventBusError::Decode(_))
        ));
    }
}
