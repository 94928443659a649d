//! Topic naming and the retry ladder.
//!
//! Every base topic `<domain>.<entity>.events` owns one retry topic per ladder
//! slot (`<base>.retry.<delay>`) and a single dead-letter topic (`<base>.dlq`).

use std::sync::Arc;
use std::time::Duration;

use super::duration::{format_go_duration, parse_go_duration};
use super::error::EventBusError;

/// Infix separating a base topic from the retry delay
pub const RETRY_INFIX: &str = ".retry.";

/// Suffix of the dead-letter topic
pub const DLQ_SUFFIX: &str = ".dlq";

/// Base topic used when nothing is configured
pub const DEFAULT_BASE_TOPIC: &str = "tech-letter.post.events";

/// Ordered list of retry delays shared by every topic in the process.
///
/// Attempt `n` (1-based) waits `delays[n - 1]` before being reinjected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLadder {
    delays: Arc<[Duration]>,
}

impl Default for RetryLadder {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryLadder {
    /// Build a ladder from explicit delays
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays: delays.into(),
        }
    }

    /// 10s, 30s, 1m, 5m, 10m
    pub fn standard() -> Self {
        Self::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(600),
        ])
    }

    /// Parse a ladder from Go duration strings (`["10s", "1m0s"]`)
    pub fn parse<S: AsRef<str>>(delays: &[S]) -> Result<Self, EventBusError> {
        let parsed = delays
            .iter()
            .map(|d| parse_go_duration(d.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(parsed))
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay for a 1-based retry attempt
    pub fn delay_for(&self, attempt: u32) -> Result<Duration, EventBusError> {
        if attempt == 0 || attempt as usize > self.delays.len() {
            return Err(EventBusError::MaxRetryExceeded {
                attempt,
                ladder_len: self.delays.len(),
            });
        }
        Ok(self.delays[attempt as usize - 1])
    }
}

/// A base topic together with the ladder that shapes its retry topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    base: String,
    ladder: RetryLadder,
}

impl Topic {
    pub fn new(base: impl Into<String>, ladder: RetryLadder) -> Self {
        Self {
            base: base.into(),
            ladder,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ladder(&self) -> &RetryLadder {
        &self.ladder
    }

    /// `<base>.dlq`
    pub fn dlq(&self) -> String {
        format!("{}{}", self.base, DLQ_SUFFIX)
    }

    /// `<base>.retry.<delay>` for a 1-based attempt
    pub fn retry_topic(&self, attempt: u32) -> Result<String, EventBusError> {
        let delay = self.ladder.delay_for(attempt)?;
        Ok(retry_topic_name(&self.base, delay))
    }

    /// All retry topics of this base, in ladder order
    pub fn retry_topics(&self) -> Vec<String> {
        self.ladder
            .delays()
            .iter()
            .map(|delay| retry_topic_name(&self.base, *delay))
            .collect()
    }
}

fn retry_topic_name(base: &str, delay: Duration) -> String {
    format!("{}{}{}", base, RETRY_INFIX, format_go_duration(delay))
}

/// Recover the delay encoded in a retry topic name.
///
/// Returns `None` when the name has no retry suffix or the suffix is not a
/// valid duration.
pub fn parse_retry_delay(topic_name: &str) -> Option<Duration> {
    let idx = topic_name.rfind(RETRY_INFIX)?;
    let suffix = &topic_name[idx + RETRY_INFIX.len()..];
    if suffix.is_empty() {
        return None;
    }
    parse_go_duration(suffix).ok()
}

/// Recover the base topic from a retry topic name
pub fn base_of_retry_topic(topic_name: &str) -> Option<&str> {
    topic_name
        .rfind(RETRY_INFIX)
        .map(|idx| &topic_name[..idx])
        .filter(|base| !base.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic::new(DEFAULT_BASE_TOPIC, RetryLadder::standard())
    }

    #[test]
    fn test_standard_retry_topic_names() {
        let t = topic();
        assert_eq!(
            t.retry_topics(),
            vec![
                "tech-letter.post.events.retry.10s",
                "tech-letter.post.events.retry.30s",
                "tech-letter.post.events.retry.1m0s",
                "tech-letter.post.events.retry.5m0s",
                "tech-letter.post.events.retry.10m0s",
            ]
        );
        assert_eq!(t.dlq(), "tech-letter.post.events.dlq");
    }

    #[test]
    fn test_retry_topic_bounds() {
        let t = topic();
        assert_eq!(
            t.retry_topic(3).unwrap(),
            "tech-letter.post.events.retry.1m0s"
        );
        assert!(matches!(
            t.retry_topic(0),
            Err(EventBusError::MaxRetryExceeded { attempt: 0, .. })
        ));
        assert!(matches!(
            t.retry_topic(6),
            Err(EventBusError::MaxRetryExceeded {
                attempt: 6,
                ladder_len: 5
            })
        ));
    }

    #[test]
    fn test_parse_retry_delay_from_every_ladder_topic() {
        let t = topic();
        for (name, delay) in t.retry_topics().iter().zip(t.ladder().delays()) {
            assert_eq!(parse_retry_delay(name), Some(*delay));
        }
    }

    #[test]
    fn test_parse_retry_delay_uses_last_infix() {
        assert_eq!(
            parse_retry_delay("odd.retry.name.events.retry.30s"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            base_of_retry_topic("odd.retry.name.events.retry.30s"),
            Some("odd.retry.name.events")
        );
    }

    #[test]
    fn test_parse_retry_delay_rejects_malformed() {
        assert_eq!(parse_retry_delay("tech-letter.post.events"), None);
        assert_eq!(parse_retry_delay("tech-letter.post.events.retry."), None);
        assert_eq!(parse_retry_delay("tech-letter.post.events.retry.soon"), None);
        assert_eq!(parse_retry_delay("tech-letter.post.events.dlq"), None);
    }

    #[test]
    fn test_ladder_parse() {
        let ladder = RetryLadder::parse(&["20ms", "1m0s"]).unwrap();
        assert_eq!(
            ladder.delays(),
            &[Duration::from_millis(20), Duration::from_secs(60)]
        );
        assert!(RetryLadder::parse(&["ten seconds"]).is_err());
    }
}
