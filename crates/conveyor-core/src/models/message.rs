//! Wire envelope for task messages.
//!
//! A [`TaskMessage`] is immutable once published: the broker owns it while it
//! is enqueued and logical ownership transfers to a worker on delivery. A
//! [`BrokerDelivery`] wraps a message with the opaque delivery tag the broker
//! needs to ack or reject it; a delivery must be acknowledged exactly once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type used when a producer does not specify one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Payload bytes travel base64-encoded so that the envelope stays readable
/// from any language that can parse JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    /// Unique message ID. String on the wire so that non-UUID producers
    /// interoperate; Conveyor producers use UUID v4.
    pub id: String,
    pub task_name: String,
    #[serde(with = "base64_bytes")]
    pub args: Vec<u8>,
    pub content_type: String,
    pub sent_at: DateTime<Utc>,
    pub queue: String,
    /// 0 (lowest) to 9 (highest).
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl TaskMessage {
    /// Start building a message for the named task.
    pub fn builder(task_name: impl Into<String>) -> TaskMessageBuilder {
        TaskMessageBuilder::new(task_name)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Copy of this message with the retry counter advanced. Used when a
    /// Retry outcome is republished through the delayed store.
    pub fn with_incremented_retries(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = next.retry_count.saturating_add(1);
        next
    }
}

/// Builder for [`TaskMessage`]. Produces a message with a fresh UUID, the
/// current timestamp and the default queue unless overridden.
#[derive(Debug, Clone)]
pub struct TaskMessageBuilder {
    message: TaskMessage,
}

impl TaskMessageBuilder {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            message: TaskMessage {
                id: Uuid::new_v4().to_string(),
                task_name: task_name.into(),
                args: Vec::new(),
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                sent_at: Utc::now(),
                queue: "default".to_string(),
                priority: 5,
                retry_count: 0,
                max_retries: 3,
                eta: None,
                expires: None,
                parent_id: None,
                root_id: None,
                correlation_id: None,
                tenant_id: None,
                partition_key: None,
                headers: HashMap::new(),
            },
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.message.id = id.into();
        self
    }

    /// Serialize a typed input as the message payload (JSON).
    pub fn args_json<T: Serialize>(mut self, input: &T) -> Result<Self, serde_json::Error> {
        self.message.args = serde_json::to_vec(input)?;
        self.message.content_type = DEFAULT_CONTENT_TYPE.to_string();
        Ok(self)
    }

    pub fn args_raw(mut self, args: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.message.args = args;
        self.message.content_type = content_type.into();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.message.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.message.priority = priority.min(9);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.message.max_retries = max_retries;
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.message.eta = Some(eta);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.message.expires = Some(expires);
        self
    }

    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.message.parent_id = Some(parent_id.into());
        self
    }

    pub fn root_id(mut self, root_id: impl Into<String>) -> Self {
        self.message.root_id = Some(root_id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.message.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.message.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.message.partition_key = Some(partition_key.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> TaskMessage {
        self.message
    }
}

/// A delivered message plus the broker's opaque delivery tag.
///
/// Lifetime spans from pull to ack/nack. The broker that produced it is the
/// only party that can interpret `delivery_tag`.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub message: TaskMessage,
    pub delivery_tag: String,
    pub queue: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let msg = TaskMessage::builder("reports.generate").build();
        assert_eq!(msg.task_name, "reports.generate");
        assert_eq!(msg.queue, "default");
        assert_eq!(msg.priority, 5);
        assert_eq!(msg.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(msg.retry_count, 0);
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn priority_is_clamped_to_nine() {
        let msg = TaskMessage::builder("t").priority(200).build();
        assert_eq!(msg.priority, 9);
    }

    #[test]
    fn args_round_trip_base64() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Input {
            n: u32,
        }

        let msg = TaskMessage::builder("t")
            .args_json(&Input { n: 42 })
            .unwrap()
            .build();
        let encoded = serde_json::to_string(&msg).unwrap();
        // Raw payload bytes must not appear in the envelope.
        assert!(!encoded.contains("\"n\":42"));

        let decoded: TaskMessage = serde_json::from_str(&encoded).unwrap();
        let input: Input = serde_json::from_slice(&decoded.args).unwrap();
        assert_eq!(input, Input { n: 42 });
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let msg = TaskMessage::builder("t")
            .expires(now - chrono::Duration::seconds(1))
            .build();
        assert!(msg.is_expired(now));

        let msg = TaskMessage::builder("t")
            .expires(now + chrono::Duration::seconds(60))
            .build();
        assert!(!msg.is_expired(now));

        let msg = TaskMessage::builder("t").build();
        assert!(!msg.is_expired(now));
    }

    #[test]
    fn increment_retries_copies_message() {
        let msg = TaskMessage::builder("t").max_retries(2).build();
        let next = msg.with_incremented_retries();
        assert_eq!(next.retry_count, 1);
        assert_eq!(msg.retry_count, 0);
        assert!(!next.retries_exhausted());
        assert!(next.with_incremented_retries().retries_exhausted());
    }
}
