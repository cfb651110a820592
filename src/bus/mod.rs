//! Message broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: queue declaration, fire-and-forget publish, prefetch-limited consume
//! - `Delivery` / `Acker`: one received message and its settlement handle
//! - Queue and message descriptors shared by every backend
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::warn;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, ConnectionManager};
pub use channel::ChannelBroker;

/// Header carrying the poison-path retry count.
pub const RETRIES_HEADER: &str = "x-retries";

/// Content type of every message this crate publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Publish to '{queue}' failed: {message}")]
    Publish { queue: String, message: String },

    #[error("Consume from '{queue}' failed: {message}")]
    Consume { queue: String, message: String },

    #[error("Failed to settle delivery {delivery_tag}: {message}")]
    Settle { delivery_tag: u64, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker closed")]
    Closed,
}

// ============================================================================
// Queue and message descriptors
// ============================================================================

/// Declaration parameters for a queue.
///
/// Declaring is idempotent: publishers and consumers both declare the queues
/// they touch before using them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Queue-level message TTL (`x-message-ttl`).
    pub message_ttl: Option<Duration>,
    /// Queue that expired or rejected messages are routed to through the
    /// default exchange (`x-dead-letter-routing-key`).
    pub dead_letter_to: Option<String>,
}

impl QueueSpec {
    /// Non-durable, non-exclusive queue with no TTL.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            message_ttl: None,
            dead_letter_to: None,
        }
    }

    /// Delay queue: messages expire after `ttl` and are routed to `target`.
    pub fn delay(name: impl Into<String>, ttl: Duration, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: Some(ttl),
            dead_letter_to: Some(target.into()),
        }
    }
}

/// Broker-level headers this crate reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Poison-path retry count (`x-retries`).
    pub retries: Option<u32>,
}

impl MessageHeaders {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries: Some(retries),
        }
    }

    /// Retry count, defaulting to 0 when the header is absent.
    pub fn retries_or_default(&self) -> u32 {
        self.retries.unwrap_or(0)
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub headers: MessageHeaders,
    /// Per-message expiration (AMQP `expiration` property, milliseconds).
    pub expiration: Option<Duration>,
    pub content_type: &'static str,
}

impl OutboundMessage {
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            headers: MessageHeaders::default(),
            expiration: None,
            content_type: JSON_CONTENT_TYPE,
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Outcome of processing a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Negative-acknowledge and let the broker redeliver it.
    Requeue,
    /// Negative-acknowledge without requeue.
    Drop,
}

/// Settlement handle for one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue, not yet settled.
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: MessageHeaders,
    pub body: Bytes,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        headers: MessageHeaders,
        body: Bytes,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            queue: queue.into(),
            delivery_tag,
            redelivered,
            headers,
            body,
            acker,
        }
    }

    /// Apply a disposition. Consumes the delivery so it is settled exactly once.
    pub async fn settle(self, disposition: Disposition) -> Result<()> {
        let result = match disposition {
            Disposition::Ack => self.acker.ack().await,
            Disposition::Requeue => self.acker.nack(true).await,
            Disposition::Drop => self.acker.nack(false).await,
        };
        if let Err(ref e) = result {
            warn!(
                queue = %self.queue,
                delivery_tag = self.delivery_tag,
                error = %e,
                "Failed to settle delivery"
            );
        }
        result
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Broker trait
// ============================================================================

/// Interface to the message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: In-process queues for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Safe to repeat.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Send a message to a named queue through the default exchange.
    ///
    /// Fire-and-forget: does not wait for a publisher confirm and does not
    /// mark the message persistent.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Start consuming a queue with at most `prefetch` unacknowledged
    /// deliveries in flight.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_queue_spec() {
        let spec = QueueSpec::transient("rider-info");
        assert_eq!(spec.name, "rider-info");
        assert!(!spec.durable);
        assert!(spec.message_ttl.is_none());
        assert!(spec.dead_letter_to.is_none());
    }

    #[test]
    fn test_delay_queue_spec_routes_back() {
        let spec = QueueSpec::delay("retry-poison-1", Duration::from_secs(2), "rider-info-poison");
        assert_eq!(spec.message_ttl, Some(Duration::from_secs(2)));
        assert_eq!(spec.dead_letter_to.as_deref(), Some("rider-info-poison"));
    }

    #[test]
    fn test_retries_default_to_zero() {
        assert_eq!(MessageHeaders::default().retries_or_default(), 0);
        assert_eq!(MessageHeaders::with_retries(2).retries_or_default(), 2);
    }

    #[test]
    fn test_outbound_builder() {
        let msg = OutboundMessage::json("{}")
            .with_headers(MessageHeaders::with_retries(1))
            .with_expiration(Duration::from_millis(4000));
        assert_eq!(msg.content_type, JSON_CONTENT_TYPE);
        assert_eq!(msg.headers.retries, Some(1));
        assert_eq!(msg.expiration, Some(Duration::from_millis(4000)));
    }
}
