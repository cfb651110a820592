//! Messaging configuration types.

use serde::Deserialize;

use crate::poison::DELAY_QUEUE_PREFIX;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process queues (no external broker).
    Channel,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
    /// Unacknowledged deliveries per consumer.
    pub prefetch: u16,
    /// Queue names, one per logical stream.
    pub queues: QueueNames,
    /// Prefix of the delay queues feeding the poison queue.
    pub delay_queue_prefix: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Amqp,
            amqp: AmqpConfig::default(),
            prefetch: 1,
            queues: QueueNames::default(),
            delay_queue_prefix: DELAY_QUEUE_PREFIX.to_string(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
        }
    }
}

/// Names of the consumed queues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    /// Rider events handled through the retry tracker.
    pub events: String,
    /// Rider events that exhausted their primary retries.
    pub poison: String,
    /// Chunked file transfers.
    pub chunks: String,
    /// Licence plate renames; the stream is disabled when unset.
    pub plates: Option<String>,
    /// Licence plate renames that exhausted their primary retries.
    pub plates_poison: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            events: "rider-info".to_string(),
            poison: "rider-info-poison".to_string(),
            chunks: "image-stream".to_string(),
            plates: None,
            plates_poison: "licence-plate-update-poison".to_string(),
        }
    }
}
