//! Handler interface exposed to domain collaborators.
//!
//! The consumer core only looks at the outcome of a handler call. The outcome
//! is typed so failure policies can tell transient failures from ones that
//! will never succeed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::bus::{Delivery, Disposition};
use crate::wire::{self, Keyed};

/// Why a handler did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Network or downstream-service failure; another attempt may succeed.
    #[error("Transient failure: {0}")]
    Retryable(String),

    /// Business rule violation, e.g. the referenced entity does not exist.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The body could not be decoded.
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Retrying cannot change the outcome.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Retryable(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Per-message context handed to handlers.
///
/// Built fresh for every delivery by the consumer task; it carries nothing
/// from any inbound request.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub queue: String,
    /// Natural key of the payload, or a body digest when it has none.
    pub message_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Value of the `x-retries` header (0 when absent).
    pub retries: u32,
    pub received_at: DateTime<Utc>,
}

impl MessageContext {
    pub fn for_delivery(delivery: &Delivery, message_key: String) -> Self {
        Self {
            queue: delivery.queue.clone(),
            message_key,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            retries: delivery.headers.retries_or_default(),
            received_at: Utc::now(),
        }
    }
}

/// Processes raw message bodies.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext, body: &[u8]) -> Result<(), HandlerError>;

    /// Natural key used for retry counting. `None` falls back to a body digest.
    fn message_key(&self, _body: &[u8]) -> Option<String> {
        None
    }
}

/// Processes one typed event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: DeserializeOwned + Keyed + Send + 'static;

    async fn handle(&self, ctx: &MessageContext, event: Self::Event) -> Result<(), HandlerError>;
}

/// Adapts an `EventHandler` to JSON bodies.
pub struct JsonHandler<H>(pub H);

impl<H> JsonHandler<H> {
    pub fn new(handler: H) -> Self {
        Self(handler)
    }

    pub fn inner(&self) -> &H {
        &self.0
    }
}

#[async_trait]
impl<H: EventHandler> MessageHandler for JsonHandler<H> {
    async fn handle(&self, ctx: &MessageContext, body: &[u8]) -> Result<(), HandlerError> {
        let event: H::Event = wire::decode(body)?;
        self.0.handle(ctx, event).await
    }

    fn message_key(&self, body: &[u8]) -> Option<String> {
        wire::decode::<H::Event>(body)
            .ok()
            .map(|event| event.message_key())
    }
}

/// Maps a handler outcome to a disposition.
///
/// Implementations:
/// - `RequeueOnFailure`: bare requeue, used for streams without a retry budget
/// - `PoisonEscalator`: counted retries, then the poison queue
/// - `DelayedRetry`: header-counted delayed retries, then drop
#[async_trait]
pub trait FailurePolicy: Send + Sync {
    async fn on_success(&self, _ctx: &MessageContext) {}

    async fn on_failure(
        &self,
        ctx: &MessageContext,
        body: &Bytes,
        error: &HandlerError,
    ) -> Disposition;
}
