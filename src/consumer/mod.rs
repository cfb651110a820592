//! Queue consumers.
//!
//! One `QueueConsumer` serves one queue: it pulls deliveries one at a time
//! (prefetch 1 by default), invokes the bound handler with a fresh
//! `MessageContext`, and settles each delivery according to its
//! `FailurePolicy`. Handler failures never escape the loop.
//!
//! ```text
//! Idle -> Dispatched -> { Acked | NackedRequeue | NackedDrop }
//! ```

mod handler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

pub use handler::{
    EventHandler, FailurePolicy, HandlerError, JsonHandler, MessageContext, MessageHandler,
};

use crate::bus::{Broker, BusError, Delivery, Disposition, QueueSpec};
use crate::wire::message_digest;

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Lifecycle of one delivery inside a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Dispatched,
    Acked,
    NackedRequeue,
    NackedDrop,
}

impl From<Disposition> for DeliveryState {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Ack => Self::Acked,
            Disposition::Requeue => Self::NackedRequeue,
            Disposition::Drop => Self::NackedDrop,
        }
    }
}

/// Bare requeue on transient failure; fatal failures are dropped so a
/// malformed or rejected payload is not redelivered forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequeueOnFailure;

#[async_trait]
impl FailurePolicy for RequeueOnFailure {
    async fn on_failure(
        &self,
        ctx: &MessageContext,
        _body: &Bytes,
        error: &HandlerError,
    ) -> Disposition {
        if error.is_fatal() {
            error!(
                queue = %ctx.queue,
                message_key = %ctx.message_key,
                error = %error,
                "Dropping message that cannot succeed"
            );
            Disposition::Drop
        } else {
            warn!(
                queue = %ctx.queue,
                message_key = %ctx.message_key,
                error = %error,
                "Handler failed, requeueing"
            );
            Disposition::Requeue
        }
    }
}

/// Consumer loop for one queue.
#[derive(Clone)]
pub struct QueueConsumer {
    broker: Arc<dyn Broker>,
    spec: QueueSpec,
    prefetch: u16,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<dyn FailurePolicy>,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        spec: QueueSpec,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<dyn FailurePolicy>,
    ) -> Self {
        Self {
            broker,
            spec,
            prefetch: DEFAULT_PREFETCH,
            handler,
            policy,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn queue(&self) -> &str {
        &self.spec.name
    }

    /// Handle one delivery and settle it. Returns the terminal state.
    pub async fn process(&self, delivery: Delivery) -> DeliveryState {
        let message_key = self
            .handler
            .message_key(&delivery.body)
            .unwrap_or_else(|| message_digest(&delivery.body));
        let ctx = MessageContext::for_delivery(&delivery, message_key);

        let span = tracing::info_span!(
            "bus.consume",
            queue = %ctx.queue,
            delivery_tag = ctx.delivery_tag,
            message_key = %ctx.message_key
        );

        async {
            debug!(state = ?DeliveryState::Dispatched, redelivered = ctx.redelivered, retries = ctx.retries, "Dispatching");

            let disposition = match self.handler.handle(&ctx, &delivery.body).await {
                Ok(()) => {
                    self.policy.on_success(&ctx).await;
                    Disposition::Ack
                }
                Err(e) => self.policy.on_failure(&ctx, &delivery.body, &e).await,
            };

            let state = DeliveryState::from(disposition);
            // Settle errors are logged by the delivery
            let _ = delivery.settle(disposition).await;
            debug!(state = ?state, "Settled");
            state
        }
        .instrument(span)
        .await
    }

    /// Declare the queue and process deliveries until the broker closes.
    ///
    /// Reconnects with exponential backoff and jitter when the consumer cannot
    /// be opened or its stream fails.
    pub async fn run(self) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();
        let queue = self.spec.name.clone();

        loop {
            match self.open().await {
                Ok(mut stream) => {
                    info!(queue = %queue, prefetch = self.prefetch, "Consumer connected, processing messages");
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    let mut state = DeliveryState::Idle;
                    while let Some(delivery) = stream.next().await {
                        match delivery {
                            Ok(delivery) => {
                                state = self.process(delivery).await;
                            }
                            Err(e) => {
                                error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = %queue, last_state = ?state, "Consumer stream ended");
                }
                Err(BusError::Closed) => {
                    info!(queue = %queue, "Broker closed, stopping consumer");
                    return;
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        queue = %queue,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Brief pause before reconnecting after stream end (not error)
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    async fn open(&self) -> crate::bus::Result<crate::bus::DeliveryStream> {
        self.broker.declare_queue(&self.spec).await?;
        self.broker.consume(&self.spec.name, self.prefetch).await
    }

    /// Run the consumer loop as a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let queue = self.spec.name.clone();
        let handle = tokio::spawn(self.run());
        ConsumerHandle { queue, handle }
    }
}

/// Handle to a running consumer task.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    handle: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the consumer. In-flight handler work is abandoned.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the consumer loop to end.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }
}
