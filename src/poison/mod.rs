//! Poison queue escalation.
//!
//! Messages that keep failing on a primary queue are moved to a poison
//! queue, which is consumed independently with a second, delay-based retry
//! ladder before the message is finally dropped.
//!
//! ## Ladder
//!
//! ```text
//! primary: fail x3 (immediate requeue) -> poison queue
//! poison:  fail -> {prefix}-1 (2u) -> poison
//!          fail -> {prefix}-2 (4u) -> poison
//!          fail -> {prefix}-3 (8u) -> poison
//!          fail -> dropped (logged)
//! ```
//!
//! Delay queues hold a message for their TTL, then the broker dead-letters it
//! back into the poison queue. The table is fixed and declared once at
//! startup. The retry count travels in the `x-retries` header because each
//! hop goes through a different queue.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, info, warn};

use crate::bus::{self, Broker, Disposition, MessageHeaders, OutboundMessage, QueueSpec};
use crate::consumer::{FailurePolicy, HandlerError, MessageContext};
use crate::retry::{RetryDecision, RetryPolicy, RetryTracker};

/// Default prefix of delay queue names. Full name: `{prefix}-{retry}`.
pub const DELAY_QUEUE_PREFIX: &str = "retry-poison";

/// Build the delay queue name for a retry number.
pub fn delay_queue_name(prefix: &str, retry: u32) -> String {
    format!("{}-{}", prefix, retry)
}

// ============================================================================
// Primary path
// ============================================================================

/// Failure policy for primary queues with a bounded retry budget.
///
/// Failures are counted per message key. Below the budget the delivery is
/// requeued for an immediate retry; once the budget is spent (or the failure
/// is fatal) the raw body is published to the poison queue, the count is
/// cleared and the original delivery is acknowledged.
pub struct PoisonEscalator {
    broker: Arc<dyn Broker>,
    tracker: Arc<RetryTracker>,
    poison: QueueSpec,
}

impl PoisonEscalator {
    pub fn new(broker: Arc<dyn Broker>, tracker: Arc<RetryTracker>, poison: QueueSpec) -> Self {
        Self {
            broker,
            tracker,
            poison,
        }
    }

    pub fn tracker(&self) -> &Arc<RetryTracker> {
        &self.tracker
    }

    pub fn poison_queue(&self) -> &str {
        &self.poison.name
    }

    async fn move_to_poison(&self, body: &Bytes) -> bus::Result<()> {
        self.broker.declare_queue(&self.poison).await?;
        self.broker
            .publish(&self.poison.name, OutboundMessage::json(body.clone()))
            .await
    }

    async fn escalate(&self, ctx: &MessageContext, body: &Bytes, attempts: u32) -> Disposition {
        match self.move_to_poison(body).await {
            Ok(()) => {
                self.tracker.clear(&ctx.message_key);
                error!(
                    queue = %ctx.queue,
                    message_key = %ctx.message_key,
                    attempt = attempts,
                    poison_queue = %self.poison.name,
                    "Retry budget exhausted, moved message to poison queue"
                );
                Disposition::Ack
            }
            Err(e) => {
                // Count is kept so the next delivery escalates again
                warn!(
                    queue = %ctx.queue,
                    message_key = %ctx.message_key,
                    error = %e,
                    "Failed to publish to poison queue, requeueing"
                );
                Disposition::Requeue
            }
        }
    }
}

#[async_trait]
impl FailurePolicy for PoisonEscalator {
    async fn on_success(&self, ctx: &MessageContext) {
        self.tracker.clear(&ctx.message_key);
    }

    async fn on_failure(
        &self,
        ctx: &MessageContext,
        body: &Bytes,
        error: &HandlerError,
    ) -> Disposition {
        if error.is_fatal() {
            let attempts = self.tracker.attempts(&ctx.message_key) + 1;
            warn!(
                queue = %ctx.queue,
                message_key = %ctx.message_key,
                error = %error,
                "Handler failed permanently"
            );
            return self.escalate(ctx, body, attempts).await;
        }

        match self.tracker.record_failure(&ctx.message_key) {
            RetryDecision::Retry { attempt } => {
                warn!(
                    queue = %ctx.queue,
                    message_key = %ctx.message_key,
                    attempt,
                    error = %error,
                    "Handler failed, requeueing"
                );
                Disposition::Requeue
            }
            RetryDecision::Escalate { attempts } => self.escalate(ctx, body, attempts).await,
        }
    }
}

// ============================================================================
// Poison path
// ============================================================================

/// Fixed table of delay queues that dead-letter back into the poison queue.
#[derive(Debug, Clone)]
pub struct DelayLadder {
    prefix: String,
    target: String,
    queues: Vec<QueueSpec>,
}

impl DelayLadder {
    /// One delay queue per poison retry; retry `n` waits `2^n` backoff units.
    pub fn new(prefix: impl Into<String>, target: impl Into<String>, policy: &RetryPolicy) -> Self {
        let prefix = prefix.into();
        let target = target.into();
        let queues = (1..=policy.max_poison_retries)
            .map(|retry| {
                QueueSpec::delay(
                    delay_queue_name(&prefix, retry),
                    policy.poison_delay(retry),
                    target.clone(),
                )
            })
            .collect();
        Self {
            prefix,
            target,
            queues,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The poison queue expired messages return to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Delay queue for retry `retry` (1-based).
    pub fn queue_for(&self, retry: u32) -> Option<&QueueSpec> {
        let index = usize::try_from(retry.checked_sub(1)?).ok()?;
        self.queues.get(index)
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Declare every delay queue.
    pub async fn declare_all(&self, broker: &dyn Broker) -> bus::Result<()> {
        for spec in &self.queues {
            broker.declare_queue(spec).await?;
        }
        info!(
            prefix = %self.prefix,
            target = %self.target,
            count = self.queues.len(),
            "Delay queues declared"
        );
        Ok(())
    }
}

/// Failure policy for the poison queue.
///
/// Reads the retry count from the `x-retries` header. While the budget
/// allows, the body is re-published to the next delay queue with the count
/// incremented and the current delivery is dropped. Once the budget is spent
/// the message is dropped for good; the log line is the only record.
pub struct DelayedRetry {
    broker: Arc<dyn Broker>,
    ladder: Arc<DelayLadder>,
    policy: RetryPolicy,
}

impl DelayedRetry {
    pub fn new(broker: Arc<dyn Broker>, ladder: Arc<DelayLadder>, policy: RetryPolicy) -> Self {
        Self {
            broker,
            ladder,
            policy,
        }
    }

    async fn schedule(&self, ctx: &MessageContext, body: &Bytes, retry: u32) -> Disposition {
        let Some(spec) = self.ladder.queue_for(retry) else {
            error!(
                queue = %ctx.queue,
                message_key = %ctx.message_key,
                retries = retry,
                "No delay queue for retry, message dropped"
            );
            return Disposition::Drop;
        };

        let delay = self.policy.poison_delay(retry);
        let message = OutboundMessage::json(body.clone())
            .with_headers(MessageHeaders::with_retries(retry))
            .with_expiration(delay);

        match self.broker.publish(&spec.name, message).await {
            Ok(()) => {
                warn!(
                    queue = %ctx.queue,
                    message_key = %ctx.message_key,
                    retries = retry,
                    delay_ms = %delay.as_millis(),
                    delay_queue = %spec.name,
                    "Scheduled delayed retry"
                );
                Disposition::Drop
            }
            Err(e) => {
                warn!(
                    queue = %ctx.queue,
                    message_key = %ctx.message_key,
                    error = %e,
                    "Failed to schedule delayed retry, requeueing"
                );
                Disposition::Requeue
            }
        }
    }
}

#[async_trait]
impl FailurePolicy for DelayedRetry {
    async fn on_failure(
        &self,
        ctx: &MessageContext,
        body: &Bytes,
        error: &HandlerError,
    ) -> Disposition {
        if !error.is_fatal() && self.policy.allows_poison_retry(ctx.retries) {
            return self.schedule(ctx, body, ctx.retries + 1).await;
        }

        error!(
            queue = %ctx.queue,
            message_key = %ctx.message_key,
            retries = ctx.retries,
            error = %error,
            "Message dropped after exhausting retries"
        );
        Disposition::Drop
    }
}
