//! In-process broker for standalone mode.
//!
//! Keeps per-queue FIFO buffers behind a tokio mutex and reproduces the
//! RabbitMQ behaviour the consumption layer depends on:
//! - prefetch-limited delivery (a permit is held until the delivery is settled)
//! - ack / nack with requeue (redelivered at the head of the queue) / nack without requeue
//! - per-message and per-queue TTL, with expired messages dead-lettered to
//!   the queue named by the queue's `dead_letter_to`
//! - publishes to undeclared queues are dropped, as the default exchange does
//!
//! Ideal for local development and testing without external dependencies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{
    Acker, Broker, BusError, Delivery, DeliveryStream, OutboundMessage, QueueSpec, Result,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    /// Bumped on every enqueue, so expiry timers armed for an earlier stay
    /// in the queue do not fire for a requeued copy.
    generation: u64,
    message: OutboundMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Every accepted publish, in order, per queue.
    history: HashMap<String, Vec<OutboundMessage>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    next_tag: AtomicU64,
}

impl Inner {
    /// Append a message to a declared queue and arm its expiry timer.
    ///
    /// Must be called with the state lock held; returns false when the queue
    /// does not exist.
    fn enqueue(
        self: &Arc<Self>,
        state: &mut BrokerState,
        queue: &str,
        mut stored: StoredMessage,
        front: bool,
    ) -> bool {
        let Some(q) = state.queues.get_mut(queue) else {
            return false;
        };

        let ttl = match (stored.message.expiration, q.spec.message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        stored.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let generation = stored.generation;
        if front {
            q.ready.push_front(stored);
        } else {
            q.ready.push_back(stored);
        }

        if let Some(ttl) = ttl {
            self.arm_expiry(queue.to_string(), generation, ttl);
        }
        self.notify.notify_waiters();
        true
    }

    fn arm_expiry(self: &Arc<Self>, queue: String, generation: u64, ttl: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = inner.state.lock().await;
            if state.closed {
                return;
            }

            let Some(q) = state.queues.get_mut(&queue) else {
                return;
            };
            let Some(pos) = q.ready.iter().position(|m| m.generation == generation) else {
                // Consumed, or requeued under a newer generation
                return;
            };
            let Some(mut expired) = q.ready.remove(pos) else {
                return;
            };
            let target = q.spec.dead_letter_to.clone();

            match target {
                Some(target) => {
                    // Dead-lettering strips the per-message expiration
                    expired.message.expiration = None;
                    expired.redelivered = false;
                    debug!(queue = %queue, target = %target, "Message expired, dead-lettering");
                    if !inner.enqueue(&mut state, &target, expired, false) {
                        warn!(target = %target, "Dead-letter target not declared, message dropped");
                    }
                }
                None => {
                    debug!(queue = %queue, "Message expired with no dead-letter target, dropped");
                }
            }
        });
    }
}

/// In-process message broker.
///
/// Cloning shares the same queues.
#[derive(Clone, Debug, Default)]
pub struct ChannelBroker {
    inner: Arc<Inner>,
}

impl ChannelBroker {
    /// Create a new empty broker.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Number of ready (undelivered) messages in a queue.
    pub async fn depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Every message accepted for a queue, in publish order.
    pub async fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        let state = self.inner.state.lock().await;
        state.history.get(queue).cloned().unwrap_or_default()
    }

    /// Whether a queue has been declared.
    pub async fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().await.queues.contains_key(queue)
    }

    /// Close the broker. Open delivery streams end and further calls fail
    /// with `BusError::Closed`.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.notify.notify_waiters();
        info!("Channel broker closed");
    }

    /// Wait for the next ready message on `queue`. `None` once closed.
    async fn next_ready(inner: &Arc<Inner>, queue: &str) -> Option<StoredMessage> {
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inner.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(msg) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) {
                    return Some(msg);
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
            });
        debug!(queue = %spec.name, "Declared channel queue");
        Ok(())
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }

        let stored = StoredMessage {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            message: message.clone(),
            redelivered: false,
        };
        if self.inner.enqueue(&mut state, queue, stored, false) {
            state
                .history
                .entry(queue.to_string())
                .or_default()
                .push(message);
            debug!(queue = %queue, "Published to channel queue");
        } else {
            warn!(queue = %queue, "Queue not declared, message dropped");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(BusError::Closed);
            }
            if !state.queues.contains_key(queue) {
                return Err(BusError::Consume {
                    queue: queue.to_string(),
                    message: "queue not declared".to_string(),
                });
            }
        }

        let permits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();

        info!(queue = %queue, prefetch, "Channel consumer started");

        let stream = futures::stream::unfold(
            (inner, queue, permits),
            |(inner, queue, permits)| async move {
                let permit = Arc::clone(&permits).acquire_owned().await.ok()?;
                let stored = Self::next_ready(&inner, &queue).await?;

                let delivery_tag = inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                let acker = ChannelAcker {
                    inner: Arc::clone(&inner),
                    queue: queue.clone(),
                    stored: stored.clone(),
                    permit: Mutex::new(Some(permit)),
                };
                let delivery = Delivery::new(
                    queue.clone(),
                    delivery_tag,
                    stored.redelivered,
                    stored.message.headers.clone(),
                    stored.message.body.clone(),
                    Box::new(acker),
                );
                Some((Ok(delivery), (inner, queue, permits)))
            },
        );

        Ok(stream.boxed())
    }
}

/// Settles a channel delivery and releases its prefetch permit.
struct ChannelAcker {
    inner: Arc<Inner>,
    queue: String,
    stored: StoredMessage,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl ChannelAcker {
    async fn release(&self) -> Result<()> {
        match self.permit.lock().await.take() {
            Some(_permit) => Ok(()),
            None => Err(BusError::Settle {
                delivery_tag: self.stored.id,
                message: "delivery already settled".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.release().await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.release().await?;

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Ok(());
        }

        if requeue {
            let mut stored = self.stored.clone();
            stored.redelivered = true;
            self.inner.enqueue(&mut state, &self.queue, stored, true);
            return Ok(());
        }

        let target = state
            .queues
            .get(&self.queue)
            .and_then(|q| q.spec.dead_letter_to.clone());
        if let Some(target) = target {
            let mut stored = self.stored.clone();
            stored.message.expiration = None;
            stored.redelivered = false;
            self.inner.enqueue(&mut state, &target, stored, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
