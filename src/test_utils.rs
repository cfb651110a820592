//! Test utilities and mock implementations.
//!
//! Scripted handlers and polling helpers for exercising consumers against the
//! in-process broker.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bus::{Broker, ChannelBroker, QueueSpec};
use crate::consumer::{HandlerError, MessageContext, MessageHandler};

/// Handler that fails a fixed number of times, then succeeds.
pub struct FlakyHandler {
    failures: u32,
    error: HandlerError,
    calls: AtomicU32,
    key: Option<String>,
    seen: Mutex<Vec<MessageContext>>,
}

impl FlakyHandler {
    /// Fails the first `failures` calls with a retryable error.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            error: HandlerError::retryable("downstream unavailable"),
            calls: AtomicU32::new(0),
            key: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Never succeeds.
    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    /// Always succeeds.
    pub fn succeeding() -> Self {
        Self::failing(0)
    }

    pub fn with_error(mut self, error: HandlerError) -> Self {
        self.error = error;
        self
    }

    /// Report a fixed natural key for every body.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn contexts(&self) -> Vec<MessageContext> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, ctx: &MessageContext, _body: &[u8]) -> Result<(), HandlerError> {
        self.seen.lock().await.push(ctx.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }

    fn message_key(&self, _body: &[u8]) -> Option<String> {
        self.key.clone()
    }
}

/// Broker with the named transient queues declared.
pub async fn broker_with(queues: &[&str]) -> Arc<ChannelBroker> {
    let broker = Arc::new(ChannelBroker::new());
    for queue in queues {
        broker
            .declare_queue(&QueueSpec::transient(*queue))
            .await
            .expect("declare");
    }
    broker
}

/// Poll `check` until it returns true, panicking after two seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
