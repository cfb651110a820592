//! Consumer pipeline wiring.
//!
//! Builds one consumer per queue from configuration and runs them as
//! independent tasks:
//! - rider events: retry tracker, then poison queue
//! - rider poison queue: delay ladder, then drop
//! - licence plate renames and their poison queue (when configured)
//! - chunked transfers: bare requeue into the chunk reassembler
//!
//! The retry tracker and the reassembly buffers are owned here and shared
//! by the consumers that need them.

use std::sync::Arc;

use tracing::info;

use crate::bus::{self, Broker, BusError, ChannelBroker, QueueSpec};
use crate::config::{Config, MessagingConfig, MessagingType};
use crate::consumer::{
    ConsumerHandle, FailurePolicy, JsonHandler, MessageHandler, QueueConsumer, RequeueOnFailure,
};
use crate::handlers::{FleetRegistry, RenameLicencePlate, RiderDirectory, UpsertRider};
use crate::poison::{DelayLadder, DelayedRetry, PoisonEscalator};
use crate::reassembly::{ChunkReassembler, FileSink};
use crate::retry::{RetryPolicy, RetryTracker};

/// Connect to the broker selected by configuration.
pub async fn connect(config: &MessagingConfig) -> bus::Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Channel => {
            info!("Using in-process channel broker");
            Ok(Arc::new(ChannelBroker::new()))
        }
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            let broker = bus::AmqpBroker::new(&config.amqp).await?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "amqp"))]
        MessagingType::Amqp => Err(BusError::Connection(
            "AMQP support not compiled in; enable the `amqp` feature".to_string(),
        )),
    }
}

/// Domain collaborators the consumers hand messages to.
#[derive(Clone)]
pub struct Collaborators {
    pub riders: Arc<dyn RiderDirectory>,
    pub images: Arc<dyn FileSink>,
    /// Required when a licence plate queue is configured.
    pub fleet: Option<Arc<dyn FleetRegistry>>,
}

/// Consumers ready to start.
pub struct Pipeline {
    consumers: Vec<QueueConsumer>,
    tracker: Arc<RetryTracker>,
    reassembler: Arc<ChunkReassembler>,
}

impl Pipeline {
    /// Declare every queue and build the consumers.
    pub async fn build(
        broker: Arc<dyn Broker>,
        config: &Config,
        collaborators: Collaborators,
    ) -> bus::Result<Self> {
        let messaging = &config.messaging;
        let queues = &messaging.queues;
        let policy = RetryPolicy::from_config(&config.retry);
        let tracker = Arc::new(RetryTracker::from_policy(&policy));

        let mut builder = StreamBuilder {
            broker: Arc::clone(&broker),
            policy,
            tracker: Arc::clone(&tracker),
            prefetch: messaging.prefetch,
            consumers: Vec::new(),
        };

        let riders: Arc<dyn MessageHandler> =
            Arc::new(JsonHandler::new(UpsertRider::new(collaborators.riders)));
        builder
            .tracked(
                &queues.events,
                &queues.poison,
                &messaging.delay_queue_prefix,
                riders,
            )
            .await?;

        if let Some(plates) = &queues.plates {
            let Some(fleet) = collaborators.fleet else {
                return Err(BusError::Declare {
                    queue: plates.clone(),
                    message: "licence plate queue configured without a fleet registry".to_string(),
                });
            };
            let renames: Arc<dyn MessageHandler> =
                Arc::new(JsonHandler::new(RenameLicencePlate::new(fleet)));
            let prefix = format!("{}-retry", queues.plates_poison);
            builder
                .tracked(plates, &queues.plates_poison, &prefix, renames)
                .await?;
        }

        let reassembler = Arc::new(ChunkReassembler::new(collaborators.images));
        builder.plain(&queues.chunks, reassembler.clone()).await?;

        Ok(Self {
            consumers: builder.consumers,
            tracker,
            reassembler,
        })
    }

    /// Names of the consumed queues.
    pub fn queues(&self) -> Vec<&str> {
        self.consumers.iter().map(|c| c.queue()).collect()
    }

    /// Spawn every consumer.
    pub fn start(self) -> RunningPipeline {
        let handles: Vec<ConsumerHandle> = self
            .consumers
            .into_iter()
            .map(QueueConsumer::spawn)
            .collect();
        info!(consumers = handles.len(), "Pipeline started");
        RunningPipeline {
            handles,
            tracker: self.tracker,
            reassembler: self.reassembler,
        }
    }
}

/// Handles to the running consumers.
pub struct RunningPipeline {
    handles: Vec<ConsumerHandle>,
    tracker: Arc<RetryTracker>,
    reassembler: Arc<ChunkReassembler>,
}

impl RunningPipeline {
    pub fn tracker(&self) -> &Arc<RetryTracker> {
        &self.tracker
    }

    pub fn reassembler(&self) -> &Arc<ChunkReassembler> {
        &self.reassembler
    }

    pub fn handles(&self) -> &[ConsumerHandle] {
        &self.handles
    }

    /// Stop every consumer. In-flight handler work is abandoned.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!("Pipeline stopped");
    }

    /// Wait until every consumer loop has ended.
    pub async fn join(self) {
        for handle in self.handles {
            let queue = handle.queue().to_string();
            if let Err(e) = handle.join().await {
                if !e.is_cancelled() {
                    tracing::error!(queue = %queue, error = %e, "Consumer task failed");
                }
            }
        }
    }
}

struct StreamBuilder {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    tracker: Arc<RetryTracker>,
    prefetch: u16,
    consumers: Vec<QueueConsumer>,
}

impl StreamBuilder {
    /// Primary queue with counted retries, its poison queue and delay ladder.
    async fn tracked(
        &mut self,
        primary: &str,
        poison: &str,
        ladder_prefix: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> bus::Result<()> {
        let poison_spec = QueueSpec::transient(poison);
        self.broker.declare_queue(&poison_spec).await?;

        let ladder = Arc::new(DelayLadder::new(ladder_prefix, poison, &self.policy));
        ladder.declare_all(self.broker.as_ref()).await?;

        let escalator = PoisonEscalator::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.tracker),
            poison_spec.clone(),
        );
        self.push(QueueSpec::transient(primary), handler.clone(), Arc::new(escalator))
            .await?;

        let delayed = DelayedRetry::new(Arc::clone(&self.broker), ladder, self.policy.clone());
        self.push(poison_spec, handler, Arc::new(delayed)).await
    }

    /// Queue with bare requeue on failure.
    async fn plain(&mut self, queue: &str, handler: Arc<dyn MessageHandler>) -> bus::Result<()> {
        self.push(QueueSpec::transient(queue), handler, Arc::new(RequeueOnFailure))
            .await
    }

    async fn push(
        &mut self,
        spec: QueueSpec,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<dyn FailurePolicy>,
    ) -> bus::Result<()> {
        self.broker.declare_queue(&spec).await?;
        let consumer = QueueConsumer::new(Arc::clone(&self.broker), spec, handler, policy)
            .with_prefetch(self.prefetch);
        self.consumers.push(consumer);
        Ok(())
    }
}
