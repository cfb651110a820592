//! AMQP (RabbitMQ) broker implementation.
//!
//! All traffic goes through the default exchange with the queue name as
//! routing key. Queues are declared on first use by both publishers and
//! consumers. Publishing is fire-and-forget: publisher confirms are not
//! awaited and messages are not marked persistent.

use std::borrow::Cow;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Acker, Broker, BusError, Delivery, DeliveryStream, MessageHeaders, OutboundMessage,
    QueueSpec, Result, RETRIES_HEADER,
};
use crate::config::AmqpConfig;

/// Owns the broker connection pool and hands out logical channels.
///
/// Reconnection is left to the pool: a broken connection is recycled on the
/// next `get`.
#[derive(Clone)]
pub struct ConnectionManager {
    pool: Pool,
    url: String,
}

impl ConnectionManager {
    /// Build the pool and verify that a connection can be opened.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(
            config.url.clone(),
            ConnectionProperties::default().with_connection_name("motobus".into()),
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let _conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %redact_url(&config.url), "Connected to AMQP");

        Ok(Self {
            pool,
            url: config.url.clone(),
        })
    }

    /// Open a new channel on a pooled connection.
    pub async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Connection URL with credentials removed.
    pub fn url(&self) -> Cow<'_, str> {
        redact_url(&self.url)
    }
}

/// RabbitMQ broker.
pub struct AmqpBroker {
    connections: ConnectionManager,
    /// Channel reused for publishing and declaring; reopened when closed.
    control: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ.
    pub async fn new(config: &AmqpConfig) -> Result<Self> {
        let connections = ConnectionManager::connect(config).await?;
        Ok(Self::with_connections(connections))
    }

    pub fn with_connections(connections: ConnectionManager) -> Self {
        Self {
            connections,
            control: Mutex::new(None),
        }
    }

    /// Get the control channel, opening a fresh one if the previous one closed.
    async fn control_channel(&self) -> Result<Channel> {
        let mut guard = self.control.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!("Control channel closed, reopening");
        }
        let channel = self.connections.channel().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let channel = self.control_channel().await?;
        channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| BusError::Declare {
                queue: spec.name.clone(),
                message: e.to_string(),
            })?;

        debug!(queue = %spec.name, durable = spec.durable, "Declared queue");
        Ok(())
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let channel = self.control_channel().await?;

        // The returned confirm is intentionally not awaited
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                message_properties(&message),
            )
            .await
            .map_err(|e| BusError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        debug!(queue = %queue, bytes = message.body.len(), "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        let channel = self.connections.channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume {
                queue: queue.to_string(),
                message: format!("Failed to set QoS: {}", e),
            })?;

        let consumer_tag = format!("motobus-{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume {
                queue: queue.to_string(),
                message: format!("Failed to start consumer: {}", e),
            })?;

        info!(queue = %queue, prefetch, consumer_tag = %consumer_tag, "AMQP consumer started");

        let queue = queue.to_string();
        let stream = consumer.map(move |result| {
            // Channel lives as long as the stream
            let _channel = &channel;
            match result {
                Ok(delivery) => Ok(Delivery::new(
                    queue.clone(),
                    delivery.delivery_tag,
                    delivery.redelivered,
                    headers_from(&delivery.properties),
                    delivery.data.into(),
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                        delivery_tag: delivery.delivery_tag,
                    }),
                )),
                Err(e) => Err(BusError::Consume {
                    queue: queue.clone(),
                    message: e.to_string(),
                }),
            }
        });

        Ok(stream.boxed())
    }
}

struct AmqpAcker {
    acker: LapinAcker,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Property and argument mapping
// ============================================================================

/// Queue arguments for TTL and dead-letter routing.
fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = spec.message_ttl {
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(ttl.as_millis() as i64),
        );
    }
    if let Some(ref target) = spec.dead_letter_to {
        // Default exchange: route by queue name
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(target.as_str().into()),
        );
    }
    args
}

fn message_properties(message: &OutboundMessage) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_content_type(message.content_type.into());

    if let Some(retries) = message.headers.retries {
        let mut headers = FieldTable::default();
        headers.insert(
            RETRIES_HEADER.into(),
            AMQPValue::LongInt(i32::try_from(retries).unwrap_or(i32::MAX)),
        );
        properties = properties.with_headers(headers);
    }

    if let Some(expiration) = message.expiration {
        properties =
            properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }

    properties
}

fn headers_from(properties: &BasicProperties) -> MessageHeaders {
    let retries = properties
        .headers()
        .as_ref()
        .and_then(|table| table.inner().get(RETRIES_HEADER))
        .and_then(|value| {
            let parsed = amqp_value_as_u32(value);
            if parsed.is_none() {
                warn!(value = ?value, "Ignoring unreadable retries header");
            }
            parsed
        });
    MessageHeaders { retries }
}

/// Integer header values arrive with whatever width the publisher chose.
fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    let wide: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.trim().parse().ok()?,
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(wide).ok()
}

/// Strip `user:password@` from a connection URL for logging, keeping the host.
fn redact_url(url: &str) -> Cow<'_, str> {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
    let authority_end = url[authority_start..]
        .find('/')
        .map(|i| authority_start + i)
        .unwrap_or(url.len());
    match url[authority_start..authority_end].rfind('@') {
        Some(at) => {
            let host_start = authority_start + at + 1;
            Cow::Owned(format!("{}{}", &url[..authority_start], &url[host_start..]))
        }
        None => Cow::Borrowed(url),
    }
}
