//! Fire-and-forget publishing of events and chunked transfers.
//!
//! Every publish declares its target queue first (non-durable, idempotent)
//! and then sends without waiting for a broker confirm. Messages are
//! transient: a broker restart may lose them.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::bus::{Broker, BusError, OutboundMessage, QueueSpec};
use crate::wire::{self, ChunkMessage, Keyed};

/// Fragment size of chunked transfers.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read source: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PublishError>;

/// Name given to a transferred file: `{correlationId}_{yyyyMMddHHmmss}{ext}`.
///
/// `extension` includes its leading dot, or is empty.
pub fn transfer_file_name(correlation_id: &str, extension: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}{}", correlation_id, at.format("%Y%m%d%H%M%S"), extension)
}

/// Publishes payloads to named queues.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    chunk_size: usize,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Serialize `payload` as JSON and send it to `queue`.
    pub async fn publish<T: Serialize + ?Sized>(&self, queue: &str, payload: &T) -> Result<()> {
        let body = wire::encode(payload)?;
        self.broker
            .declare_queue(&QueueSpec::transient(queue))
            .await?;
        self.broker
            .publish(queue, OutboundMessage::json(body))
            .await?;
        Ok(())
    }

    /// Publish a domain event.
    pub async fn publish_event<E: Serialize + Keyed>(&self, queue: &str, event: &E) -> Result<()> {
        self.publish(queue, event).await?;
        info!(queue = %queue, message_key = %event.message_key(), "Published event");
        Ok(())
    }

    /// Split `source` into fixed-size fragments and publish them in order.
    ///
    /// Sequence numbers start at 0. One fragment is read ahead so the
    /// fragment that reaches end-of-stream is marked `isLast`. An empty
    /// source publishes nothing. Returns the number of fragments sent.
    pub async fn publish_stream<R>(
        &self,
        queue: &str,
        mut source: R,
        correlation_id: &str,
        file_name: &str,
    ) -> Result<u32>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut current = read_fragment(&mut source, self.chunk_size).await?;
        if current.is_empty() {
            debug!(correlation_id = %correlation_id, "Empty source, nothing to publish");
            return Ok(0);
        }

        let mut sequence_number = 0u32;
        loop {
            let next = read_fragment(&mut source, self.chunk_size).await?;
            let is_last = next.is_empty();

            let chunk = ChunkMessage::new(correlation_id, sequence_number, file_name, current, is_last);
            self.publish(queue, &chunk).await?;

            if is_last {
                break;
            }
            current = next;
            sequence_number += 1;
        }

        let count = sequence_number + 1;
        info!(
            queue = %queue,
            correlation_id = %correlation_id,
            file_name = %file_name,
            chunks = count,
            "Published chunked transfer"
        );
        Ok(count)
    }

    /// Stream a file from disk, naming it after the correlation id and the
    /// current time. Returns the transfer file name.
    pub async fn publish_file(
        &self,
        queue: &str,
        path: impl AsRef<Path>,
        correlation_id: &str,
    ) -> Result<String> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let file_name = transfer_file_name(correlation_id, &extension, Utc::now());

        let file = tokio::fs::File::open(path).await?;
        self.publish_stream(queue, file, correlation_id, &file_name)
            .await?;
        Ok(file_name)
    }
}

/// Read up to `size` bytes, stopping early only at end-of-stream.
async fn read_fragment<R: AsyncRead + Unpin>(source: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
