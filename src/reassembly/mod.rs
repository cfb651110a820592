//! Chunked transfer reassembly.
//!
//! Fragments of one binary transfer share a correlation id and carry a
//! sequence number. They may arrive in any order and more than once; each
//! transfer is buffered until the final fragment and every fragment before it
//! have been seen, then the bytes are concatenated in sequence order and
//! handed to a `FileSink`.
//!
//! Buffers are keyed by correlation id in a concurrent map, so transfers on
//! different consumer tasks never share an entry. A buffer is removed once
//! the sink accepted the file. When the sink fails with a retryable error the
//! fragments stay buffered and the redelivered final chunk completes the
//! transfer; a fatal sink error discards the transfer.
//!
//! Correlation ids are reused across transfers (one per rider). The last
//! completed transfer of each id is fingerprinted, so a redelivered fragment
//! of it is discarded instead of seeding a buffer for the next transfer. The
//! fingerprint is forgotten as soon as a fragment of another transfer arrives.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::consumer::{HandlerError, MessageContext, MessageHandler};
use crate::wire::{self, message_digest, ChunkMessage, Keyed};

/// A completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFile {
    pub correlation_id: String,
    pub file_name: String,
    pub content: Bytes,
}

/// Receives completed transfers (e.g. "store this file for this rider").
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn store(&self, file: ReassembledFile) -> Result<(), HandlerError>;
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Buffered; the transfer is still missing fragments.
    Buffered { received: usize },
    /// The transfer was completed and handed to the sink.
    Completed { size: usize },
    /// Redelivered fragment of a transfer that already completed; discarded.
    Replayed,
}

#[derive(Debug, Default)]
struct TransferBuffer {
    chunks: BTreeMap<u32, ChunkMessage>,
    /// Sequence number of the fragment marked `isLast`, once seen.
    final_sequence: Option<u32>,
}

impl TransferBuffer {
    /// Insert a fragment. A repeated sequence number replaces the earlier copy.
    fn insert(&mut self, chunk: ChunkMessage) {
        if chunk.is_last {
            self.final_sequence = Some(chunk.sequence_number);
        } else if self.final_sequence == Some(chunk.sequence_number) {
            self.final_sequence = None;
        }
        if self.chunks.insert(chunk.sequence_number, chunk).is_some() {
            debug!("Replaced duplicate fragment");
        }
    }

    /// Final sequence number, once every fragment up to it is buffered.
    fn complete_through(&self) -> Option<u32> {
        let last = self.final_sequence?;
        (0..=last)
            .all(|seq| self.chunks.contains_key(&seq))
            .then_some(last)
    }

    /// Concatenate fragments `0..=last` in sequence order.
    fn assemble(&self, correlation_id: &str, last: u32) -> ReassembledFile {
        let parts: Vec<&ChunkMessage> = self.chunks.range(..=last).map(|(_, c)| c).collect();
        let size = parts.iter().map(|c| c.content.len()).sum();

        let mut content = BytesMut::with_capacity(size);
        for part in &parts {
            content.extend_from_slice(&part.content);
        }

        let file_name = self
            .chunks
            .get(&last)
            .map(|c| c.file_name.clone())
            .unwrap_or_default();

        ReassembledFile {
            correlation_id: correlation_id.to_string(),
            file_name,
            content: content.freeze(),
        }
    }
}

/// Fingerprint of the last transfer completed under a correlation id.
#[derive(Debug)]
struct CompletedTransfer {
    file_name: String,
    last: u32,
    /// Content digest per sequence number.
    digests: Vec<String>,
}

impl CompletedTransfer {
    fn of(buffer: &TransferBuffer, last: u32) -> Self {
        let file_name = buffer
            .chunks
            .get(&last)
            .map(|c| c.file_name.clone())
            .unwrap_or_default();
        Self {
            file_name,
            last,
            digests: buffer
                .chunks
                .range(..=last)
                .map(|(_, c)| message_digest(&c.content))
                .collect(),
        }
    }

    fn matches(&self, chunk: &ChunkMessage) -> bool {
        chunk.file_name == self.file_name
            && chunk.is_last == (chunk.sequence_number == self.last)
            && usize::try_from(chunk.sequence_number)
                .ok()
                .and_then(|seq| self.digests.get(seq))
                .is_some_and(|digest| *digest == message_digest(&chunk.content))
    }
}

/// Rebuilds chunked transfers and forwards them to a sink.
pub struct ChunkReassembler {
    buffers: DashMap<String, TransferBuffer>,
    completed: DashMap<String, CompletedTransfer>,
    sink: Arc<dyn FileSink>,
}

impl ChunkReassembler {
    pub fn new(sink: Arc<dyn FileSink>) -> Self {
        Self {
            buffers: DashMap::new(),
            completed: DashMap::new(),
            sink,
        }
    }

    /// Accept one fragment.
    pub async fn on_chunk(&self, chunk: ChunkMessage) -> Result<ChunkOutcome, HandlerError> {
        let correlation_id = chunk.correlation_id.clone();

        let replayed = self
            .completed
            .get(&correlation_id)
            .is_some_and(|done| done.matches(&chunk));
        if replayed {
            debug!(
                correlation_id = %correlation_id,
                sequence_number = chunk.sequence_number,
                "Discarding fragment of completed transfer"
            );
            return Ok(ChunkOutcome::Replayed);
        }
        self.completed.remove(&correlation_id);

        // Entry lock is released before the sink is awaited
        let (file, fingerprint) = {
            let mut buffer = self.buffers.entry(correlation_id.clone()).or_default();
            buffer.insert(chunk);
            match buffer.complete_through() {
                Some(last) => (
                    buffer.assemble(&correlation_id, last),
                    CompletedTransfer::of(&buffer, last),
                ),
                None => {
                    let received = buffer.chunks.len();
                    debug!(correlation_id = %correlation_id, received, "Buffered chunk");
                    return Ok(ChunkOutcome::Buffered { received });
                }
            }
        };
        let size = file.content.len();
        let file_name = file.file_name.clone();

        if let Err(e) = self.sink.store(file).await {
            if e.is_fatal() {
                // The final chunk is dropped, nothing will complete this buffer
                self.buffers.remove(&correlation_id);
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "File sink rejected transfer, discarding buffered chunks"
                );
            } else {
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "File sink failed, keeping buffered chunks"
                );
            }
            return Err(e);
        }

        self.buffers.remove(&correlation_id);
        self.completed.insert(correlation_id.clone(), fingerprint);
        info!(
            correlation_id = %correlation_id,
            file_name = %file_name,
            size,
            "Transfer reassembled"
        );
        Ok(ChunkOutcome::Completed { size })
    }

    /// Fragments buffered for a transfer (0 if none).
    pub fn buffered(&self, correlation_id: &str) -> usize {
        self.buffers
            .get(correlation_id)
            .map(|b| b.chunks.len())
            .unwrap_or(0)
    }

    /// Number of transfers still waiting for fragments.
    pub fn pending_transfers(&self) -> usize {
        self.buffers.len()
    }
}

#[async_trait]
impl MessageHandler for ChunkReassembler {
    async fn handle(&self, _ctx: &MessageContext, body: &[u8]) -> Result<(), HandlerError> {
        let chunk: ChunkMessage = wire::decode(body)?;
        self.on_chunk(chunk).await.map(|_| ())
    }

    fn message_key(&self, body: &[u8]) -> Option<String> {
        wire::decode::<ChunkMessage>(body)
            .ok()
            .map(|chunk| chunk.message_key())
    }
}
