//! motobus-publish: One-shot publisher
//!
//! Publishes a rider event or streams a file as chunks, then exits.
//!
//! ## Configuration
//! - MOTOBUS_PUBLISH_EVENT: Path to a JSON `RiderInfo` document to publish
//!   to the events queue
//! - MOTOBUS_PUBLISH_FILE: Path to a file to stream to the chunk queue
//! - MOTOBUS_PUBLISH_CORRELATION_ID: Correlation id (rider `UserId`) of the
//!   file transfer; required with MOTOBUS_PUBLISH_FILE
//! - MOTOBUS_CONFIG / MOTOBUS__*: Broker and queue configuration
//! - MOTOBUS_LOG: Log filter (default: info)

use tracing::info;

use motobus::config::Config;
use motobus::publisher::Publisher;
use motobus::runtime::connect;
use motobus::utils::bootstrap::init_tracing;
use motobus::wire::{self, RiderInfo};

const EVENT_ENV_VAR: &str = "MOTOBUS_PUBLISH_EVENT";
const FILE_ENV_VAR: &str = "MOTOBUS_PUBLISH_FILE";
const CORRELATION_ENV_VAR: &str = "MOTOBUS_PUBLISH_CORRELATION_ID";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let queues = &config.messaging.queues;
    let broker = connect(&config.messaging).await?;
    let publisher = Publisher::new(broker).with_chunk_size(config.publisher.chunk_size);

    let event = std::env::var(EVENT_ENV_VAR).ok();
    let file = std::env::var(FILE_ENV_VAR).ok();
    if event.is_none() && file.is_none() {
        return Err(format!("set {EVENT_ENV_VAR} and/or {FILE_ENV_VAR}").into());
    }

    if let Some(path) = event {
        let body = tokio::fs::read(&path).await?;
        let rider: RiderInfo = wire::decode(&body)?;
        publisher.publish_event(&queues.events, &rider).await?;
    }

    if let Some(path) = file {
        let correlation_id = std::env::var(CORRELATION_ENV_VAR)
            .map_err(|_| format!("{CORRELATION_ENV_VAR} is required with {FILE_ENV_VAR}"))?;
        let file_name = publisher
            .publish_file(&queues.chunks, &path, &correlation_id)
            .await?;
        info!(file_name = %file_name, queue = %queues.chunks, "File published");
    }

    Ok(())
}
