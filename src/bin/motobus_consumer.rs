//! motobus-consumer: Event and transfer consumer
//!
//! Runs every configured consumer against the broker until interrupted.
//!
//! ## Architecture
//! ```text
//! rider-info ---------> [UpsertRider] --(3 failures)--> rider-info-poison
//! rider-info-poison --> [UpsertRider] --(fail)--> retry-poison-{n} --(TTL)--> rider-info-poison
//! image-stream -------> [ChunkReassembler] --> [RiderImageStore]
//! ```
//!
//! ## Configuration
//! - MOTOBUS_CONFIG: Path to a YAML configuration file (optional)
//! - MOTOBUS__MESSAGING__TYPE: `amqp` (default) or `channel` for standalone mode
//! - MOTOBUS_LOG: Log filter (default: info)
//!
//! Domain collaborators are the in-memory stores.

use std::sync::Arc;

use tracing::info;

use motobus::config::Config;
use motobus::handlers::{InMemoryFleetRegistry, InMemoryRiderDirectory, RiderImageStore};
use motobus::runtime::{connect, Collaborators, Pipeline};
use motobus::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let broker = connect_with_retry("broker", || connect(&config.messaging)).await?;

    let collaborators = Collaborators {
        riders: Arc::new(InMemoryRiderDirectory::new()),
        images: Arc::new(RiderImageStore::new()),
        fleet: Some(Arc::new(InMemoryFleetRegistry::new())),
    };

    let pipeline = Pipeline::build(broker, &config, collaborators).await?;
    info!(queues = ?pipeline.queues(), "motobus-consumer started");
    let running = pipeline.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    running.shutdown();
    running.join().await;

    Ok(())
}
