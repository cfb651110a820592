//! Licence plate renames propagated to rentals.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::consumer::{EventHandler, HandlerError, MessageContext};
use crate::wire::LicencePlateUpdate;

/// Rental records as seen by the consumer.
#[async_trait]
pub trait FleetRegistry: Send + Sync {
    /// Move every rental of `old_plate` to `new_plate`.
    async fn rename_plate(&self, old_plate: &str, new_plate: &str) -> Result<(), HandlerError>;
}

/// Applies `LicencePlateUpdate` events to a registry.
pub struct RenameLicencePlate {
    registry: Arc<dyn FleetRegistry>,
}

impl RenameLicencePlate {
    pub fn new(registry: Arc<dyn FleetRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for RenameLicencePlate {
    type Event = LicencePlateUpdate;

    async fn handle(
        &self,
        _ctx: &MessageContext,
        update: LicencePlateUpdate,
    ) -> Result<(), HandlerError> {
        self.registry
            .rename_plate(&update.old_licence_plate, &update.new_licence_plate)
            .await?;
        info!(
            old_plate = %update.old_licence_plate,
            new_plate = %update.new_licence_plate,
            "Licence plate renamed"
        );
        Ok(())
    }
}

/// Registry held in memory: plate to rental ids.
#[derive(Debug, Default)]
pub struct InMemoryFleetRegistry {
    rentals: DashMap<String, Vec<String>>,
}

impl InMemoryFleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rental against a plate.
    pub fn register(&self, plate: impl Into<String>, rental_id: impl Into<String>) {
        self.rentals
            .entry(plate.into())
            .or_default()
            .push(rental_id.into());
    }

    pub fn rentals(&self, plate: &str) -> Vec<String> {
        self.rentals
            .get(plate)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FleetRegistry for InMemoryFleetRegistry {
    async fn rename_plate(&self, old_plate: &str, new_plate: &str) -> Result<(), HandlerError> {
        match self.rentals.remove(old_plate) {
            Some((_, ids)) => {
                self.rentals
                    .entry(new_plate.to_string())
                    .or_default()
                    .extend(ids);
                Ok(())
            }
            // Replayed rename
            None if self.rentals.contains_key(new_plate) => Ok(()),
            None => Err(HandlerError::rejected(format!(
                "no rentals for plate {old_plate}"
            ))),
        }
    }
}
