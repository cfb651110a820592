//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use motobus::config::Config;
use motobus::handlers::{InMemoryFleetRegistry, InMemoryRiderDirectory, RiderImageStore};
use motobus::runtime::Collaborators;
use motobus::wire::RiderInfo;

/// In-memory collaborators plus handles to inspect them.
pub struct Stores {
    pub riders: Arc<InMemoryRiderDirectory>,
    pub images: Arc<RiderImageStore>,
    pub fleet: Arc<InMemoryFleetRegistry>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            riders: Arc::new(InMemoryRiderDirectory::new()),
            images: Arc::new(RiderImageStore::new()),
            fleet: Arc::new(InMemoryFleetRegistry::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            riders: self.riders.clone(),
            images: self.images.clone(),
            fleet: Some(self.fleet.clone()),
        }
    }
}

/// In-process configuration with a 5ms backoff unit.
pub fn test_config() -> Config {
    Config::for_test()
}

pub fn rider(user_id: &str) -> RiderInfo {
    RiderInfo {
        user_id: user_id.to_string(),
        email: format!("{user_id}@example.com"),
        name: "Test Rider".to_string(),
        cnpj: "12345678000190".to_string(),
        date_of_birth: "1990-01-01T00:00:00".to_string(),
        cnh_number: "99999999999".to_string(),
        cnh_type: "A".to_string(),
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
