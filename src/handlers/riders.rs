//! Rider sign-up materialization.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::consumer::{EventHandler, HandlerError, MessageContext};
use crate::wire::RiderInfo;

/// Rider persistence as seen by the consumer.
#[async_trait]
pub trait RiderDirectory: Send + Sync {
    /// Create or replace the rider keyed by `UserId`.
    async fn upsert(&self, rider: RiderInfo) -> Result<(), HandlerError>;
}

/// Applies `RiderInfo` events to a directory.
pub struct UpsertRider {
    directory: Arc<dyn RiderDirectory>,
}

impl UpsertRider {
    pub fn new(directory: Arc<dyn RiderDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl EventHandler for UpsertRider {
    type Event = RiderInfo;

    async fn handle(&self, ctx: &MessageContext, rider: RiderInfo) -> Result<(), HandlerError> {
        if rider.user_id.trim().is_empty() {
            return Err(HandlerError::rejected("rider without UserId"));
        }
        let user_id = rider.user_id.clone();
        self.directory.upsert(rider).await?;
        info!(user_id = %user_id, redelivered = ctx.redelivered, "Rider upserted");
        Ok(())
    }
}

/// Directory held in memory. Upserts are idempotent.
#[derive(Debug, Default)]
pub struct InMemoryRiderDirectory {
    riders: DashMap<String, RiderInfo>,
}

impl InMemoryRiderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<RiderInfo> {
        self.riders.get(user_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.riders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.riders.is_empty()
    }
}

#[async_trait]
impl RiderDirectory for InMemoryRiderDirectory {
    async fn upsert(&self, rider: RiderInfo) -> Result<(), HandlerError> {
        self.riders.insert(rider.user_id.clone(), rider);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{JsonHandler, MessageHandler};
    use chrono::Utc;

    fn ctx() -> MessageContext {
        MessageContext {
            queue: "rider-info".to_string(),
            message_key: "u-1".to_string(),
            delivery_tag: 1,
            redelivered: false,
            retries: 0,
            received_at: Utc::now(),
        }
    }

    const BODY: &[u8] = br#"{"UserId":"u-1","Email":"a@b.c","Name":"Ana","CNPJ":"1","DateOfBirth":"1990-01-01T00:00:00","CNHNumber":"9","CNHType":"A"}"#;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let directory = Arc::new(InMemoryRiderDirectory::new());
        let handler = JsonHandler::new(UpsertRider::new(directory.clone()));

        handler.handle(&ctx(), BODY).await.unwrap();
        handler.handle(&ctx(), BODY).await.unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get("u-1").map(|r| r.name), Some("Ana".to_string()));
    }

    #[tokio::test]
    async fn test_natural_key_is_user_id() {
        let handler = JsonHandler::new(UpsertRider::new(Arc::new(InMemoryRiderDirectory::new())));
        assert_eq!(handler.message_key(BODY).as_deref(), Some("u-1"));
        assert_eq!(handler.message_key(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_blank_user_id_is_rejected() {
        let directory = Arc::new(InMemoryRiderDirectory::new());
        let handler = JsonHandler::new(UpsertRider::new(directory.clone()));
        let body = br#"{"UserId":" ","Email":"","Name":"","CNPJ":"","DateOfBirth":"","CNHNumber":"","CNHType":""}"#;

        let err = handler.handle(&ctx(), body).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_missing_field_is_malformed() {
        let handler = JsonHandler::new(UpsertRider::new(Arc::new(InMemoryRiderDirectory::new())));
        let err = handler.handle(&ctx(), br#"{"UserId":"u-1"}"#).await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
    }
}
