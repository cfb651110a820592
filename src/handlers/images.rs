//! Rider document images received as chunked transfers.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::consumer::HandlerError;
use crate::reassembly::{FileSink, ReassembledFile};

/// Keeps the latest image per rider, keyed by correlation id (the rider's
/// `UserId`). Storing the same file again overwrites it.
#[derive(Debug, Default)]
pub struct RiderImageStore {
    images: DashMap<String, ReassembledFile>,
}

impl RiderImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<ReassembledFile> {
        self.images.get(user_id).map(|f| f.clone())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[async_trait]
impl FileSink for RiderImageStore {
    async fn store(&self, file: ReassembledFile) -> Result<(), HandlerError> {
        if file.file_name.is_empty() {
            return Err(HandlerError::rejected("transfer without file name"));
        }
        info!(
            user_id = %file.correlation_id,
            file_name = %file.file_name,
            size = file.content.len(),
            "Stored rider image"
        );
        self.images.insert(file.correlation_id.clone(), file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn file(name: &str, content: &'static [u8]) -> ReassembledFile {
        ReassembledFile {
            correlation_id: "u-1".to_string(),
            file_name: name.to_string(),
            content: Bytes::from_static(content),
        }
    }

    #[tokio::test]
    async fn test_latest_image_wins() {
        let store = RiderImageStore::new();
        store.store(file("u-1_1.png", b"old")).await.unwrap();
        store.store(file("u-1_2.png", b"new")).await.unwrap();

        assert_eq!(store.len(), 1);
        let image = store.get("u-1").unwrap();
        assert_eq!(image.file_name, "u-1_2.png");
        assert_eq!(&image.content[..], b"new");
    }

    #[tokio::test]
    async fn test_nameless_file_is_rejected() {
        let store = RiderImageStore::new();
        assert!(store.store(file("", b"x")).await.is_err());
        assert!(store.is_empty());
    }
}
