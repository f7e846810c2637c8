//! In-process store used for local development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{GatewayError, GatewayResult};
use crate::store::{
    Media, MediaKind, ObjectDescriptor, ObjectStore, PartitionId, StoreSession, Upload,
};

type Objects = Arc<RwLock<HashMap<u64, (Media, Bytes)>>>;

pub struct MemoryStore {
    container: String,
    partition: PartitionId,
    objects: Objects,
    next_sequence: AtomicU64,
    sessions_established: AtomicUsize,
}

impl MemoryStore {
    pub fn new(container: impl Into<String>, partition: impl Into<PartitionId>) -> Self {
        Self {
            container: container.into(),
            partition: partition.into(),
            objects: Arc::default(),
            next_sequence: AtomicU64::new(1),
            sessions_established: AtomicUsize::new(0),
        }
    }

    /// Store `data` directly, bypassing the spooling path.
    pub fn insert(&self, name: &str, mime_type: &str, data: impl Into<Bytes>) -> ObjectDescriptor {
        let data = data.into();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let media = Media {
            kind: MediaKind::from_mime(mime_type),
            name: name.to_string(),
            size: data.len() as u64,
            mime_type: Some(mime_type.to_string()),
            partition: self.partition.clone(),
            last_modified: Some(httpdate::fmt_http_date(SystemTime::now())),
        };
        self.objects.write().insert(sequence, (media, data));
        ObjectDescriptor::new(self.container.clone(), sequence)
    }

    pub fn remove(&self, sequence: u64) {
        self.objects.write().remove(&sequence);
    }

    /// Number of session handshakes performed so far.
    pub fn sessions_established(&self) -> usize {
        self.sessions_established.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn establish_session(
        &self,
        partition: &PartitionId,
    ) -> GatewayResult<Arc<dyn StoreSession>> {
        if *partition != self.partition {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "unknown partition {partition}"
            )));
        }
        // Handshakes are never instantaneous; give concurrent callers a
        // chance to interleave.
        tokio::task::yield_now().await;
        self.sessions_established.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemorySession {
            partition: partition.clone(),
            container: self.container.clone(),
            objects: self.objects.clone(),
        }))
    }

    async fn stat(&self, object: &ObjectDescriptor) -> GatewayResult<Option<Media>> {
        if object.container != self.container {
            return Ok(None);
        }
        Ok(self
            .objects
            .read()
            .get(&object.sequence)
            .map(|(media, _)| media.clone()))
    }

    async fn persist(&self, upload: Upload) -> GatewayResult<ObjectDescriptor> {
        let data = tokio::fs::read(&upload.path)
            .await
            .map_err(|e| GatewayError::IngestionFailed(format!("read spool file: {e}")))?;
        Ok(self.insert(&upload.name, &upload.mime_type, data))
    }

    async fn check_access(&self, container: &str) -> GatewayResult<()> {
        if container != self.container {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "unknown container {container}"
            )));
        }
        Ok(())
    }
}

struct MemorySession {
    partition: PartitionId,
    container: String,
    objects: Objects,
}

#[async_trait]
impl StoreSession for MemorySession {
    fn partition(&self) -> &PartitionId {
        &self.partition
    }

    async fn fetch_chunk(
        &self,
        object: &ObjectDescriptor,
        offset: u64,
        limit: u64,
    ) -> GatewayResult<Bytes> {
        if object.container != self.container {
            return Err(GatewayError::NotFound(object.to_string()));
        }
        let objects = self.objects.read();
        let (_, data) = objects
            .get(&object.sequence)
            .ok_or_else(|| GatewayError::NotFound(object.to_string()))?;
        let len = data.len() as u64;
        let start = offset.min(len);
        let end = offset.saturating_add(limit).min(len);
        Ok(data.slice(start as usize..end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_past_end_is_short_then_empty() {
        let store = MemoryStore::new("c", "p1");
        let obj = store.insert("x.bin", "application/octet-stream", vec![7u8; 10]);
        let session = store.establish_session(&"p1".to_string()).await.unwrap();

        let chunk = session.fetch_chunk(&obj, 8, 4).await.unwrap();
        assert_eq!(chunk.len(), 2);
        let chunk = session.fetch_chunk(&obj, 12, 4).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn stat_reports_removed_objects_as_missing() {
        let store = MemoryStore::new("c", "p1");
        let obj = store.insert("clip.mp4", "video/mp4", vec![1u8; 3]);
        let media = store.stat(&obj).await.unwrap().unwrap();
        assert_eq!(media.kind, MediaKind::Video);
        assert_eq!(media.size, 3);

        store.remove(obj.sequence);
        assert!(store.stat(&obj).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_partition_is_rejected() {
        let store = MemoryStore::new("c", "p1");
        assert!(store.establish_session(&"p9".to_string()).await.is_err());
        assert_eq!(store.sessions_established(), 0);
    }
}
