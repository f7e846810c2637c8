//! Contract between the gateway and the remote chunked object store.
//!
//! The gateway only relies on two capabilities from the store: opening an
//! authenticated session for a partition, and fetching a bounded window of an
//! object's bytes through such a session. Metadata lookups and persistence are
//! used by the landing page and the ingestion pipeline.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

pub mod memory;
pub mod s3;

/// Routing domain of the store that needs its own authenticated session.
pub type PartitionId = String;

/// Locator of a stored object: the container it was appended to and its
/// sequence number inside that container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub container: String,
    pub sequence: u64,
}

impl ObjectDescriptor {
    pub fn new(container: impl Into<String>, sequence: u64) -> Self {
        Self {
            container: container.into(),
            sequence,
        }
    }
}

impl fmt::Display for ObjectDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Document,
    Video,
    Audio,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    pub fn is_playable(self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio)
    }
}

/// Metadata of a stored object as reported by the store.
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub partition: PartitionId,
    /// RFC 7231 formatted, ready for a `Last-Modified` header.
    pub last_modified: Option<String>,
}

impl Media {
    pub fn content_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// A spooled local file about to be appended to the store.
#[derive(Debug, Clone)]
pub struct Upload {
    pub path: PathBuf,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Credentialed handle to the remote store. One of these backs every
/// Session Pool entry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Perform the store's session handshake for `partition`.
    async fn establish_session(
        &self,
        partition: &PartitionId,
    ) -> GatewayResult<Arc<dyn StoreSession>>;

    /// Authoritative metadata, `None` when the object does not exist.
    async fn stat(&self, object: &ObjectDescriptor) -> GatewayResult<Option<Media>>;

    /// Append a local file to the store's channel.
    async fn persist(&self, upload: Upload) -> GatewayResult<ObjectDescriptor>;

    /// Confirm `container` exists and these credentials may read it.
    async fn check_access(&self, container: &str) -> GatewayResult<()>;
}

/// Startup gate: refuse to serve from a container the store cannot reach.
pub async fn ensure_reachable(store: &dyn ObjectStore, container: &str) -> anyhow::Result<()> {
    store.check_access(container).await.with_context(|| {
        format!("storage container {container:?} is not reachable; check its name and credentials")
    })
}

/// Authenticated session bound to one partition.
#[async_trait]
pub trait StoreSession: Send + Sync {
    fn partition(&self) -> &PartitionId;

    /// Up to `limit` bytes starting at `offset`. A short or empty result means
    /// the object ended; it is not an error.
    async fn fetch_chunk(
        &self,
        object: &ObjectDescriptor,
        offset: u64,
        limit: u64,
    ) -> GatewayResult<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn unreachable_container_fails_startup_check() {
        let store = MemoryStore::new("media", "p1");
        ensure_reachable(&store, "media").await.unwrap();

        let err = ensure_reachable(&store, "elsewhere").await.unwrap_err();
        assert!(err.to_string().contains("\"elsewhere\" is not reachable"), "{err}");
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime("audio/mpeg"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime("application/zip"), MediaKind::Document);
        assert!(!MediaKind::Document.is_playable());
    }

    #[test]
    fn default_content_type() {
        let media = Media {
            kind: MediaKind::Document,
            name: "a.bin".into(),
            size: 1,
            mime_type: None,
            partition: "p1".into(),
            last_modified: None,
        };
        assert_eq!(media.content_type(), "application/octet-stream");
    }
}
