//! Ingestion: spool incoming content to a temporary file, append it to the
//! store, and issue a public link for it.
//!
//! Content arrives either pushed by a client or pulled from a URL. It is
//! written to disk incrementally and never held in memory as a whole. The
//! spool file is removed once the upload finishes, whether it succeeded or
//! not.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::links::LinkRegistry;
use crate::store::{ObjectDescriptor, ObjectStore, Upload};

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Download,
    Persist,
}

/// Transfer progress. `bytes_total` is unknown when the source did not
/// announce a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestProgress {
    pub stage: IngestStage,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

pub type ProgressSender = mpsc::Sender<IngestProgress>;

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub token: String,
    pub link: String,
    #[serde(skip)]
    pub object: ObjectDescriptor,
}

pub struct Ingestor {
    store: Arc<dyn ObjectStore>,
    links: Arc<LinkRegistry>,
    http: reqwest::Client,
    spool_dir: PathBuf,
    base_url: String,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        links: Arc<LinkRegistry>,
        spool_dir: PathBuf,
        base_url: String,
    ) -> Self {
        Self {
            store,
            links,
            http: reqwest::Client::new(),
            spool_dir,
            base_url,
        }
    }

    /// Ingest content pushed directly by a client.
    pub async fn ingest_stream<S, E>(
        &self,
        name: &str,
        mime_type: Option<&str>,
        body: S,
        progress: Option<ProgressSender>,
    ) -> GatewayResult<IngestReceipt>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let name = clean_name(name);
        let mime_type = mime_type
            .map(str::to_owned)
            .unwrap_or_else(|| guess_mime(&name));
        let (spool, size) = self.spool(body, None, progress.as_ref()).await?;
        self.finish(spool, name, mime_type, size, progress.as_ref())
            .await
    }

    /// Pull `url` into the store.
    pub async fn ingest_url(
        &self,
        url: &str,
        progress: Option<ProgressSender>,
    ) -> GatewayResult<IngestReceipt> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::BadRequest(format!("invalid url: {e}")))?;
        let name = name_from_url(&parsed);

        let resp = self
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| GatewayError::IngestionFailed(format!("download: {e}")))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(GatewayError::IngestionFailed(format!(
                "download failed with status {}",
                resp.status()
            )));
        }
        let total = resp.content_length();
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| guess_mime(&name));

        let (spool, size) = self
            .spool(resp.bytes_stream(), total, progress.as_ref())
            .await?;
        self.finish(spool, name, mime_type, size, progress.as_ref())
            .await
    }

    /// Write `body` to a fresh spool file. The returned [`TempPath`] deletes
    /// the file when dropped.
    async fn spool<S, E>(
        &self,
        body: S,
        total: Option<u64>,
        progress: Option<&ProgressSender>,
    ) -> GatewayResult<(TempPath, u64)>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|e| GatewayError::IngestionFailed(format!("create spool dir: {e}")))?;
        let spool = tempfile::Builder::new()
            .prefix("ingest-")
            .tempfile_in(&self.spool_dir)
            .map_err(|e| GatewayError::IngestionFailed(format!("create spool file: {e}")))?
            .into_temp_path();

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&spool)
            .await
            .map_err(|e| GatewayError::IngestionFailed(format!("open spool file: {e}")))?;

        let mut body = std::pin::pin!(body);
        let mut written = 0u64;
        while let Some(piece) = body.next().await {
            let piece = piece.map_err(|e| GatewayError::IngestionFailed(format!("receive: {e}")))?;
            file.write_all(&piece)
                .await
                .map_err(|e| GatewayError::IngestionFailed(format!("write spool file: {e}")))?;
            written += piece.len() as u64;
            report(progress, IngestStage::Download, written, total);
        }
        file.flush()
            .await
            .map_err(|e| GatewayError::IngestionFailed(format!("flush spool file: {e}")))?;

        Ok((spool, written))
    }

    async fn finish(
        &self,
        spool: TempPath,
        name: String,
        mime_type: String,
        size: u64,
        progress: Option<&ProgressSender>,
    ) -> GatewayResult<IngestReceipt> {
        report(progress, IngestStage::Persist, 0, Some(size));
        let upload = Upload {
            path: spool.to_path_buf(),
            name: name.clone(),
            mime_type,
            size,
        };
        let persisted = self.store.persist(upload).await;
        if let Err(e) = spool.close() {
            warn!("failed to remove spool file: {e}");
        }
        let object = persisted?;
        report(progress, IngestStage::Persist, size, Some(size));

        let entry = self.links.issue(object.clone()).await?;
        info!(object = %object, size, name = %name, token = %entry.token, "ingested");
        Ok(IngestReceipt {
            link: format!("{}/show/{}", self.base_url, entry.token),
            token: entry.token,
            object,
        })
    }
}

/// Publish progress without ever waiting on the consumer.
fn report(progress: Option<&ProgressSender>, stage: IngestStage, done: u64, total: Option<u64>) {
    if let Some(tx) = progress {
        let _ = tx.try_send(IngestProgress {
            stage,
            bytes_done: done,
            bytes_total: total,
        });
    }
}

fn clean_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() {
        fallback_name()
    } else {
        base.to_string()
    }
}

fn name_from_url(url: &reqwest::Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = urlencoding::decode(last)
        .map(|n| n.into_owned())
        .unwrap_or_else(|_| last.to_string());
    clean_name(&decoded)
}

fn fallback_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("file_{secs}")
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn ingestor(spool_dir: PathBuf) -> (Ingestor, Arc<MemoryStore>, Arc<LinkRegistry>) {
        let store = Arc::new(MemoryStore::new("media", "p1"));
        let links = Arc::new(LinkRegistry::in_memory());
        let ingestor = Ingestor::new(
            store.clone(),
            links.clone(),
            spool_dir,
            "https://dl.example".into(),
        );
        (ingestor, store, links)
    }

    fn body(pieces: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures::stream::iter(pieces.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[test]
    fn names_from_urls() {
        let url = reqwest::Url::parse("https://host/a/b/Movie%20(2020).mkv?x=1").unwrap();
        assert_eq!(name_from_url(&url), "Movie (2020).mkv");
        let url = reqwest::Url::parse("https://host/").unwrap();
        assert!(name_from_url(&url).starts_with("file_"));
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(guess_mime("clip.mp4"), "video/mp4");
        assert_eq!(guess_mime("noext"), FALLBACK_MIME);
    }

    #[tokio::test]
    async fn pushed_content_is_persisted_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, store, links) = ingestor(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(16);

        let receipt = ingestor
            .ingest_stream("song.mp3", None, body(vec![b"abc", b"defg"]), Some(tx))
            .await
            .unwrap();

        assert_eq!(receipt.link, format!("https://dl.example/show/{}", receipt.token));
        let object = links.resolve(&receipt.token).unwrap();
        let media = store.stat(&object).await.unwrap().unwrap();
        assert_eq!(media.size, 7);
        assert_eq!(media.mime_type.as_deref(), Some("audio/mpeg"));

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events[0].bytes_done, 3);
        assert_eq!(events.last().unwrap().stage, IngestStage::Persist);
        assert_eq!(events.last().unwrap().bytes_done, 7);

        // Spool file is gone.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_transfer_removes_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _store, links) = ingestor(dir.path().to_path_buf());
        let broken = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]);

        let err = ingestor
            .ingest_stream("x.bin", None, broken, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::IngestionFailed(_)));
        assert!(links.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn full_progress_channel_does_not_stall_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _store, _links) = ingestor(dir.path().to_path_buf());
        let (tx, _rx) = mpsc::channel(1);
        let pieces: Vec<&'static [u8]> = vec![b"a"; 64];

        let receipt = ingestor
            .ingest_stream("many.bin", None, body(pieces), Some(tx))
            .await;
        assert!(receipt.is_ok());
    }

    #[tokio::test]
    async fn empty_upload_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, store, links) = ingestor(dir.path().to_path_buf());
        let receipt = ingestor
            .ingest_stream("empty.txt", Some("text/plain"), body(vec![]), None)
            .await
            .unwrap();
        let object = links.resolve(&receipt.token).unwrap();
        assert_eq!(store.stat(&object).await.unwrap().unwrap().size, 0);
    }
}
