//! Short-link registry: opaque public tokens → stored objects.
//!
//! Entries live in memory and, when a journal path is configured, are also
//! appended to a JSONL file that is replayed on start-up. An entry is written
//! to the journal before it becomes resolvable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::store::ObjectDescriptor;

/// Random bytes per token (11 URL-safe characters).
const TOKEN_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub token: String,
    pub object: ObjectDescriptor,
    pub created_at: DateTime<Utc>,
}

pub struct LinkRegistry {
    entries: RwLock<HashMap<String, LinkEntry>>,
    journal: Option<Journal>,
}

struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl LinkRegistry {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// Open (or create) a journal-backed registry, replaying existing entries.
    /// Unparseable lines, such as one torn by a crash mid-write, are skipped.
    pub async fn open(path: &Path) -> GatewayResult<Self> {
        let mut entries = HashMap::new();
        let mut needs_newline = false;
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                needs_newline = !text.is_empty() && !text.ends_with('\n');
                for (lineno, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LinkEntry>(line) {
                        Ok(entry) => {
                            entries.insert(entry.token.clone(), entry);
                        }
                        Err(e) => warn!(?path, line = lineno + 1, "skipping bad journal line: {e}"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GatewayError::Internal(format!("read link journal: {e}"))),
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::Internal(format!("create journal dir: {e}")))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| GatewayError::Internal(format!("open link journal: {e}")))?;
        if needs_newline {
            // Terminate a torn tail so the next entry starts on its own line.
            file.write_all(b"\n")
                .await
                .map_err(|e| GatewayError::Internal(format!("repair link journal: {e}")))?;
        }
        info!(?path, links = entries.len(), "link journal loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            journal: Some(Journal {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            }),
        })
    }

    /// Register `object` under a fresh random token.
    pub async fn issue(&self, object: ObjectDescriptor) -> GatewayResult<LinkEntry> {
        let entry = LinkEntry {
            token: generate_token(),
            object,
            created_at: Utc::now(),
        };
        if let Some(journal) = &self.journal {
            let mut line = serde_json::to_vec(&entry)
                .map_err(|e| GatewayError::Internal(format!("encode link: {e}")))?;
            line.push(b'\n');
            let mut file = journal.file.lock().await;
            let appended = async {
                file.write_all(&line).await?;
                file.flush().await
            };
            appended.await.map_err(|e| {
                GatewayError::Internal(format!("append {}: {e}", journal.path.display()))
            })?;
        }
        self.entries
            .write()
            .insert(entry.token.clone(), entry.clone());
        Ok(entry)
    }

    pub fn resolve(&self, token: &str) -> GatewayResult<ObjectDescriptor> {
        self.entries
            .read()
            .get(token)
            .map(|e| e.object.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("link {token}")))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 11);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let links = LinkRegistry::in_memory();
        let entry = links.issue(ObjectDescriptor::new("media", 7)).await.unwrap();
        for _ in 0..3 {
            assert_eq!(
                links.resolve(&entry.token).unwrap(),
                ObjectDescriptor::new("media", 7)
            );
        }
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let links = LinkRegistry::in_memory();
        assert!(matches!(
            links.resolve("nope"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn journal_is_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links/links.jsonl");

        let token = {
            let links = LinkRegistry::open(&path).await.unwrap();
            links.issue(ObjectDescriptor::new("media", 1)).await.unwrap();
            links.issue(ObjectDescriptor::new("media", 2)).await.unwrap().token
        };

        let reopened = LinkRegistry::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.resolve(&token).unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn torn_journal_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.jsonl");
        let good = LinkEntry {
            token: "abc".into(),
            object: ObjectDescriptor::new("media", 3),
            created_at: Utc::now(),
        };
        let text = format!("{}\n{{\"token\":\"tor", serde_json::to_string(&good).unwrap());
        tokio::fs::write(&path, text).await.unwrap();

        let links = LinkRegistry::open(&path).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(links.resolve("abc").is_ok());

        let fresh = links.issue(ObjectDescriptor::new("media", 4)).await.unwrap();
        drop(links);
        let reopened = LinkRegistry::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.resolve(&fresh.token).unwrap().sequence, 4);
    }
}
