//! Durable key → JSON blob store for batch pipeline checkpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<JsonValue>>;
    async fn save(&self, key: &str, blob: &JsonValue) -> anyhow::Result<()>;
    /// Idempotent: clearing a missing checkpoint succeeds.
    async fn clear(&self, key: &str) -> anyhow::Result<()>;
    /// Human-readable location reported to operators on failure.
    fn location(&self, key: &str) -> String;
}

/// One JSON file per key under `root`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable file name: readable slug of the key plus a short hash so that
    /// keys which slugify identically never share a file.
    pub fn file_name_for(key: &str) -> String {
        let slug = key
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "checkpoint" } else { slug };

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}.progress.json", slug, &digest[..12])
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(Self::file_name_for(key))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading checkpoint {}", path.display()))
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable checkpoint");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, blob: &JsonValue) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating checkpoint directory {}", self.root.display()))?;

        let path = self.path_for(key);
        let bytes = serde_json::to_vec(blob).context("serializing checkpoint")?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp checkpoint {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp checkpoint {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp checkpoint {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming checkpoint {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing checkpoint {}", path.display())),
        }
    }

    fn location(&self, key: &str) -> String {
        self.path_for(key).display().to_string()
    }
}

/// Process-local checkpoints for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, JsonValue>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.entries.lock().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, blob: &JsonValue) -> anyhow::Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), blob.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("memory:{key}")
    }
}
