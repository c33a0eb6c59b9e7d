//! Durable on-disk storage of captured payloads

use crate::config::is_single_component;
use crate::error::InterceptError;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// One file to be written below the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// Directory relative to the store root
    pub directory: PathBuf,
    pub filename: String,
    pub payload: Vec<u8>,
}

/// Serialises `value` with 4-space indentation and keys sorted at every depth.
pub fn format_payload(value: &Value) -> Result<Vec<u8>, InterceptError> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    sort_keys(value)
        .serialize(&mut serializer)
        .map_err(|e| InterceptError::malformed(format!("cannot re-encode payload: {}", e)))?;
    Ok(out)
}

// serde_json's `preserve_order` feature would keep insertion order
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Writes capture files below a fixed root directory.
///
/// Writes go to a temporary file that is synced and renamed over the target,
/// and writes to the same target are serialised, so readers never observe a
/// partial file. An existing file is replaced (last write wins).
#[derive(Debug)]
pub struct CaptureStore {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub async fn write_record(&self, record: &CaptureRecord) -> Result<PathBuf, InterceptError> {
        self.write(&record.directory, &record.filename, &record.payload)
            .await
    }

    /// Writes `bytes` to `root/directory/filename`, creating directories as
    /// needed. Returns the final path.
    pub async fn write(
        &self,
        directory: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, InterceptError> {
        if !directory
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(InterceptError::storage(
                directory,
                "capture directory must be relative without `..`",
            ));
        }
        if !is_single_component(filename) {
            return Err(InterceptError::storage(
                directory.join(filename),
                "invalid capture filename",
            ));
        }

        let dir = self.root.join(directory);
        let target = dir.join(filename);

        let lock = self.locks.entry(target.clone()).or_default().clone();
        let written = {
            let _guard = lock.lock().await;
            write_atomic(&dir, &target, filename, bytes).await
        };
        // Only the map and this task hold the lock: nobody is waiting on it
        self.locks.remove_if(&target, |_, entry| Arc::strong_count(entry) == 2);
        written?;

        debug!(path = %target.display(), bytes = bytes.len(), "Capture written");
        Ok(target)
    }
}

async fn write_atomic(
    dir: &Path,
    target: &Path,
    filename: &str,
    bytes: &[u8],
) -> Result<(), InterceptError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| InterceptError::storage(dir, e))?;

    let tmp = dir.join(format!(".{}.{}.tmp", filename, Uuid::new_v4().simple()));
    if let Err(e) = write_synced(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(InterceptError::storage(target, e));
    }
    if let Err(e) = fs::rename(&tmp, target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(InterceptError::storage(target, e));
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
