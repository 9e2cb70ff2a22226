use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::scan_range;
use super::{CasOutcome, KeyValueStore, Versioned, check_version};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, Versioned>,
}

/// Durable store that keeps the whole keyspace in one JSON document.
///
/// Each mutation writes the full snapshot to a sibling temp file and renames
/// it over the original, so a crash leaves either the old or the new
/// snapshot on disk. The in-memory copy only changes after the rename
/// succeeds.
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl JsonFileKvStore {
    /// Opens `path`, loading an existing snapshot or starting empty.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Snapshot::default()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", path.display()));
            }
        };
        info!(
            path = %path.display(),
            keys = snapshot.entries.len(),
            "opened json kv store"
        );
        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming onto {}", self.path.display()))?;
        debug!(keys = snapshot.entries.len(), "persisted kv snapshot");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Versioned>> {
        Ok(self.state.lock().await.entries.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> anyhow::Result<CasOutcome> {
        let mut state = self.state.lock().await;
        let current = state.entries.get(key).map(|entry| entry.version);
        let version = match check_version(current, expected_version) {
            Ok(version) => version,
            Err(mismatch) => return Ok(mismatch),
        };

        let previous = state
            .entries
            .insert(key.to_string(), Versioned { version, value });
        if let Err(err) = self.persist(&state).await {
            match previous {
                Some(previous) => state.entries.insert(key.to_string(), previous),
                None => state.entries.remove(key),
            };
            return Err(err);
        }
        Ok(CasOutcome::Applied { version })
    }

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let matches = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.version == expected_version);
        if !matches {
            return Ok(false);
        }
        let Some(removed) = state.entries.remove(key) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&state).await {
            state.entries.insert(key.to_string(), removed);
            return Err(err);
        }
        Ok(true)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Versioned)>> {
        let state = self.state.lock().await;
        Ok(scan_range(&state.entries, prefix, start_after, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reopen_restores_entries_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let kv = JsonFileKvStore::open(&path).await.unwrap();
            kv.compare_and_set("job/a", None, json!({"state": "pending"}))
                .await
                .unwrap();
            kv.compare_and_set("job/a", Some(1), json!({"state": "eligible"}))
                .await
                .unwrap();
            kv.compare_and_set("job/b", None, json!({})).await.unwrap();
            assert!(kv.delete("job/b", 1).await.unwrap());
        }

        let reopened = JsonFileKvStore::open(&path).await.unwrap();
        let stored = reopened.get("job/a").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value, json!({"state": "eligible"}));
        assert!(reopened.get("job/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let kv = JsonFileKvStore::open(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(kv.scan_prefix("", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(JsonFileKvStore::open(&path).await.is_err());
    }
}
