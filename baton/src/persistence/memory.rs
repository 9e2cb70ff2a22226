use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{CasOutcome, KeyValueStore, Versioned, check_version};

#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<BTreeMap<String, Versioned>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Range scan shared with the file backend.
pub(crate) fn scan_range(
    entries: &BTreeMap<String, Versioned>,
    prefix: &str,
    start_after: Option<&str>,
    limit: usize,
) -> Vec<(String, Versioned)> {
    let lower = match start_after {
        Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
        _ => Bound::Included(prefix.to_string()),
    };
    entries
        .range((lower, Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(prefix))
        .take(limit)
        .map(|(key, entry)| (key.clone(), entry.clone()))
        .collect()
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Versioned>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> anyhow::Result<CasOutcome> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(key).map(|entry| entry.version);
        match check_version(current, expected_version) {
            Ok(version) => {
                entries.insert(key.to_string(), Versioned { version, value });
                Ok(CasOutcome::Applied { version })
            }
            Err(mismatch) => Ok(mismatch),
        }
    }

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.version == expected_version => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Versioned)>> {
        let entries = self.entries.lock().await;
        Ok(scan_range(&entries, prefix, start_after, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_versions_increase_per_write() {
        let kv = InMemoryKvStore::new();
        let created = kv.compare_and_set("a", None, json!(1)).await.unwrap();
        assert_eq!(created, CasOutcome::Applied { version: 1 });

        let stale = kv.compare_and_set("a", None, json!(2)).await.unwrap();
        assert_eq!(stale, CasOutcome::Mismatch { current: Some(1) });

        let updated = kv.compare_and_set("a", Some(1), json!(3)).await.unwrap();
        assert_eq!(updated, CasOutcome::Applied { version: 2 });
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, json!(3));
    }

    #[tokio::test]
    async fn test_delete_requires_matching_version() {
        let kv = InMemoryKvStore::new();
        kv.compare_and_set("a", None, json!(1)).await.unwrap();
        assert!(!kv.delete("a", 7).await.unwrap());
        assert!(kv.delete("a", 1).await.unwrap());
        assert!(kv.get("a").await.unwrap().is_none());
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_prefix_pages_in_key_order() {
        let kv = InMemoryKvStore::new();
        for key in ["job/c", "job/a", "node/x", "job/b", "jobs"] {
            kv.compare_and_set(key, None, json!(key)).await.unwrap();
        }

        let first = kv.scan_prefix("job/", None, 2).await.unwrap();
        let keys: Vec<_> = first.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["job/a", "job/b"]);

        let rest = kv.scan_prefix("job/", Some("job/b"), 10).await.unwrap();
        let keys: Vec<_> = rest.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["job/c"]);
    }
}
