//! Durable key-value persistence with per-key compare-and-set.
//!
//! The job store and node registry are built on [`KeyValueStore`]; every
//! mutation they perform is a read followed by a conditional write against
//! the version that was read.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{BatonError, Result};

/// In-memory backend, the default for tests and single-process use.
pub mod memory;

/// Single-file JSON snapshot backend.
pub mod file;

/// PostgreSQL backend.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::JsonFileKvStore;
pub use memory::InMemoryKvStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresKvStore;

/// Attempts a read-modify-write makes before giving up with `Conflict`.
const MAX_CAS_RETRIES: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    /// The stored version did not match; `current` is what is stored now
    /// (`None` if the key is absent).
    Mismatch { current: Option<u64> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// The persistence contract consumed by the coordination core.
///
/// Versions start at 1 and grow by one per successful write to a key.
/// `expected_version: None` means "create only if absent".
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Versioned>>;

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> anyhow::Result<CasOutcome>;

    /// Deletes `key` if its version still equals `expected_version`.
    /// Returns whether a row was removed.
    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<bool>;

    /// Keys starting with `prefix`, ascending, strictly after `start_after`.
    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Versioned)>>;
}

/// Shared CAS rule for backends that hold their data in a map.
pub(crate) fn check_version(
    current: Option<u64>,
    expected: Option<u64>,
) -> std::result::Result<u64, CasOutcome> {
    match (current, expected) {
        (None, None) => Ok(1),
        (Some(cur), Some(exp)) if cur == exp => Ok(cur + 1),
        (current, _) => Err(CasOutcome::Mismatch { current }),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Typed optimistic read-modify-write.
///
/// `mutate` may run several times if another writer wins the race; it must
/// be free of side effects other than on its argument. Errors returned by
/// `mutate` abort the loop and are passed through.
pub async fn read_modify_write<T, F>(
    kv: &dyn KeyValueStore,
    key: &str,
    mut mutate: F,
) -> Result<(T, u64)>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(&mut T) -> Result<()> + Send,
{
    for attempt in 0..MAX_CAS_RETRIES {
        let Some(stored) = kv.get(key).await? else {
            return Err(BatonError::NotFound {
                entity: "key",
                id: key.to_string(),
            });
        };
        let mut value: T = decode(stored.value)?;
        mutate(&mut value)?;
        let encoded = encode(&value)?;
        match kv
            .compare_and_set(key, Some(stored.version), encoded)
            .await?
        {
            CasOutcome::Applied { version } => return Ok((value, version)),
            CasOutcome::Mismatch { current } => {
                trace!(key, attempt, ?current, "cas mismatch, retrying");
            }
        }
    }
    Err(BatonError::conflict(key, "too much write contention"))
}

/// Typed create-only write.
pub async fn insert_new<T: Serialize + Sync>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<u64> {
    match kv.compare_and_set(key, None, encode(value)?).await? {
        CasOutcome::Applied { version } => Ok(version),
        CasOutcome::Mismatch { .. } => {
            Err(BatonError::conflict(key, "key already exists"))
        }
    }
}
