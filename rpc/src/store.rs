//! Durable, TTL-bounded storage for shared provider health records.
//!
//! Writers use optimistic concurrency: the record's `updated_at` acts as a
//! version marker, and a conditional write fails with [`StoreError::Conflict`]
//! when another instance got there first. Conflicts are detected, not
//! prevented; the caller retries on its next sync cycle.

use crate::clock::SharedClock;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The shared record for one resource key.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredHealthState {
    pub health_score: f64,
    pub updated_at_ms: u64,
    /// Store-enforced expiry, in epoch seconds. A record whose TTL has
    /// passed is semantically absent.
    pub ttl_epoch_s: u64,
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer updated the record between our read and write.
    #[error("conditional write failed: stored updated_at {stored} != expected {expected}")]
    Conflict { expected: u64, stored: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A durable store keyed by resource.
///
/// `read` distinguishes "absent" from a value, and treats expired records
/// as absent. `write` is unconditional when `prev_updated_at_ms` is `None`
/// (first writer for this key) and a compare-and-swap on the stored
/// `updated_at` otherwise.
#[async_trait]
pub trait HealthStateStore: Send + Sync {
    async fn read(&self, resource_key: &str) -> Result<Option<StoredHealthState>, StoreError>;

    async fn write(
        &self,
        resource_key: &str,
        state: StoredHealthState,
        prev_updated_at_ms: Option<u64>,
    ) -> Result<(), StoreError>;
}

fn expired(state: &StoredHealthState, now_ms: u64) -> bool {
    state.ttl_epoch_s < now_ms / 1000
}

fn check_cas(
    current: Option<&StoredHealthState>,
    prev_updated_at_ms: Option<u64>,
) -> Result<(), StoreError> {
    let Some(expected) = prev_updated_at_ms else {
        return Ok(());
    };
    let stored = current.map(|s| s.updated_at_ms).unwrap_or(0);
    if stored != expected {
        return Err(StoreError::Conflict { expected, stored });
    }
    Ok(())
}

/// In-memory store. Backs tests and single-instance deployments.
pub struct InMemoryHealthStateStore {
    records: Mutex<HashMap<String, StoredHealthState>>,
    clock: SharedClock,
}

impl InMemoryHealthStateStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl HealthStateStore for InMemoryHealthStateStore {
    async fn read(&self, resource_key: &str) -> Result<Option<StoredHealthState>, StoreError> {
        let records = self.records.lock();
        let Some(state) = records.get(resource_key) else {
            tracing::debug!(resource = resource_key, "no health record");
            return Ok(None);
        };
        if expired(state, self.clock.now_ms()) {
            tracing::debug!(
                resource = resource_key,
                ttl = state.ttl_epoch_s,
                "health record has expired",
            );
            return Ok(None);
        }
        Ok(Some(*state))
    }

    async fn write(
        &self,
        resource_key: &str,
        state: StoredHealthState,
        prev_updated_at_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        check_cas(records.get(resource_key), prev_updated_at_ms)?;
        records.insert(resource_key.to_string(), state);
        Ok(())
    }
}

/// Filesystem store: one JSON document per resource key, written to a temp
/// file and renamed into place. Suitable for instances sharing a volume.
pub struct FilesystemHealthStateStore {
    dir: PathBuf,
    clock: SharedClock,
}

impl FilesystemHealthStateStore {
    pub fn new(dir: impl Into<PathBuf>, clock: SharedClock) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, clock })
    }

    fn record_path(&self, resource_key: &str) -> PathBuf {
        self.dir.join(format!("{resource_key}.json"))
    }

    fn load(&self, path: &Path) -> Result<Option<StoredHealthState>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl HealthStateStore for FilesystemHealthStateStore {
    async fn read(&self, resource_key: &str) -> Result<Option<StoredHealthState>, StoreError> {
        let Some(state) = self.load(&self.record_path(resource_key))? else {
            return Ok(None);
        };
        if expired(&state, self.clock.now_ms()) {
            tracing::debug!(
                resource = resource_key,
                ttl = state.ttl_epoch_s,
                "health record has expired",
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn write(
        &self,
        resource_key: &str,
        state: StoredHealthState,
        prev_updated_at_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let path = self.record_path(resource_key);
        check_cas(self.load(&path)?.as_ref(), prev_updated_at_ms)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&state)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn state(score: f64, updated_at_ms: u64, ttl_epoch_s: u64) -> StoredHealthState {
        StoredHealthState {
            health_score: score,
            updated_at_ms,
            ttl_epoch_s,
        }
    }

    #[tokio::test]
    async fn test_in_memory_read_absent() {
        let store = InMemoryHealthStateStore::new(Arc::new(ManualClock::new(0)));
        assert_eq!(store.read("1_INFURA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_cas_round_trip() {
        let store = InMemoryHealthStateStore::new(Arc::new(ManualClock::new(10_000)));

        // First writer goes in unconditionally.
        store
            .write("1_INFURA", state(-100.0, 10_000, 100), None)
            .await
            .unwrap();

        // Second write keyed on the first write's updated_at succeeds.
        store
            .write("1_INFURA", state(-150.0, 11_000, 101), Some(10_000))
            .await
            .unwrap();

        let stored = store.read("1_INFURA").await.unwrap().unwrap();
        assert_eq!(stored.health_score, -150.0);
        assert_eq!(stored.updated_at_ms, 11_000);
    }

    #[tokio::test]
    async fn test_in_memory_cas_conflict_leaves_record_untouched() {
        let store = InMemoryHealthStateStore::new(Arc::new(ManualClock::new(10_000)));
        store
            .write("1_INFURA", state(-100.0, 10_000, 100), None)
            .await
            .unwrap();

        // A writer that read an older updated_at loses.
        let err = store
            .write("1_INFURA", state(-999.0, 12_000, 102), Some(9_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 9_000,
                stored: 10_000
            }
        ));

        let stored = store.read("1_INFURA").await.unwrap().unwrap();
        assert_eq!(stored.health_score, -100.0);
    }

    #[tokio::test]
    async fn test_expired_record_reads_as_absent() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = InMemoryHealthStateStore::new(clock.clone());

        // TTL 30s out from a 10s clock.
        store
            .write("1_INFURA", state(-100.0, 10_000, 40), None)
            .await
            .unwrap();
        assert!(store.read("1_INFURA").await.unwrap().is_some());

        // 60s later the record is past its TTL.
        clock.advance_ms(60_000);
        assert_eq!(store.read("1_INFURA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filesystem_round_trip_and_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FilesystemHealthStateStore::new(dir.path(), Arc::new(ManualClock::new(10_000)))
                .unwrap();

        assert_eq!(store.read("1_INFURA").await.unwrap(), None);

        store
            .write("1_INFURA", state(-50.0, 10_000, 100), None)
            .await
            .unwrap();
        assert_eq!(
            store.read("1_INFURA").await.unwrap(),
            Some(state(-50.0, 10_000, 100))
        );

        let err = store
            .write("1_INFURA", state(-75.0, 11_000, 101), Some(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        store
            .write("1_INFURA", state(-75.0, 11_000, 101), Some(10_000))
            .await
            .unwrap();
        assert_eq!(
            store.read("1_INFURA").await.unwrap(),
            Some(state(-75.0, 11_000, 101))
        );
    }
}
