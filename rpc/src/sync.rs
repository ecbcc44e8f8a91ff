use crate::clock::SharedClock;
use crate::store::{HealthStateStore, StoreError, StoredHealthState};
use shared::metrics::Metrics;
use std::sync::Arc;

/// Result of one sync attempt. `health_score` carries no meaning when
/// `synced` is false; callers must not treat the default 0 as a score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncResult {
    pub synced: bool,
    pub health_score: f64,
}

impl SyncResult {
    fn skipped() -> Self {
        Self {
            synced: false,
            health_score: 0.0,
        }
    }
}

/// Merges one instance's locally accumulated health-score delta into the
/// shared record for a resource.
///
/// Sync is an optimization, not a correctness requirement: store trouble,
/// timeouts, and lost optimistic-concurrency races all degrade to
/// `synced: false`, and the caller keeps operating on local health
/// knowledge until the next cycle.
pub struct HealthStateSyncer {
    resource_key: String,
    metric_prefix: String,
    sync_interval_s: u64,
    db_ttl_s: u64,
    last_sync_timestamp_ms: u64,
    store: Arc<dyn HealthStateStore>,
    metrics: Metrics,
    clock: SharedClock,
}

impl HealthStateSyncer {
    pub fn new(
        resource_key: impl Into<String>,
        metric_prefix: impl Into<String>,
        sync_interval_s: u64,
        db_ttl_s: u64,
        store: Arc<dyn HealthStateStore>,
        metrics: Metrics,
        clock: SharedClock,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            metric_prefix: metric_prefix.into(),
            sync_interval_s,
            db_ttl_s,
            last_sync_timestamp_ms: 0,
            store,
            metrics,
            clock,
        }
    }

    /// Merge `local_score_delta` into the shared record, at most once per
    /// sync interval. Rate-limited calls return immediately without I/O so
    /// a large fleet cannot hammer the store on every request.
    pub async fn maybe_sync(&mut self, local_score_delta: f64) -> SyncResult {
        self.metric("db_sync_REQUESTED");

        let now_ms = self.clock.now_ms();
        if now_ms.saturating_sub(self.last_sync_timestamp_ms) < 1000 * self.sync_interval_s {
            return SyncResult::skipped();
        }
        self.metric("db_sync_SAMPLED");

        match self.sync(local_score_delta, now_ms).await {
            Ok(new_score) => {
                self.last_sync_timestamp_ms = now_ms;
                self.metric("db_sync_SUCCESS");
                SyncResult {
                    synced: true,
                    health_score: new_score,
                }
            }
            Err(StoreError::Conflict { expected, stored }) => {
                // Losing the write race is the mechanism working as designed
                // under contention; the delta merges on a later cycle.
                tracing::info!(
                    resource = %self.resource_key,
                    expected,
                    stored,
                    "lost health sync write race",
                );
                self.metric("db_sync_FAIL");
                SyncResult::skipped()
            }
            Err(error) => {
                tracing::error!(resource = %self.resource_key, %error, "health sync failed");
                self.metric("db_sync_FAIL");
                SyncResult::skipped()
            }
        }
    }

    async fn sync(&self, local_score_delta: f64, now_ms: u64) -> Result<f64, StoreError> {
        let stored = self.store.read(&self.resource_key).await?;

        // Absent and expired records both read as "no known score".
        let db_score = stored.map(|s| s.health_score).unwrap_or(0.0);
        let prev_updated_at = stored.map(|s| s.updated_at_ms);

        let new_score = db_score + local_score_delta;
        let state = StoredHealthState {
            health_score: new_score,
            updated_at_ms: now_ms,
            ttl_epoch_s: now_ms / 1000 + self.db_ttl_s,
        };
        self.store
            .write(&self.resource_key, state, prev_updated_at)
            .await?;

        tracing::info!(
            resource = %self.resource_key,
            local_score_delta,
            new_score,
            "synced health score with shared store",
        );
        Ok(new_score)
    }

    fn metric(&self, suffix: &str) {
        self.metrics.incr(&format!("{}_{suffix}", self.metric_prefix));
    }
}
