use crate::clock::SharedClock;
use crate::config::ProviderTuning;
use crate::ledger::{CallOutcome, HealthLedger};
use crate::sync::HealthStateSyncer;
use crate::transport::{RpcTransport, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use shared::metrics::{MetricUnit, Metrics};
use std::sync::Arc;

/// Methods representative enough to use for shadow latency evaluation.
pub const MAJOR_METHODS: &[&str] = &["eth_blockNumber", "eth_call"];

#[derive(Default)]
struct EvalState {
    last_health_evaluation_ms: u64,
    last_latency_evaluation_ms: u64,
    evaluating_health: bool,
}

/// One upstream RPC provider with local health bookkeeping.
///
/// Every call is classified into the ledger and emitted as a metric under
/// the `RPC_<provider>_<chain>` prefix; dashboards key off those names
/// verbatim. When db sync is enabled, the accumulated score delta is merged
/// into the shared store after calls, on the syncer's cadence.
pub struct SingleRpcProvider {
    name: String,
    chain_id: u64,
    metric_prefix: String,
    transport: Arc<dyn RpcTransport>,
    tuning: ProviderTuning,
    ledger: Mutex<HealthLedger>,
    eval: Mutex<EvalState>,
    syncer: Option<tokio::sync::Mutex<HealthStateSyncer>>,
    metrics: Metrics,
    clock: SharedClock,
}

impl SingleRpcProvider {
    pub fn new(
        name: impl Into<String>,
        chain_id: u64,
        transport: Arc<dyn RpcTransport>,
        tuning: ProviderTuning,
        syncer: Option<HealthStateSyncer>,
        metrics: Metrics,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        Self {
            metric_prefix: format!("RPC_{name}_{chain_id}"),
            name,
            chain_id,
            transport,
            ledger: Mutex::new(HealthLedger::new(tuning.clone())),
            eval: Mutex::new(EvalState::default()),
            tuning,
            syncer: syncer.map(tokio::sync::Mutex::new),
            metrics,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_healthy(&self) -> bool {
        self.ledger.lock().is_healthy()
    }

    pub fn health_score(&self) -> f64 {
        self.ledger.lock().health_score()
    }

    pub fn log_provider_selection(&self) {
        self.incr("selected");
    }

    /// Issue an RPC call through this provider, recording its outcome.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let start_ms = self.clock.now_ms();
        self.ledger.lock().record_call_start(start_ms);

        let result = self.transport.send(method, params).await;

        let end_ms = self.clock.now_ms();
        let (outcome, pending_delta) = {
            let mut ledger = self.ledger.lock();
            let outcome = ledger.record_call_end(start_ms, end_ms, result.is_ok());
            (outcome, ledger.pending_delta())
        };

        match outcome {
            CallOutcome::Success => self.incr(&format!("{method}_SUCCESS")),
            CallOutcome::SuccessHighLatency => self.incr(&format!("{method}_SUCCESS_HIGH_LATENCY")),
            CallOutcome::Failed => self.incr(&format!("{method}_FAILED")),
        }
        if let Err(error) = &result {
            tracing::error!(provider = %self.name, chain = self.chain_id, method, %error, "upstream call failed");
        }

        self.maybe_sync_health(pending_delta).await;
        self.metrics.put_metric(
            &format!("{}_health_score", self.metric_prefix),
            self.health_score(),
            MetricUnit::None,
        );

        result
    }

    async fn maybe_sync_health(&self, pending_delta: f64) {
        let Some(syncer) = &self.syncer else {
            return;
        };
        // The ledger lock is never held across store I/O; consistency with
        // other instances comes from the store's compare-and-swap alone.
        let result = syncer.lock().await.maybe_sync(pending_delta).await;
        if result.synced {
            self.ledger
                .lock()
                .commit_synced(pending_delta, result.health_score);
        }
    }

    /// Probe an unhealthy provider to see whether it has recovered. The
    /// probe goes through the normal call path so its outcome lands in the
    /// ledger like any other call.
    pub async fn evaluate_healthiness(&self) {
        {
            let mut eval = self.eval.lock();
            if eval.evaluating_health {
                return;
            }
            eval.evaluating_health = true;
        }
        self.incr("check_health");

        let _ = self.call("eth_blockNumber", Value::Array(Vec::new())).await;

        let mut eval = self.eval.lock();
        eval.evaluating_health = false;
        eval.last_health_evaluation_ms = self.clock.now_ms();
    }

    pub fn is_evaluating_healthiness(&self) -> bool {
        self.eval.lock().evaluating_health
    }

    pub fn has_enough_wait_since_last_health_evaluation(&self) -> bool {
        let last = self.eval.lock().last_health_evaluation_ms;
        self.clock.now_ms().saturating_sub(last)
            >= 1000 * self.tuning.health_evaluation_wait_period_s
    }

    /// Shadow-call a major method on this provider purely to observe its
    /// latency. Rate-limited per provider; never affects any response.
    pub async fn evaluate_latency(&self, method: &str, params: Value) {
        {
            let mut eval = self.eval.lock();
            let now_ms = self.clock.now_ms();
            if now_ms.saturating_sub(eval.last_latency_evaluation_ms)
                < 1000 * self.tuning.latency_evaluation_wait_period_s
            {
                return;
            }
            eval.last_latency_evaluation_ms = now_ms;
        }
        self.incr("evaluate_latency");

        let start_ms = self.clock.now_ms();
        let result = self.call(method, params).await;
        if result.is_ok() {
            let latency_ms = self.clock.now_ms().saturating_sub(start_ms);
            self.log_evaluated_latency(method, latency_ms);
        }
    }

    /// Record an observed latency for a method under this provider's prefix.
    pub fn log_evaluated_latency(&self, method: &str, latency_ms: u64) {
        self.metrics.put_metric(
            &format!("{}_evaluated_latency_{method}", self.metric_prefix),
            latency_ms as f64,
            MetricUnit::Milliseconds,
        );
    }

    fn incr(&self, suffix: &str) {
        self.metrics
            .incr(&format!("{}_{suffix}", self.metric_prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{HealthStateStore, InMemoryHealthStateStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockTransport {
        clock: Arc<ManualClock>,
        latency_ms: u64,
        fail: AtomicBool,
    }

    impl MockTransport {
        fn ok(clock: Arc<ManualClock>, latency_ms: u64) -> Self {
            Self {
                clock,
                latency_ms,
                fail: AtomicBool::new(false),
            }
        }

        fn failing(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                latency_ms: 10,
                fail: AtomicBool::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl RpcTransport for MockTransport {
        async fn send(&self, _method: &str, _params: Value) -> Result<Value, TransportError> {
            self.clock.advance_ms(self.latency_ms);
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::MalformedResponse("mock failure".to_string()))
            } else {
                Ok(json!("0x10"))
            }
        }
    }

    fn tuning() -> ProviderTuning {
        ProviderTuning {
            db_sync_interval_s: 0,
            ..ProviderTuning::default()
        }
    }

    fn provider(
        transport: MockTransport,
        syncer: Option<HealthStateSyncer>,
        metrics: Metrics,
        clock: Arc<ManualClock>,
    ) -> SingleRpcProvider {
        SingleRpcProvider::new(
            "INFURA",
            1,
            Arc::new(transport),
            tuning(),
            syncer,
            metrics,
            clock,
        )
    }

    #[tokio::test]
    async fn test_successful_call_emits_success_metric() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::ok(clock.clone(), 50),
            None,
            metrics.clone(),
            clock,
        );

        let result = p.call("eth_blockNumber", json!([])).await.unwrap();
        assert_eq!(result, json!("0x10"));
        assert_eq!(metrics.count_of("RPC_INFURA_1_eth_blockNumber_SUCCESS"), 1);
        assert_eq!(p.health_score(), 0.0);
    }

    #[tokio::test]
    async fn test_failed_call_is_penalized() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::failing(clock.clone()),
            None,
            metrics.clone(),
            clock,
        );

        assert!(p.call("eth_call", json!([])).await.is_err());
        assert_eq!(metrics.count_of("RPC_INFURA_1_eth_call_FAILED"), 1);
        assert_eq!(p.health_score(), -50.0);
    }

    #[tokio::test]
    async fn test_slow_call_counts_as_degraded_success() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::ok(clock.clone(), 5_000),
            None,
            metrics.clone(),
            clock,
        );

        assert!(p.call("eth_blockNumber", json!([])).await.is_ok());
        assert_eq!(
            metrics.count_of("RPC_INFURA_1_eth_blockNumber_SUCCESS_HIGH_LATENCY"),
            1
        );
        assert_eq!(p.health_score(), -20.0);
    }

    #[tokio::test]
    async fn test_call_drains_delta_into_shared_store() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(InMemoryHealthStateStore::new(clock.clone()));
        let metrics = Metrics::new_recording();
        let syncer = HealthStateSyncer::new(
            "1_INFURA",
            "RPC_INFURA_1",
            0,
            30,
            store.clone(),
            metrics.clone(),
            clock.clone(),
        );
        let p = provider(
            MockTransport::failing(clock.clone()),
            Some(syncer),
            metrics.clone(),
            clock,
        );

        assert!(p.call("eth_call", json!([])).await.is_err());

        let stored = store.read("1_INFURA").await.unwrap().unwrap();
        assert_eq!(stored.health_score, -50.0);
        assert_eq!(metrics.count_of("RPC_INFURA_1_db_sync_SUCCESS"), 1);
        // The delta was settled; the local score adopted the shared value.
        assert_eq!(p.health_score(), -50.0);
        assert_eq!(p.ledger.lock().pending_delta(), 0.0);
    }

    #[tokio::test]
    async fn test_selection_metric_uses_resource_prefix() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::ok(clock.clone(), 10),
            None,
            metrics.clone(),
            clock,
        );

        p.log_provider_selection();
        assert_eq!(metrics.count_of("RPC_INFURA_1_selected"), 1);
    }

    #[tokio::test]
    async fn test_latency_evaluation_is_rate_limited() {
        let clock = Arc::new(ManualClock::new(100_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::ok(clock.clone(), 25),
            None,
            metrics.clone(),
            clock.clone(),
        );

        p.evaluate_latency("eth_blockNumber", json!([])).await;
        assert_eq!(metrics.count_of("RPC_INFURA_1_evaluate_latency"), 1);
        let recorded = metrics.recorded();
        let latency = recorded
            .iter()
            .find(|e| e.name == "RPC_INFURA_1_evaluated_latency_eth_blockNumber")
            .unwrap();
        assert_eq!(latency.value, 25.0);

        // Within the wait period: no second evaluation.
        p.evaluate_latency("eth_blockNumber", json!([])).await;
        assert_eq!(metrics.count_of("RPC_INFURA_1_evaluate_latency"), 1);

        clock.advance_ms(61_000);
        p.evaluate_latency("eth_blockNumber", json!([])).await;
        assert_eq!(metrics.count_of("RPC_INFURA_1_evaluate_latency"), 2);
    }

    #[tokio::test]
    async fn test_health_probe_records_outcome() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Metrics::new_recording();
        let p = provider(
            MockTransport::ok(clock.clone(), 10),
            None,
            metrics.clone(),
            clock,
        );

        p.evaluate_healthiness().await;
        assert_eq!(metrics.count_of("RPC_INFURA_1_check_health"), 1);
        assert_eq!(metrics.count_of("RPC_INFURA_1_eth_blockNumber_SUCCESS"), 1);
        assert!(!p.is_evaluating_healthiness());
    }
}
