use crate::config::ProviderTuning;

/// Outcome of one upstream call, as classified by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    SuccessHighLatency,
    Failed,
}

#[derive(Clone, Copy, Debug, Default)]
struct PerfStat {
    last_call_timestamp_ms: u64,
    last_call_latency_ms: u64,
    last_call_succeeded: bool,
    time_waited_before_last_call_ms: u64,
}

/// Process-local health bookkeeping for one provider.
///
/// The score only ever moves down on penalties and back up toward zero on
/// recovery credit; zero is "fully healthy". The delta accumulated since
/// the last successful store sync is tracked separately so it can be merged
/// into the shared record and survives lost sync races.
pub struct HealthLedger {
    tuning: ProviderTuning,
    health_score: f64,
    healthy: bool,
    score_delta_since_sync: f64,
    perf: PerfStat,
}

impl HealthLedger {
    pub fn new(tuning: ProviderTuning) -> Self {
        Self {
            tuning,
            health_score: 0.0,
            healthy: true,
            score_delta_since_sync: 0.0,
            perf: PerfStat::default(),
        }
    }

    pub fn health_score(&self) -> f64 {
        self.health_score
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Score adjustment accumulated since the last successful sync.
    pub fn pending_delta(&self) -> f64 {
        self.score_delta_since_sync
    }

    pub fn record_call_start(&mut self, now_ms: u64) {
        if self.perf.last_call_timestamp_ms > 0 {
            self.perf.time_waited_before_last_call_ms =
                now_ms.saturating_sub(self.perf.last_call_timestamp_ms);
        }
    }

    /// Record the finished call and fold its outcome into the score.
    pub fn record_call_end(&mut self, start_ms: u64, end_ms: u64, succeeded: bool) -> CallOutcome {
        self.perf.last_call_timestamp_ms = end_ms;
        self.perf.last_call_latency_ms = end_ms.saturating_sub(start_ms);
        self.perf.last_call_succeeded = succeeded;
        self.evaluate_last_call()
    }

    fn evaluate_last_call(&mut self) -> CallOutcome {
        let outcome = if !self.perf.last_call_succeeded {
            self.apply_penalty(self.tuning.error_penalty);
            CallOutcome::Failed
        } else if self.perf.last_call_latency_ms > self.tuning.max_latency_allowed_ms {
            self.apply_penalty(self.tuning.high_latency_penalty);
            CallOutcome::SuccessHighLatency
        } else {
            // A clean call after idle time earns recovery credit. No reward
            // for back-to-back normal operation.
            let waited = self
                .perf
                .time_waited_before_last_call_ms
                .min(self.tuning.recover_max_wait_to_acknowledge_ms);
            if waited > 0 {
                self.recover(waited);
            }
            CallOutcome::Success
        };
        self.refresh_healthiness();
        outcome
    }

    fn apply_penalty(&mut self, penalty: f64) {
        self.health_score += penalty;
        self.score_delta_since_sync += penalty;
    }

    fn recover(&mut self, waited_ms: u64) {
        if self.health_score >= 0.0 {
            return;
        }
        let credit = (waited_ms as f64 * self.tuning.recover_score_per_ms).min(-self.health_score);
        self.health_score += credit;
        self.score_delta_since_sync += credit;
    }

    fn refresh_healthiness(&mut self) {
        if self.healthy && self.health_score < self.tuning.health_score_fallback_threshold {
            self.healthy = false;
        } else if !self.healthy && self.health_score > self.tuning.health_score_recover_threshold {
            self.healthy = true;
        }
    }

    /// Fold a successful sync back in: the synced part of the delta is
    /// settled, and the fleet-wide score becomes the new baseline under
    /// whatever accumulated after the sync snapshot was taken.
    pub fn commit_synced(&mut self, synced_delta: f64, shared_score: f64) {
        self.score_delta_since_sync -= synced_delta;
        self.health_score = shared_score + self.score_delta_since_sync;
        self.refresh_healthiness();
    }
}
