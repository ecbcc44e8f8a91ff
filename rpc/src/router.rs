use crate::clock::SharedClock;
use crate::provider::{MAJOR_METHODS, SingleRpcProvider};
use crate::transport::TransportError;
use moka::sync::Cache;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use traffic_switch::Sampler;

/// Provider will never receive traffic but is still perceived as healthy
/// and shadow-evaluated.
pub const WEIGHT_NEVER: i64 = 0;
/// Provider serves only when no healthy provider has a positive weight.
pub const WEIGHT_AS_FALLBACK: i64 = -1;

const SESSION_CACHE_SIZE: u64 = 1000;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no providers configured")]
    NoProviders,

    #[error("weights ({weights}) and providers ({providers}) must have the same length")]
    WeightsLengthMismatch { providers: usize, weights: usize },

    #[error("no healthy provider available")]
    NoHealthyProvider,

    #[error("url weight sum is 0 and no healthy provider may serve as fallback")]
    NoSelectableProvider,

    #[error("session pinned to unhealthy provider {0}")]
    SessionProviderUnhealthy(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug)]
pub struct RouterSettings {
    /// Probability that a served call triggers shadow latency evaluation of
    /// the other healthy providers.
    pub latency_evaluation_sample_prob: f64,
    /// Probability that a served call triggers recovery probes of unhealthy
    /// providers.
    pub health_check_sample_prob: f64,
    /// Whether a session pinned to a now-unhealthy provider may fall back.
    pub session_allow_fallback_when_unhealthy: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            latency_evaluation_sample_prob: 0.01,
            health_check_sample_prob: 0.1,
            session_allow_fallback_when_unhealthy: true,
        }
    }
}

/// Routes calls for one chain across its providers.
///
/// Selection filters to healthy providers and draws by weight; sessions
/// stick to their first provider so one quote sees one view of the chain.
/// After serving a call the router probabilistically shadow-evaluates the
/// latency of the other healthy providers and probes unhealthy ones for
/// recovery; neither affects the served response.
pub struct RpcProviderRouter {
    chain_id: u64,
    providers: Vec<Arc<SingleRpcProvider>>,
    weights: Vec<i64>,
    session_cache: Cache<String, usize>,
    settings: RouterSettings,
    sampler: Sampler,
    clock: SharedClock,
}

impl std::fmt::Debug for RpcProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProviderRouter")
            .field("chain_id", &self.chain_id)
            .field("providers", &self.providers.len())
            .field("weights", &self.weights)
            .field("settings", &self.settings)
            .finish()
    }
}

impl RpcProviderRouter {
    pub fn new(
        chain_id: u64,
        providers: Vec<Arc<SingleRpcProvider>>,
        weights: Option<Vec<i64>>,
        settings: RouterSettings,
        clock: SharedClock,
    ) -> Result<Self, RouterError> {
        if providers.is_empty() {
            return Err(RouterError::NoProviders);
        }
        let weights = weights.unwrap_or_else(|| vec![WEIGHT_AS_FALLBACK; providers.len()]);
        if weights.len() != providers.len() {
            return Err(RouterError::WeightsLengthMismatch {
                providers: providers.len(),
                weights: weights.len(),
            });
        }

        Ok(Self {
            chain_id,
            providers,
            weights,
            session_cache: Cache::builder().max_capacity(SESSION_CACHE_SIZE).build(),
            settings,
            sampler: Sampler::uniform(),
            clock,
        })
    }

    /// Replace the decision source. Test use.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Ready once any provider is healthy.
    pub fn is_ready(&self) -> bool {
        self.providers.iter().any(|p| p.is_healthy())
    }

    pub fn current_healthy_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.is_healthy())
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn current_unhealthy_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| !p.is_healthy())
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn new_session_id(&self) -> String {
        format!(
            "{}-{}",
            self.clock.now_ms(),
            (self.sampler.draw() * 1000.0) as u64
        )
    }

    /// Serve one RPC call through the preferred provider.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, RouterError> {
        let index = self.select_preferred_provider(session_id)?;
        let provider = &self.providers[index];
        provider.log_provider_selection();
        tracing::debug!(
            chain = self.chain_id,
            provider = provider.name(),
            method,
            "serving call",
        );

        let start_ms = self.clock.now_ms();
        let result = provider.call(method, params.clone()).await;
        let latency_ms = self.clock.now_ms().saturating_sub(start_ms);

        // Shadow work only runs on the request-processing path (session id
        // present) and never changes `result`.
        if session_id.is_some() {
            if MAJOR_METHODS.contains(&method)
                && self.sampler.draw() < self.settings.latency_evaluation_sample_prob
            {
                self.evaluate_other_healthy_providers(index, method, &params, latency_ms)
                    .await;
            }
            if self.sampler.draw() < self.settings.health_check_sample_prob {
                self.check_unhealthy_providers(index).await;
            }
        }

        Ok(result?)
    }

    fn select_preferred_provider(&self, session_id: Option<&str>) -> Result<usize, RouterError> {
        // If a session is attached, stick to its provider when possible.
        if let Some(id) = session_id
            && let Some(index) = self.session_cache.get(id)
        {
            let provider = &self.providers[index];
            if provider.is_healthy() {
                return Ok(index);
            }
            if !self.settings.session_allow_fallback_when_unhealthy {
                return Err(RouterError::SessionProviderUnhealthy(
                    provider.name().to_string(),
                ));
            }
        }

        let healthy: Vec<usize> = (0..self.providers.len())
            .filter(|&i| self.providers[i].is_healthy())
            .collect();
        if healthy.is_empty() {
            return Err(RouterError::NoHealthyProvider);
        }

        let index = self.select_by_weight(healthy)?;
        if let Some(id) = session_id {
            self.session_cache.insert(id.to_string(), index);
        }
        Ok(index)
    }

    fn select_by_weight(&self, mut healthy: Vec<usize>) -> Result<usize, RouterError> {
        let weight_sum: i64 = healthy.iter().map(|&i| self.weights[i].max(0)).sum();
        if weight_sum == 0 {
            // Only NEVER/AS_FALLBACK weights remain: the first healthy
            // fallback provider wins.
            return healthy
                .iter()
                .copied()
                .find(|&i| self.weights[i] == WEIGHT_AS_FALLBACK)
                .ok_or(RouterError::NoSelectableProvider);
        }

        // Largest weight first, then walk the accumulated distribution.
        healthy.sort_by_key(|&i| std::cmp::Reverse(self.weights[i]));

        let rand_point = self.sampler.draw() * weight_sum as f64;
        let mut accumulated = 0.0;
        for &i in &healthy {
            let weight = self.weights[i].max(0);
            if weight == 0 {
                continue;
            }
            accumulated += weight as f64;
            if accumulated >= rand_point {
                return Ok(i);
            }
        }

        // Rounding can leave the draw just above the last bucket.
        healthy
            .iter()
            .copied()
            .rev()
            .find(|&i| self.weights[i] > 0)
            .ok_or(RouterError::NoSelectableProvider)
    }

    /// Shadow-call the other healthy providers so their latencies stay
    /// comparable to the one actually serving traffic.
    async fn evaluate_other_healthy_providers(
        &self,
        selected: usize,
        method: &str,
        params: &Value,
        served_latency_ms: u64,
    ) {
        let mut count = 0;
        for (i, provider) in self.providers.iter().enumerate() {
            if i == selected || !provider.is_healthy() {
                continue;
            }
            provider.evaluate_latency(method, params.clone()).await;
            count += 1;
        }
        if count > 0 {
            self.providers[selected].log_evaluated_latency(method, served_latency_ms);
        }
        tracing::debug!(chain = self.chain_id, count, "evaluated other healthy providers");
    }

    /// Probe unhealthy providers that have waited long enough since their
    /// last evaluation.
    async fn check_unhealthy_providers(&self, selected: usize) {
        let mut count = 0;
        for (i, provider) in self.providers.iter().enumerate() {
            if i == selected || provider.is_healthy() {
                continue;
            }
            if !provider.is_evaluating_healthiness()
                && provider.has_enough_wait_since_last_health_evaluation()
            {
                provider.evaluate_healthiness().await;
                count += 1;
            }
        }
        tracing::debug!(chain = self.chain_id, count, "evaluated unhealthy providers");
    }
}
