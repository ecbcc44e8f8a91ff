use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("no providers configured for chain {0}")]
    NoProviders(u64),

    #[error("duplicate provider name on chain {chain_id}: {name}")]
    DuplicateProvider { chain_id: u64, name: String },

    #[error("invalid weight {weight} for provider {name}: must be -1, 0 or positive")]
    InvalidWeight { name: String, weight: i64 },

    #[error("health sync is enabled but no health_store_path is configured")]
    MissingStorePath,

    #[error("sample probability {0} is outside [0, 1]")]
    InvalidProbability(f64),
}

/// Tuning knobs shared by every provider on every chain.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderTuning {
    /// Score penalty for a failed call.
    pub error_penalty: f64,
    /// Score penalty for a call that succeeded but exceeded the latency cap.
    pub high_latency_penalty: f64,
    /// A healthy provider whose score drops below this becomes unhealthy.
    /// The default never triggers fallback.
    pub health_score_fallback_threshold: f64,
    /// An unhealthy provider whose score rises above this becomes healthy.
    pub health_score_recover_threshold: f64,
    /// Latency above this counts as a degraded success.
    pub max_latency_allowed_ms: u64,
    /// Score credited back per idle millisecond before a clean call.
    pub recover_score_per_ms: f64,
    /// Idle time is only credited up to this cap, so a provider cannot buy
    /// back its score just by sitting unused.
    pub recover_max_wait_to_acknowledge_ms: u64,
    /// Outbound request timeout for provider calls.
    pub call_timeout_ms: u64,
    /// Whether local scores are merged into the shared store.
    pub enable_db_sync: bool,
    /// Minimum seconds between two shared-store syncs from one instance.
    pub db_sync_interval_s: u64,
    /// Lifetime of a shared health record; an expired record reads as absent.
    pub db_ttl_s: u64,
    /// How long an unhealthy provider must wait between recovery probes.
    pub health_evaluation_wait_period_s: u64,
    /// How long a provider must wait between shadow latency evaluations.
    pub latency_evaluation_wait_period_s: u64,
}

impl Default for ProviderTuning {
    fn default() -> Self {
        Self {
            error_penalty: -50.0,
            high_latency_penalty: -20.0,
            health_score_fallback_threshold: f64::MIN,
            health_score_recover_threshold: -200.0,
            max_latency_allowed_ms: 4_000,
            recover_score_per_ms: 0.01,
            recover_max_wait_to_acknowledge_ms: 60_000,
            call_timeout_ms: 5_000,
            enable_db_sync: true,
            db_sync_interval_s: 60,
            db_ttl_s: 30,
            health_evaluation_wait_period_s: 60,
            latency_evaluation_wait_period_s: 60,
        }
    }
}

/// One upstream provider endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderEntry {
    /// Provider name, e.g. "INFURA". Part of the resource key and the
    /// metric prefix.
    pub name: String,
    pub url: Url,
    /// Positive value: selection weight among healthy providers.
    /// 0: never serves traffic but still gets shadow evaluations.
    /// -1: serves only when no positive-weight healthy provider exists.
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    -1
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub providers: Vec<ProviderEntry>,
}

/// Provider-fleet configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub tuning: ProviderTuning,
    /// Directory holding the shared health records. Required when
    /// `tuning.enable_db_sync` is on.
    pub health_store_path: Option<String>,
    /// Probability that a served call triggers shadow latency evaluation of
    /// the other healthy providers.
    #[serde(default = "default_latency_evaluation_sample_prob")]
    pub latency_evaluation_sample_prob: f64,
    /// Probability that a served call triggers recovery probes of unhealthy
    /// providers.
    #[serde(default = "default_health_check_sample_prob")]
    pub health_check_sample_prob: f64,
    /// When a session's pinned provider turns unhealthy, whether the call
    /// may fall back to another provider instead of failing.
    #[serde(default = "default_true")]
    pub session_allow_fallback_when_unhealthy: bool,
    pub chains: Vec<ChainConfig>,
}

fn default_latency_evaluation_sample_prob() -> f64 {
    0.01
}

fn default_health_check_sample_prob() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl RpcConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for prob in [
            self.latency_evaluation_sample_prob,
            self.health_check_sample_prob,
        ] {
            if !(0.0..=1.0).contains(&prob) {
                return Err(ValidationError::InvalidProbability(prob));
            }
        }

        if self.tuning.enable_db_sync && self.health_store_path.is_none() {
            return Err(ValidationError::MissingStorePath);
        }

        for chain in &self.chains {
            if chain.providers.is_empty() {
                return Err(ValidationError::NoProviders(chain.chain_id));
            }

            let mut names = HashSet::new();
            for provider in &chain.providers {
                if !names.insert(&provider.name) {
                    return Err(ValidationError::DuplicateProvider {
                        chain_id: chain.chain_id,
                        name: provider.name.clone(),
                    });
                }
                if provider.weight < -1 {
                    return Err(ValidationError::InvalidWeight {
                        name: provider.name.clone(),
                        weight: provider.weight,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> RpcConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const VALID_YAML: &str = r#"
health_store_path: /var/lib/quoter/health
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://mainnet.example.com/rpc"
        weight: 1000
      - name: QUICKNODE
        url: "https://backup.example.com/rpc"
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = parse(VALID_YAML);
        assert!(config.validate().is_ok());

        assert_eq!(config.chains.len(), 1);
        let chain = &config.chains[0];
        assert_eq!(chain.chain_id, 1);
        assert_eq!(chain.providers[0].weight, 1000);
        // Weight defaults to fallback-only.
        assert_eq!(chain.providers[1].weight, -1);
        // Tuning falls back to defaults when not spelled out.
        assert_eq!(config.tuning.error_penalty, -50.0);
        assert_eq!(config.tuning.db_ttl_s, 30);
    }

    #[test]
    fn test_sync_enabled_requires_store_path() {
        let config = parse(
            r#"
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://mainnet.example.com/rpc"
"#,
        );
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::MissingStorePath
        ));
    }

    #[test]
    fn test_sync_disabled_allows_missing_store_path() {
        let config = parse(
            r#"
tuning:
  enable_db_sync: false
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://mainnet.example.com/rpc"
"#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let config = parse(
            r#"
health_store_path: /tmp/health
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://a.example.com"
      - name: INFURA
        url: "https://b.example.com"
"#,
        );
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::DuplicateProvider { chain_id: 1, .. }
        ));
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let config = parse(
            r#"
health_store_path: /tmp/health
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://a.example.com"
        weight: -2
"#,
        );
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidWeight { weight: -2, .. }
        ));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let config = parse(
            r#"
health_store_path: /tmp/health
chains:
  - chain_id: 10
    providers: []
"#,
        );
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::NoProviders(10)
        ));
    }

    #[test]
    fn test_invalid_url_fails_deserialization() {
        assert!(
            serde_yaml::from_str::<RpcConfig>(
                r#"
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "not-a-url"
"#
            )
            .is_err()
        );
    }
}
