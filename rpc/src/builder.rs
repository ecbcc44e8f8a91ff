use crate::clock::SharedClock;
use crate::config::{RpcConfig, ValidationError};
use crate::provider::SingleRpcProvider;
use crate::router::{RouterError, RouterSettings, RpcProviderRouter};
use crate::store::{FilesystemHealthStateStore, HealthStateStore, StoreError};
use crate::sync::HealthStateSyncer;
use crate::transport::{HttpRpcTransport, TransportError};
use shared::metrics::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

/// Assemble one provider router per configured chain. Configuration
/// problems like bad weights or a missing store path with sync enabled
/// fail here, never at first call.
pub fn build_routers(
    config: &RpcConfig,
    metrics: Metrics,
    clock: SharedClock,
) -> Result<HashMap<u64, RpcProviderRouter>, BuildError> {
    config.validate()?;

    let store: Option<Arc<dyn HealthStateStore>> =
        match (&config.health_store_path, config.tuning.enable_db_sync) {
            (Some(path), true) => Some(Arc::new(FilesystemHealthStateStore::new(
                path,
                clock.clone(),
            )?)),
            _ => None,
        };

    let mut routers = HashMap::new();
    for chain in &config.chains {
        let mut providers = Vec::new();
        let mut weights = Vec::new();
        for entry in &chain.providers {
            let transport = Arc::new(HttpRpcTransport::new(
                entry.url.clone(),
                Duration::from_millis(config.tuning.call_timeout_ms),
            )?);
            let syncer = store.as_ref().map(|store| {
                HealthStateSyncer::new(
                    format!("{}_{}", chain.chain_id, entry.name),
                    format!("RPC_{}_{}", entry.name, chain.chain_id),
                    config.tuning.db_sync_interval_s,
                    config.tuning.db_ttl_s,
                    store.clone(),
                    metrics.clone(),
                    clock.clone(),
                )
            });
            providers.push(Arc::new(SingleRpcProvider::new(
                entry.name.clone(),
                chain.chain_id,
                transport,
                config.tuning.clone(),
                syncer,
                metrics.clone(),
                clock.clone(),
            )));
            weights.push(entry.weight);
        }

        let settings = RouterSettings {
            latency_evaluation_sample_prob: config.latency_evaluation_sample_prob,
            health_check_sample_prob: config.health_check_sample_prob,
            session_allow_fallback_when_unhealthy: config.session_allow_fallback_when_unhealthy,
        };
        let router = RpcProviderRouter::new(
            chain.chain_id,
            providers,
            Some(weights),
            settings,
            clock.clone(),
        )?;
        tracing::info!(
            chain = chain.chain_id,
            providers = chain.providers.len(),
            "built provider router",
        );
        routers.insert(chain.chain_id, router);
    }

    Ok(routers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn test_build_from_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
health_store_path: {}
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://mainnet.example.com/rpc"
        weight: 1000
      - name: QUICKNODE
        url: "https://backup.example.com/rpc"
"#,
            dir.path().display()
        );
        let config: RpcConfig = serde_yaml::from_str(&yaml).unwrap();

        let routers = build_routers(
            &config,
            Metrics::new_noop(),
            Arc::new(SystemClock),
        )
        .unwrap();

        assert_eq!(routers.len(), 1);
        let router = &routers[&1];
        assert!(router.is_ready());
        assert_eq!(router.current_healthy_names(), vec!["INFURA", "QUICKNODE"]);
    }

    #[test]
    fn test_missing_store_path_fails_at_construction() {
        let config: RpcConfig = serde_yaml::from_str(
            r#"
chains:
  - chain_id: 1
    providers:
      - name: INFURA
        url: "https://mainnet.example.com/rpc"
"#,
        )
        .unwrap();

        let err = build_routers(&config, Metrics::new_noop(), Arc::new(SystemClock)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Validation(ValidationError::MissingStorePath)
        ));
    }
}
