use rpc::config::{RpcConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use traffic_switch::{ExperimentConfig, TrafficSwitchError};

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "quoter".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

/// Rollout percentages for the dependency migrations currently in flight.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Experiments {
    pub fee_fetcher: ExperimentConfig,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub admin_listener: Listener,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub experiments: Experiments,
    pub rpc: RpcConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid rpc configuration: {0}")]
    InvalidRpc(#[from] ValidationError),

    #[error("invalid experiment configuration: {0}")]
    InvalidExperiment(#[from] TrafficSwitchError),
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc.validate()?;
        self.experiments.fee_fetcher.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
admin_listener:
    host: 127.0.0.1
    port: 3001
metrics:
    statsd_host: 127.0.0.1
    statsd_port: 8125
experiments:
    fee_fetcher:
        pct_shadow_sampling: 0.05
rpc:
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
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.admin_listener.port, 3001);
        assert_eq!(config.metrics.unwrap().prefix, "quoter");
        assert_eq!(config.experiments.fee_fetcher.pct_shadow_sampling, 0.05);
        assert_eq!(config.rpc.chains[0].providers.len(), 2);
    }

    #[test]
    fn test_experiment_percentages_are_mutually_exclusive() {
        let yaml = r#"
admin_listener:
    host: 127.0.0.1
    port: 3001
experiments:
    fee_fetcher:
        pct_enabled: 0.5
        pct_shadow_sampling: 0.5
rpc:
    tuning:
        enable_db_sync: false
    chains:
      - chain_id: 1
        providers:
          - name: INFURA
            url: "https://mainnet.example.com/rpc"
"#;
        let tmp = write_tmp_file(yaml);
        assert!(matches!(
            Config::from_file(tmp.path()).unwrap_err(),
            ConfigError::InvalidExperiment(TrafficSwitchError::MutuallyExclusivePercentages)
        ));
    }

    #[test]
    fn test_rpc_validation_is_applied() {
        // db sync defaults to on, so a missing store path must fail.
        let yaml = r#"
admin_listener:
    host: 127.0.0.1
    port: 3001
rpc:
    chains:
      - chain_id: 1
        providers:
          - name: INFURA
            url: "https://mainnet.example.com/rpc"
"#;
        let tmp = write_tmp_file(yaml);
        assert!(matches!(
            Config::from_file(tmp.path()).unwrap_err(),
            ConfigError::InvalidRpc(ValidationError::MissingStorePath)
        ));
    }
}
