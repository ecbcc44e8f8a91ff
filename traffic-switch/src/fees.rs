//! Fee-fetcher migration: the first consumer of the traffic switcher.
//!
//! The quoter is moving token fee lookups from the on-chain fetcher to a
//! GraphQL-backed one. Both sit behind [`FeeFetcher`]; the switched wrapper
//! rolls the new one out per the experiment configuration and diffs the two
//! fee maps on sampled calls.

use crate::switcher::TrafficSwitcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type Address = String;

/// Buy/sell fee for one token, in basis points. Absent and zero both mean
/// "no fee" when comparing implementations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFee {
    pub buy_fee_bps: Option<u64>,
    pub sell_fee_bps: Option<u64>,
}

impl TokenFee {
    pub fn new(buy_fee_bps: Option<u64>, sell_fee_bps: Option<u64>) -> Self {
        Self {
            buy_fee_bps,
            sell_fee_bps,
        }
    }

    fn is_no_fee(&self) -> bool {
        matches!(self.buy_fee_bps, None | Some(0)) && matches!(self.sell_fee_bps, None | Some(0))
    }
}

pub type FeeMap = HashMap<Address, TokenFee>;

#[derive(Error, Debug)]
pub enum FeeFetchError {
    #[error("fee fetch failed: {0}")]
    Upstream(String),
}

/// Source of token fee data. Implemented by the on-chain fetcher and the
/// GraphQL-backed fetcher that is replacing it.
#[async_trait]
pub trait FeeFetcher: Send + Sync {
    async fn fetch_fees(&self, addresses: &[Address]) -> Result<FeeMap, FeeFetchError>;
}

const METHOD_FETCH_FEES: &str = "fetch_fees";

/// A [`FeeFetcher`] that delegates through a traffic switcher.
pub struct TrafficSwitchedFeeFetcher {
    switcher: TrafficSwitcher<Arc<dyn FeeFetcher>>,
}

impl TrafficSwitchedFeeFetcher {
    pub fn new(switcher: TrafficSwitcher<Arc<dyn FeeFetcher>>) -> Self {
        Self { switcher }
    }
}

#[async_trait]
impl FeeFetcher for TrafficSwitchedFeeFetcher {
    async fn fetch_fees(&self, addresses: &[Address]) -> Result<FeeMap, FeeFetchError> {
        self.switcher
            .invoke(
                METHOD_FETCH_FEES,
                || self.switcher.control().fetch_fees(addresses),
                || self.switcher.treatment().fetch_fees(addresses),
                FeeMap::new(),
                Some(&|control, treatment| {
                    compare_fee_maps(&self.switcher, METHOD_FETCH_FEES, control, treatment)
                }),
            )
            .await
    }
}

/// Diff two fee maps and emit comparison facts as metrics: `IDENTICAL`
/// yes/no, then on mismatch `LENGTHS_MATCH`, a `MISSING_IN_<alias>__<key>`
/// fact per one-sided key and a `DIFFERENT_FOR_<key>` fact per common key
/// with differing fees. Both sides are normalized first so a zero fee and a
/// missing entry compare equal.
pub fn compare_fee_maps<T>(
    switcher: &TrafficSwitcher<T>,
    method: &str,
    control: Option<&FeeMap>,
    treatment: Option<&FeeMap>,
) {
    let experiment = switcher.experiment();

    let (control, treatment) = match (control, treatment) {
        (None, None) => {
            switcher.log_comparison_result(method, "IDENTICAL", true);
            return;
        }
        (None, Some(_)) => {
            let fact = format!("{}_IS_UNDEFINED", experiment.alias_control);
            switcher.log_comparison_result(method, &fact, true);
            return;
        }
        (Some(_), None) => {
            let fact = format!("{}_IS_UNDEFINED", experiment.alias_treatment);
            switcher.log_comparison_result(method, &fact, true);
            return;
        }
        (Some(control), Some(treatment)) => (normalize(control), normalize(treatment)),
    };

    let identical = control == treatment;
    switcher.log_comparison_result(method, "IDENTICAL", identical);
    if identical {
        return;
    }

    switcher.log_comparison_result(method, "LENGTHS_MATCH", control.len() == treatment.len());

    for key in treatment.keys().filter(|k| !control.contains_key(*k)) {
        switcher.log_metric(
            method,
            &format!("MISSING_IN_{}__{}", experiment.alias_control, key),
        );
    }
    for key in control.keys().filter(|k| !treatment.contains_key(*k)) {
        switcher.log_metric(
            method,
            &format!("MISSING_IN_{}__{}", experiment.alias_treatment, key),
        );
    }

    for (key, fee) in &control {
        if let Some(other) = treatment.get(key)
            && fee != other
        {
            switcher.log_metric(method, &format!("DIFFERENT_FOR_{key}"));
            tracing::warn!(
                address = %key,
                control = ?fee,
                treatment = ?other,
                "fee mismatch between implementations",
            );
        }
    }
}

/// Drop entries that are semantically "no fee".
fn normalize(fees: &FeeMap) -> FeeMap {
    fees.iter()
        .filter(|(_, fee)| !fee.is_no_fee())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
