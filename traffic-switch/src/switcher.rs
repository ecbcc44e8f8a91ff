use shared::metrics::{MetricUnit, Metrics};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while constructing a switcher. These are configuration
/// mistakes and surface immediately, never at call time.
#[derive(Error, Debug)]
pub enum TrafficSwitchError {
    #[error("percentage {0} is outside [0, 1]")]
    PercentageOutOfRange(f64),

    #[error("pct_enabled and pct_shadow_sampling cannot both be positive")]
    MutuallyExclusivePercentages,
}

/// Names an experiment and the two implementations taking part in it.
/// The strings only namespace metric names; operators keep experiment names
/// globally unique per deployment to avoid metric collisions.
#[derive(Clone, Debug)]
pub struct Experiment {
    pub name: String,
    pub alias_control: String,
    pub alias_treatment: String,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        alias_control: impl Into<String>,
        alias_treatment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            alias_control: alias_control.into(),
            alias_treatment: alias_treatment.into(),
        }
    }
}

/// Rollout percentages for one experiment.
///
/// `pct_enabled` is the probability a call is served by the treatment.
/// `pct_shadow_sampling` is the probability a call additionally invokes the
/// non-serving implementation purely for comparison. At most one of the two
/// may be non-zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub pct_enabled: f64,
    #[serde(default)]
    pub pct_shadow_sampling: f64,
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), TrafficSwitchError> {
        for pct in [self.pct_enabled, self.pct_shadow_sampling] {
            if !(0.0..=1.0).contains(&pct) {
                return Err(TrafficSwitchError::PercentageOutOfRange(pct));
            }
        }
        if self.pct_enabled > 0.0 && self.pct_shadow_sampling > 0.0 {
            return Err(TrafficSwitchError::MutuallyExclusivePercentages);
        }
        Ok(())
    }
}

/// Source of the uniform draws that decide switching and sampling.
/// Injected so tests can pin the decision instead of subclassing anything.
#[derive(Clone)]
pub struct Sampler(Arc<dyn Fn() -> f64 + Send + Sync>);

impl Sampler {
    /// Uniform draw over [0, 1).
    pub fn uniform() -> Self {
        Sampler(Arc::new(rand::random::<f64>))
    }

    /// Always returns the given value. Test use.
    pub fn fixed(value: f64) -> Self {
        Sampler(Arc::new(move || value))
    }

    /// Wrap an arbitrary draw function.
    pub fn from_fn(f: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        Sampler(Arc::new(f))
    }

    pub fn draw(&self) -> f64 {
        (self.0)()
    }
}

/// Operates a control and a treatment implementation of the same interface
/// side by side. In switching mode a draw decides which one serves the
/// call; in sampling mode control always serves and a sampled fraction of
/// calls also runs the treatment for comparison only.
///
/// Concrete wrappers hold a `TrafficSwitcher<T>` and route every switched
/// method through [`TrafficSwitcher::invoke`].
pub struct TrafficSwitcher<T> {
    experiment: Experiment,
    control: T,
    treatment: T,
    config: ExperimentConfig,
    sampler: Sampler,
    metrics: Metrics,
}

impl<T> TrafficSwitcher<T> {
    pub fn new(
        experiment: Experiment,
        control: T,
        treatment: T,
        config: ExperimentConfig,
        metrics: Metrics,
    ) -> Result<Self, TrafficSwitchError> {
        config.validate()?;
        Ok(Self {
            experiment,
            control,
            treatment,
            config,
            sampler: Sampler::uniform(),
            metrics,
        })
    }

    /// Replace the decision source. Test use.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn control(&self) -> &T {
        &self.control
    }

    pub fn treatment(&self) -> &T {
        &self.treatment
    }

    /// Route one logical method call through the experiment.
    ///
    /// Sampling mode: a selected call runs both sides concurrently to
    /// settlement, hands both results (each `None` on failure) to the
    /// comparator, and always returns control's result, falling back to
    /// `default_value` if control itself failed. Unsampled calls invoke
    /// control only and propagate its error.
    ///
    /// Switching mode: exactly one side runs, chosen by the draw, and its
    /// outcome (including failure) is the caller's outcome.
    pub async fn invoke<K, E, CF, TF>(
        &self,
        method: &str,
        control_call: impl FnOnce() -> CF,
        treatment_call: impl FnOnce() -> TF,
        default_value: K,
        comparator: Option<&(dyn Fn(Option<&K>, Option<&K>) + Sync)>,
    ) -> Result<K, E>
    where
        CF: Future<Output = Result<K, E>>,
        TF: Future<Output = Result<K, E>>,
        E: Display,
    {
        if self.sampling_enabled() {
            if self.should_sample() {
                self.log_metric(method, "COMPARISON_SAMPLE");

                // Both sides are polled together; a slow or failing
                // treatment never aborts control.
                let (control_result, treatment_result) =
                    tokio::join!(control_call(), treatment_call());
                let control_value =
                    self.settle(method, &self.experiment.alias_control, control_result);
                let treatment_value =
                    self.settle(method, &self.experiment.alias_treatment, treatment_result);

                if let Some(compare) = comparator {
                    compare(control_value.as_ref(), treatment_value.as_ref());
                }

                return Ok(control_value.unwrap_or(default_value));
            }
            // Not selected for sampling: the treatment is not called at all.
            return control_call().await;
        }

        if self.should_switch() {
            self.log_metric(
                method,
                &format!("SELECTED_IMPL__{}", self.experiment.alias_treatment),
            );
            treatment_call().await
        } else {
            self.log_metric(
                method,
                &format!("SELECTED_IMPL__{}", self.experiment.alias_control),
            );
            control_call().await
        }
    }

    /// Emit one comparison fact: `COMPARISON__{comparison}__RESULT__{YES|NO}`.
    pub fn log_comparison_result(&self, method: &str, comparison: &str, equals: bool) {
        let outcome = if equals { "YES" } else { "NO" };
        self.log_metric(method, &format!("COMPARISON__{comparison}__RESULT__{outcome}"));
    }

    /// Emit a 1-count metric named
    /// `TRAFFIC_SWITCHER__{experiment}__{method}__{metric}`.
    pub fn log_metric(&self, method: &str, metric: &str) {
        self.metrics.put_metric(
            &format!(
                "TRAFFIC_SWITCHER__{}__{}__{}",
                self.experiment.name, method, metric
            ),
            1.0,
            MetricUnit::Count,
        );
    }

    fn sampling_enabled(&self) -> bool {
        self.config.pct_shadow_sampling > 0.0
    }

    fn should_sample(&self) -> bool {
        self.sampler.draw() < self.config.pct_shadow_sampling
    }

    fn should_switch(&self) -> bool {
        self.sampler.draw() < self.config.pct_enabled
    }

    fn settle<K, E: Display>(&self, method: &str, alias: &str, result: Result<K, E>) -> Option<K> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::error!(
                    experiment = %self.experiment.name,
                    method,
                    alias,
                    %error,
                    "non-authoritative side failed",
                );
                self.log_metric(method, &format!("{alias}_EXCEPTION"));
                None
            }
        }
    }
}
