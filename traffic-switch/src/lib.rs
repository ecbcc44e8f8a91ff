//! Progressive-delivery primitives for migrating between two implementations
//! of the same interface.
//!
//! A [`TrafficSwitcher`] either routes a configured percentage of calls to
//! the treatment implementation (switching mode), or serves everything from
//! control while shadow-invoking the treatment on a sampled fraction of
//! calls and logging a structural comparison of the two results (sampling
//! mode). Treatment-side failures never reach the caller.

pub mod fees;
pub mod switcher;

pub use switcher::{Experiment, ExperimentConfig, Sampler, TrafficSwitchError, TrafficSwitcher};
