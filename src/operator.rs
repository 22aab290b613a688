use std::{fmt::Display, str::FromStr};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{linalg::MatrixError, parameter::ParameterSet};

/// Invalid operator settings or inputs, detected before sampling starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("matrix has rank {rank}, expected full rank {expected}")]
    RankDeficient { rank: usize, expected: usize },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error("scale factor must be positive and finite, got {0}")]
    InvalidScaleFactor(f64),
    #[error("beta must lie in [0, 1], got {0}")]
    InvalidBeta(f64),
    #[error("update frequency must be at least 1")]
    InvalidEvery,
    #[error("burnin ({burnin}) must not exceed initial ({initial})")]
    InvalidBurnin { burnin: u64, initial: u64 },
    #[error("operator weight must be positive and finite, got {0}")]
    InvalidWeight(f64),
    #[error("window size must be positive and finite, got {0}")]
    InvalidWindow(f64),
    #[error("transform segment {index} has zero length")]
    EmptySegment { index: usize },
    #[error("transform segments cover {covered} values, parameter has {dim}")]
    SegmentCoverage { covered: usize, dim: usize },
    #[error("unknown transform {0:?}")]
    UnknownTransform(String),
    #[error("unknown adaptation mode {0:?}")]
    UnknownMode(String),
    #[error("samples have dimension {found}, expected {expected}")]
    SampleDimension { expected: usize, found: usize },
    #[error("no samples to seed from")]
    MissingSamples,
    #[error("the {0} operator list is empty")]
    NoOperators(&'static str),
    #[error("parameter {0} is not tracked")]
    UntrackedParameter(String),
    #[error("parameter has dimension zero")]
    EmptyParameter,
}

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("invalid configuration for {operator} on {parameter} (dimension {dim})")]
    Configuration {
        operator: &'static str,
        parameter: String,
        dim: usize,
        #[source]
        source: ConfigError,
    },
    #[error("numerical failure in {operator} on {parameter} (dimension {dim})")]
    Numerical {
        operator: &'static str,
        parameter: String,
        dim: usize,
        #[source]
        source: MatrixError,
    },
    #[error("operator {operator} failed")]
    Delegate {
        operator: String,
        #[source]
        source: anyhow::Error,
    },
}

impl OperatorError {
    /// Unrecoverable errors stop the chain. None of the current kinds can be
    /// treated as a rejected proposal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            OperatorError::Configuration { .. } => false,
            OperatorError::Numerical { .. } => false,
            OperatorError::Delegate { source, .. } => source
                .downcast_ref::<OperatorError>()
                .is_some_and(|inner| inner.is_recoverable()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;

/// Whether an external controller may tune an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdaptationMode {
    #[default]
    Default,
    On,
    Off,
}

impl FromStr for AdaptationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(AdaptationMode::Default),
            "on" | "true" => Ok(AdaptationMode::On),
            "off" | "false" => Ok(AdaptationMode::Off),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl Display for AdaptationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdaptationMode::Default => write!(f, "default"),
            AdaptationMode::On => write!(f, "on"),
            AdaptationMode::Off => write!(f, "off"),
        }
    }
}

/// Acceptance rates that separate a well tuned operator from a badly tuned one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceLevels {
    pub minimum: f64,
    pub maximum: f64,
    pub good_low: f64,
    pub good_high: f64,
}

impl Default for AcceptanceLevels {
    fn default() -> Self {
        Self {
            minimum: 0.1,
            maximum: 0.4,
            good_low: 0.2,
            good_high: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptanceStats {
    pub accepted: u64,
    pub rejected: u64,
}

impl AcceptanceStats {
    pub fn record(&mut self, accepted: bool) {
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    pub fn rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.accepted as f64 / total as f64),
        }
    }
}

/// A proposal kernel.
///
/// `operate` mutates `state` in place and returns the log Hastings ratio of
/// the move. A return value of `f64::NEG_INFINITY` asks the caller to reject
/// without evaluating the target density.
pub trait Operator: Send {
    fn name(&self) -> String;

    /// Relative selection weight when several operators share a schedule.
    fn weight(&self) -> f64;

    fn operate(&mut self, state: &mut ParameterSet, rng: &mut dyn RngCore) -> Result<f64>;

    /// Report the accept/reject decision for the last proposal.
    fn record_outcome(&mut self, accepted: bool);

    fn acceptance(&self) -> AcceptanceStats;

    fn adaptable(&self) -> Option<&dyn Adaptable> {
        None
    }

    fn adaptable_mut(&mut self) -> Option<&mut dyn Adaptable> {
        None
    }
}

/// An operator with a tuning parameter that an outer controller can adjust.
pub trait Adaptable {
    /// The tuning parameter on the scale the controller works on.
    fn tuning_parameter(&self) -> f64;

    fn set_tuning_parameter(&mut self, value: f64);

    /// The tuning parameter on its natural scale.
    fn raw_parameter(&self) -> f64;

    fn mode(&self) -> AdaptationMode;

    fn target_acceptance_probability(&self) -> f64 {
        0.234
    }

    fn acceptance_levels(&self) -> AcceptanceLevels {
        AcceptanceLevels::default()
    }
}

/// A hint for the raw tuning parameter of a badly tuned operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suggestion {
    pub acceptance_rate: f64,
    pub current: f64,
    pub suggested: f64,
}

impl Display for Suggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.suggested < self.current {
            "decreasing"
        } else {
            "increasing"
        };
        write!(
            f,
            "acceptance rate {:.3}, try {} the tuning parameter to about {:.4}",
            self.acceptance_rate, direction, self.suggested
        )
    }
}

/// Suggest a new raw tuning parameter if the acceptance rate of `op` is
/// outside the good window of its acceptance levels.
pub fn performance_suggestion(op: &dyn Operator) -> Option<Suggestion> {
    let adaptable = op.adaptable()?;
    let rate = op.acceptance().rate()?;
    let levels = adaptable.acceptance_levels();
    if rate >= levels.good_low && rate <= levels.good_high {
        return None;
    }
    let target = adaptable.target_acceptance_probability();
    let ratio = (rate / target).clamp(0.5, 2.0);
    let current = adaptable.raw_parameter();
    Some(Suggestion {
        acceptance_rate: rate,
        current,
        suggested: current * ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixed {
        stats: AcceptanceStats,
        scale: f64,
    }

    impl Adaptable for Fixed {
        fn tuning_parameter(&self) -> f64 {
            self.scale.ln()
        }

        fn set_tuning_parameter(&mut self, value: f64) {
            self.scale = value.exp();
        }

        fn raw_parameter(&self) -> f64 {
            self.scale
        }

        fn mode(&self) -> AdaptationMode {
            AdaptationMode::On
        }
    }

    impl Operator for Fixed {
        fn name(&self) -> String {
            "fixed".to_string()
        }

        fn weight(&self) -> f64 {
            1.0
        }

        fn operate(&mut self, _state: &mut ParameterSet, _rng: &mut dyn RngCore) -> Result<f64> {
            Ok(0.0)
        }

        fn record_outcome(&mut self, accepted: bool) {
            self.stats.record(accepted);
        }

        fn acceptance(&self) -> AcceptanceStats {
            self.stats
        }

        fn adaptable(&self) -> Option<&dyn Adaptable> {
            Some(self)
        }

        fn adaptable_mut(&mut self) -> Option<&mut dyn Adaptable> {
            Some(self)
        }
    }

    fn with_rate(accepted: u64, rejected: u64) -> Fixed {
        Fixed {
            stats: AcceptanceStats { accepted, rejected },
            scale: 2.0,
        }
    }

    #[test]
    fn parse_modes() {
        assert_eq!("default".parse::<AdaptationMode>().unwrap(), AdaptationMode::Default);
        assert_eq!("true".parse::<AdaptationMode>().unwrap(), AdaptationMode::On);
        assert_eq!("Off".parse::<AdaptationMode>().unwrap(), AdaptationMode::Off);
        assert_eq!(
            "sometimes".parse::<AdaptationMode>().unwrap_err(),
            ConfigError::UnknownMode("sometimes".to_string())
        );
    }

    #[test]
    fn no_suggestion_inside_window() {
        assert_eq!(performance_suggestion(&with_rate(1, 3)), None);
        assert_eq!(performance_suggestion(&with_rate(0, 0)), None);
    }

    #[test]
    fn suggestion_is_clamped() {
        // rate 0.05 would give a ratio below 0.5
        let low = performance_suggestion(&with_rate(1, 19)).unwrap();
        assert_eq!(low.suggested, 1.0);
        assert!(low.to_string().contains("decreasing"));

        // rate 1.0 would give a ratio above 2
        let high = performance_suggestion(&with_rate(10, 0)).unwrap();
        assert_eq!(high.suggested, 4.0);

        let mild = performance_suggestion(&with_rate(2, 3)).unwrap();
        approx::assert_relative_eq!(mild.suggested, 2.0 * 0.4 / 0.234);
    }

    #[test]
    fn tuning_round_trips_through_trait() {
        let mut op = with_rate(0, 0);
        op.adaptable_mut().unwrap().set_tuning_parameter(0.5f64.ln());
        approx::assert_relative_eq!(op.adaptable().unwrap().raw_parameter(), 0.5);
        op.record_outcome(true);
        op.record_outcome(false);
        assert_eq!(op.acceptance().rate(), Some(0.5));
    }

    #[test]
    fn fatal_errors_are_not_recoverable() {
        let err = OperatorError::Numerical {
            operator: "test",
            parameter: "x".to_string(),
            dim: 2,
            source: MatrixError::NotSquare { rows: 1, cols: 2 },
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("dimension 2"));

        let wrapped = OperatorError::Delegate {
            operator: "outer".to_string(),
            source: anyhow::anyhow!("logp blew up"),
        };
        assert!(!wrapped.is_recoverable());
    }
}
