use std::fmt::Display;

use log::trace;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    operator::{
        AcceptanceStats, Adaptable, AdaptationMode, ConfigError, Operator, OperatorError, Result,
    },
    parameter::{ParameterId, ParameterSet},
};

const OPERATOR_NAME: &str = "randomWalk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RandomWalkKind {
    /// Step uniformly in `[-window, window]`.
    #[default]
    Uniform,
    /// Step with standard deviation `window`.
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomWalkSettings {
    pub window: f64,
    pub kind: RandomWalkKind,
    pub mode: AdaptationMode,
    pub weight: f64,
}

impl Default for RandomWalkSettings {
    fn default() -> Self {
        Self {
            window: 1.0,
            kind: RandomWalkKind::Uniform,
            mode: AdaptationMode::Default,
            weight: 1.0,
        }
    }
}

/// Moves one randomly chosen element of a parameter.
///
/// Proposals outside the bounds of the element are not written; the
/// operator returns `f64::NEG_INFINITY` so the caller rejects them.
#[derive(Debug)]
pub struct RandomWalkOperator {
    parameter: ParameterId,
    name: String,
    dim: usize,
    settings: RandomWalkSettings,
    stats: AcceptanceStats,
}

impl RandomWalkOperator {
    pub fn new(
        state: &ParameterSet,
        parameter: ParameterId,
        settings: RandomWalkSettings,
    ) -> std::result::Result<Self, OperatorError> {
        let name = state.name(parameter).to_string();
        let dim = state.dimension(parameter);
        let wrap = |source: ConfigError| OperatorError::Configuration {
            operator: OPERATOR_NAME,
            parameter: name.clone(),
            dim,
            source,
        };
        if dim == 0 {
            return Err(wrap(ConfigError::EmptyParameter));
        }
        if !(settings.window > 0.0) || !settings.window.is_finite() {
            return Err(wrap(ConfigError::InvalidWindow(settings.window)));
        }
        if !(settings.weight > 0.0) || !settings.weight.is_finite() {
            return Err(wrap(ConfigError::InvalidWeight(settings.weight)));
        }

        Ok(Self {
            parameter,
            name,
            dim,
            settings,
            stats: AcceptanceStats::default(),
        })
    }

    pub fn parameter(&self) -> ParameterId {
        self.parameter
    }

    pub fn window(&self) -> f64 {
        self.settings.window
    }
}

impl Operator for RandomWalkOperator {
    fn name(&self) -> String {
        self.to_string()
    }

    fn weight(&self) -> f64 {
        self.settings.weight
    }

    fn operate(&mut self, state: &mut ParameterSet, rng: &mut dyn RngCore) -> Result<f64> {
        let index = rng.random_range(0..self.dim);
        let step = match self.settings.kind {
            RandomWalkKind::Uniform => self.settings.window * (2.0 * rng.random::<f64>() - 1.0),
            RandomWalkKind::Gaussian => {
                let z: f64 = rng.sample(StandardNormal);
                self.settings.window * z
            }
        };
        let value = state.value(self.parameter, index) + step;
        if !state.in_bounds(self.parameter, index, value) {
            trace!("{} proposal {} out of bounds", self, value);
            return Ok(f64::NEG_INFINITY);
        }
        state.set_value(self.parameter, index, value);
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

impl Adaptable for RandomWalkOperator {
    fn tuning_parameter(&self) -> f64 {
        self.settings.window.ln()
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.settings.window = value.exp();
    }

    fn raw_parameter(&self) -> f64 {
        self.settings.window
    }

    fn mode(&self) -> AdaptationMode {
        self.settings.mode
    }
}

impl Display for RandomWalkOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", OPERATOR_NAME, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ChangeEvent;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn out_of_bounds_is_rejected_without_writing() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        // a step inside [-5e-10, 5e-10] has probability 5e-11
        let id = set.add_bounded("p", vec![5e-10], 0.0, 1e-9);
        let mut op = RandomWalkOperator::new(
            &set,
            id,
            RandomWalkSettings {
                window: 10.0,
                ..Default::default()
            },
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            let ratio = op.operate(&mut set, &mut rng)?;
            assert_eq!(ratio, f64::NEG_INFINITY);
            assert_eq!(set.values(id), &[5e-10]);
        }
        assert!(set.take_events().is_empty());
        Ok(())
    }

    #[test]
    fn in_bounds_writes_one_element() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let id = set.add("x", vec![0.0, 0.0, 0.0]);
        let mut op = RandomWalkOperator::new(
            &set,
            id,
            RandomWalkSettings {
                window: 0.5,
                kind: RandomWalkKind::Gaussian,
                ..Default::default()
            },
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let ratio = op.operate(&mut set, &mut rng)?;
        assert_eq!(ratio, 0.0);

        let events = set.take_events();
        assert_eq!(events.len(), 1);
        let ChangeEvent::Value { parameter, index } = events[0] else {
            panic!("expected a single element event");
        };
        assert_eq!(parameter, id);
        let moved = set.values(id).iter().filter(|&&val| val != 0.0).count();
        assert_eq!(moved, 1);
        assert!(set.value(id, index) != 0.0);
        Ok(())
    }

    #[test]
    fn uniform_steps_stay_in_window() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let id = set.add("x", vec![1.0]);
        let mut op = RandomWalkOperator::new(&set, id, Default::default())?;
        set.store();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        for _ in 0..500 {
            op.operate(&mut set, &mut rng)?;
            assert!((set.value(id, 0) - 1.0).abs() <= 1.0);
            set.restore();
        }
        Ok(())
    }

    #[test]
    fn rejects_bad_window() {
        let mut set = ParameterSet::new();
        let id = set.add("x", vec![1.0]);
        let err = RandomWalkOperator::new(
            &set,
            id,
            RandomWalkSettings {
                window: 0.0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("randomWalk on x"));
    }

    #[test]
    fn window_is_tuned_on_log_scale() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let id = set.add("x", vec![1.0]);
        let mut op = RandomWalkOperator::new(&set, id, Default::default())?;
        op.set_tuning_parameter(3f64.ln());
        approx::assert_relative_eq!(op.window(), 3.0, epsilon = 1e-12);
        assert_eq!(op.name(), "randomWalk(x)");
        Ok(())
    }
}
