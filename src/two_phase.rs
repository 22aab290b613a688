//! Hand-off from generic phase-one operators to adaptive multivariate normal
//! operators.
//!
//! During phase one the wrapper records the tracked parameters before every
//! call. On the first phase-two call every phase-two operator is seeded with
//! the recorded samples of the values it acts on, so its empirical covariance
//! is usable immediately.

use std::fmt::Display;

use itertools::Itertools;
use log::{debug, info};
use rand::{distr::weighted::WeightedIndex, Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    adaptive_mvn::AdaptiveMvnOperator,
    operator::{AcceptanceStats, Adaptable, ConfigError, Operator, OperatorError, Result},
    parameter::{ParameterId, ParameterSet},
};

const OPERATOR_NAME: &str = "twoPhaseOperator";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoPhaseSettings {
    /// Number of calls delegated to phase-one operators.
    pub initial: u64,
    /// Seed the phase-two operators from the phase-one history.
    pub seed_from_samples: bool,
    pub weight: f64,
}

impl Default for TwoPhaseSettings {
    fn default() -> Self {
        Self {
            initial: 1000,
            seed_from_samples: true,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selected {
    One(usize),
    Two(usize),
}

pub struct TwoPhaseOperator {
    phase_one: Vec<Box<dyn Operator>>,
    phase_two: Vec<AdaptiveMvnOperator>,
    phase_one_index: WeightedIndex<f64>,
    phase_two_index: WeightedIndex<f64>,
    tracked: Vec<ParameterId>,
    tracked_names: String,
    /// `history[k][s]` is the `s`-th snapshot of `tracked[k]`.
    history: Vec<Vec<Vec<f64>>>,
    settings: TwoPhaseSettings,
    calls: u64,
    phase: Phase,
    last: Option<Selected>,
    stats: AcceptanceStats,
}

fn selection_index(weights: Vec<f64>) -> std::result::Result<WeightedIndex<f64>, ConfigError> {
    if let Some(&bad) = weights.iter().find(|w| !(**w > 0.0) || !w.is_finite()) {
        return Err(ConfigError::InvalidWeight(bad));
    }
    WeightedIndex::new(weights).map_err(|_| ConfigError::InvalidWeight(f64::NAN))
}

impl TwoPhaseOperator {
    pub fn new(
        state: &ParameterSet,
        phase_one: Vec<Box<dyn Operator>>,
        phase_two: Vec<AdaptiveMvnOperator>,
        tracked: Vec<ParameterId>,
        settings: TwoPhaseSettings,
    ) -> std::result::Result<Self, OperatorError> {
        let tracked_names = tracked.iter().map(|&id| state.name(id)).join("+");
        let dim = tracked.iter().map(|&id| state.dimension(id)).sum();
        let wrap = |source: ConfigError| OperatorError::Configuration {
            operator: OPERATOR_NAME,
            parameter: tracked_names.clone(),
            dim,
            source,
        };

        if phase_one.is_empty() {
            return Err(wrap(ConfigError::NoOperators("phase one")));
        }
        if phase_two.is_empty() {
            return Err(wrap(ConfigError::NoOperators("phase two")));
        }
        if !(settings.weight > 0.0) || !settings.weight.is_finite() {
            return Err(wrap(ConfigError::InvalidWeight(settings.weight)));
        }
        let phase_one_index =
            selection_index(phase_one.iter().map(|op| op.weight()).collect()).map_err(wrap)?;
        let phase_two_index =
            selection_index(phase_two.iter().map(|op| op.weight()).collect()).map_err(wrap)?;

        if settings.seed_from_samples {
            for op in phase_two.iter() {
                let untracked = op
                    .parameter()
                    .parameters()
                    .into_iter()
                    .find(|id| !tracked.contains(id));
                if let Some(id) = untracked {
                    return Err(wrap(ConfigError::UntrackedParameter(
                        state.name(id).to_string(),
                    )));
                }
            }
        }

        debug!(
            "created {} with {} phase one and {} phase two operators",
            OPERATOR_NAME,
            phase_one.len(),
            phase_two.len()
        );

        Ok(Self {
            history: vec![Vec::new(); tracked.len()],
            phase_one,
            phase_two,
            phase_one_index,
            phase_two_index,
            tracked,
            tracked_names,
            settings,
            calls: 0,
            phase: Phase::One,
            last: None,
            stats: AcceptanceStats::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn phase_one_operators(&self) -> &[Box<dyn Operator>] {
        &self.phase_one
    }

    pub fn phase_two_operators(&self) -> &[AdaptiveMvnOperator] {
        &self.phase_two
    }

    fn record(&mut self, state: &ParameterSet) {
        for (hist, &id) in self.history.iter_mut().zip(self.tracked.iter()) {
            hist.push(state.values(id).to_vec());
        }
    }

    fn switch_phase(&mut self) -> Result<()> {
        self.phase = Phase::Two;
        info!(
            "{} on {} switching to phase two after {} calls",
            OPERATOR_NAME, self.tracked_names, self.settings.initial
        );
        if !self.settings.seed_from_samples {
            return Ok(());
        }

        for op in self.phase_two.iter_mut() {
            let samples = op
                .parameter()
                .slots()
                .iter()
                .map(|&(id, index)| {
                    // checked at construction
                    let pos = self
                        .tracked
                        .iter()
                        .position(|&tracked| tracked == id)
                        .unwrap_or_default();
                    self.history[pos]
                        .iter()
                        .map(|snapshot| snapshot[index])
                        .collect::<Vec<f64>>()
                })
                .collect_vec();
            op.seed_from_samples(&samples)?;
        }
        self.history = vec![Vec::new(); self.tracked.len()];
        Ok(())
    }

    fn selected(&self) -> Option<&dyn Operator> {
        match self.last? {
            Selected::One(idx) => Some(&*self.phase_one[idx] as &dyn Operator),
            Selected::Two(idx) => Some(&self.phase_two[idx] as &dyn Operator),
        }
    }

    fn selected_mut(&mut self) -> Option<&mut dyn Operator> {
        match self.last? {
            Selected::One(idx) => Some(&mut *self.phase_one[idx] as &mut dyn Operator),
            Selected::Two(idx) => Some(&mut self.phase_two[idx] as &mut dyn Operator),
        }
    }
}

impl Operator for TwoPhaseOperator {
    fn name(&self) -> String {
        self.to_string()
    }

    fn weight(&self) -> f64 {
        self.settings.weight
    }

    fn operate(&mut self, state: &mut ParameterSet, rng: &mut dyn RngCore) -> Result<f64> {
        self.calls += 1;

        if self.calls <= self.settings.initial {
            if self.settings.seed_from_samples {
                self.record(state);
            }
            let idx = rng.sample(&self.phase_one_index);
            self.last = Some(Selected::One(idx));
            let op = &mut self.phase_one[idx];
            return op
                .operate(state, rng)
                .map_err(|err| OperatorError::Delegate {
                    operator: op.name(),
                    source: err.into(),
                });
        }

        if self.calls == self.settings.initial + 1 {
            self.switch_phase()?;
        }
        let idx = rng.sample(&self.phase_two_index);
        self.last = Some(Selected::Two(idx));
        self.phase_two[idx].operate(state, rng)
    }

    fn record_outcome(&mut self, accepted: bool) {
        self.stats.record(accepted);
        if let Some(op) = self.selected_mut() {
            op.record_outcome(accepted);
        }
    }

    fn acceptance(&self) -> AcceptanceStats {
        self.stats
    }

    fn adaptable(&self) -> Option<&dyn Adaptable> {
        self.selected()?.adaptable()
    }

    fn adaptable_mut(&mut self) -> Option<&mut dyn Adaptable> {
        self.selected_mut()?.adaptable_mut()
    }
}

impl Display for TwoPhaseOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", OPERATOR_NAME, self.tracked_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adaptive_mvn::{AvmvnSettings, BaseMatrix},
        parameter::CompoundParameter,
        random_walk::{RandomWalkOperator, RandomWalkSettings},
        transform::TransformList,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Writes a fixed sequence of values, one per call.
    struct Scripted {
        id: ParameterId,
        values: Vec<Vec<f64>>,
        calls: usize,
        stats: AcceptanceStats,
    }

    impl Operator for Scripted {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn weight(&self) -> f64 {
            1.0
        }

        fn operate(&mut self, state: &mut ParameterSet, _rng: &mut dyn RngCore) -> Result<f64> {
            let values = self.values.get(self.calls).ok_or_else(|| OperatorError::Delegate {
                operator: self.name(),
                source: anyhow::anyhow!("script exhausted"),
            })?;
            for (index, &val) in values.iter().enumerate() {
                state.set_value(self.id, index, val);
            }
            self.calls += 1;
            Ok(0.0)
        }

        fn record_outcome(&mut self, accepted: bool) {
            self.stats.record(accepted);
        }

        fn acceptance(&self) -> AcceptanceStats {
            self.stats
        }
    }

    fn avmvn(
        set: &ParameterSet,
        id: ParameterId,
        settings: AvmvnSettings,
    ) -> AdaptiveMvnOperator {
        let compound = CompoundParameter::from_parameters(set, &[id]);
        let dim = compound.dimension();
        AdaptiveMvnOperator::new(
            compound,
            TransformList::identity(dim),
            BaseMatrix::Coefficient(1.0),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_lists() {
        let mut set = ParameterSet::new();
        let x = set.add("x", vec![0.0, 0.0]);
        let y = set.add("y", vec![0.0, 0.0]);

        let err = TwoPhaseOperator::new(
            &set,
            vec![],
            vec![avmvn(&set, x, Default::default())],
            vec![x],
            Default::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            OperatorError::Configuration {
                source: ConfigError::NoOperators("phase one"),
                ..
            }
        ));

        let walk = RandomWalkOperator::new(&set, x, Default::default()).unwrap();
        let err = TwoPhaseOperator::new(
            &set,
            vec![Box::new(walk)],
            vec![avmvn(&set, y, Default::default())],
            vec![x],
            Default::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            OperatorError::Configuration {
                source: ConfigError::UntrackedParameter(ref name),
                ..
            } if name == "y"
        ));
    }

    #[test]
    fn seeding_reproduces_sample_statistics() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let x = set.add("x", vec![1.0, 1.0]);
        let script = Scripted {
            id: x,
            values: vec![vec![2.0, 3.0], vec![4.0, 2.0], vec![1.0, 6.0], vec![0.0, 0.0]],
            calls: 0,
            stats: AcceptanceStats::default(),
        };
        // every = 2 keeps the first phase-two call (iteration 5) from
        // touching the seeded statistics
        let target = avmvn(
            &set,
            x,
            AvmvnSettings {
                every: 2,
                ..Default::default()
            },
        );
        let mut op = TwoPhaseOperator::new(
            &set,
            vec![Box::new(script)],
            vec![target],
            vec![x],
            TwoPhaseSettings {
                initial: 4,
                ..Default::default()
            },
        )?;

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..4 {
            op.operate(&mut set, &mut rng)?;
            assert_eq!(op.phase(), Phase::One);
        }
        op.operate(&mut set, &mut rng)?;
        assert_eq!(op.phase(), Phase::Two);

        // snapshots taken before each phase-one call
        let samples = [[1.0, 1.0], [2.0, 3.0], [4.0, 2.0], [1.0, 6.0]];
        let n = samples.len() as f64;
        let mean = [
            samples.iter().map(|s| s[0]).sum::<f64>() / n,
            samples.iter().map(|s| s[1]).sum::<f64>() / n,
        ];
        let seeded = &op.phase_two_operators()[0];
        assert_eq!(seeded.beta(), 0.0);
        assert_eq!(seeded.updates(), 4);
        assert_eq!(seeded.iterations(), 5);
        for i in 0..2 {
            assert_relative_eq!(seeded.mean()[i], mean[i], epsilon = 1e-12);
            for j in 0..2 {
                let cov =
                    samples.iter().map(|s| s[i] * s[j]).sum::<f64>() / n - mean[i] * mean[j];
                assert_relative_eq!(seeded.covariance()[(i, j)], cov, epsilon = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn forwards_to_last_operator() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let x = set.add("x", vec![0.0, 0.0]);
        let walk = RandomWalkOperator::new(
            &set,
            x,
            RandomWalkSettings {
                window: 0.25,
                ..Default::default()
            },
        )?;
        let target = avmvn(
            &set,
            x,
            AvmvnSettings {
                scale_factor: 0.5,
                ..Default::default()
            },
        );
        let mut op = TwoPhaseOperator::new(
            &set,
            vec![Box::new(walk)],
            vec![target],
            vec![x],
            TwoPhaseSettings {
                initial: 20,
                ..Default::default()
            },
        )?;
        assert!(op.adaptable().is_none());

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        op.operate(&mut set, &mut rng)?;
        op.record_outcome(true);
        assert_eq!(op.adaptable().map(|a| a.raw_parameter()), Some(0.25));
        assert_eq!(op.phase_one_operators()[0].acceptance().accepted, 1);

        for _ in 0..20 {
            op.operate(&mut set, &mut rng)?;
            op.record_outcome(false);
        }
        assert_eq!(op.phase(), Phase::Two);
        assert_eq!(op.adaptable().map(|a| a.raw_parameter()), Some(0.5));
        assert_eq!(op.phase_two_operators()[0].acceptance().rejected, 1);
        assert_eq!(op.acceptance().total(), 21);

        op.adaptable_mut().unwrap().set_tuning_parameter(0.0);
        assert_eq!(op.phase_two_operators()[0].scale_factor(), 1.0);
        Ok(())
    }

    #[test]
    fn selects_by_weight() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let x = set.add("x", vec![0.0]);
        let light = RandomWalkOperator::new(&set, x, Default::default())?;
        let heavy = RandomWalkOperator::new(
            &set,
            x,
            RandomWalkSettings {
                weight: 3.0,
                ..Default::default()
            },
        )?;
        let target = avmvn(&set, x, Default::default());
        let mut op = TwoPhaseOperator::new(
            &set,
            vec![Box::new(light), Box::new(heavy)],
            vec![target],
            vec![x],
            TwoPhaseSettings {
                initial: 4000,
                seed_from_samples: false,
                ..Default::default()
            },
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for _ in 0..4000 {
            op.operate(&mut set, &mut rng)?;
            op.record_outcome(true);
        }
        let heavy_share = op.phase_one_operators()[1].acceptance().accepted as f64 / 4000.0;
        assert_relative_eq!(heavy_share, 0.75, epsilon = 0.03);
        Ok(())
    }

    #[test]
    fn phase_one_failures_are_wrapped() -> anyhow::Result<()> {
        let mut set = ParameterSet::new();
        let x = set.add("x", vec![0.0]);
        let script = Scripted {
            id: x,
            values: vec![],
            calls: 0,
            stats: AcceptanceStats::default(),
        };
        let target = avmvn(&set, x, Default::default());
        let mut op = TwoPhaseOperator::new(
            &set,
            vec![Box::new(script)],
            vec![target],
            vec![x],
            Default::default(),
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = op.operate(&mut set, &mut rng).unwrap_err();
        match &err {
            OperatorError::Delegate { operator, .. } => assert_eq!(operator, "scripted"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.is_recoverable());
        Ok(())
    }
}
