use std::fmt::Display;

use faer::Mat;
use log::{debug, trace};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    adaptive_mvn::{form_base, validate_scalars, BaseMatrix},
    covariance::{OnlineCovariance, Recursion},
    linalg,
    operator::{
        AcceptanceStats, Adaptable, AdaptationMode, ConfigError, Operator, OperatorError, Result,
    },
    parameter::{CompoundParameter, ParameterSet},
};

const OPERATOR_NAME: &str = "adaptiveMetropolis";

/// Optimal scaling of a random walk proposal for a gaussian target, squared.
const SCALING: f64 = 2.38 * 2.38;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmSettings {
    pub scale_factor: f64,
    pub beta: f64,
    pub skip_rank_check: bool,
    pub mode: AdaptationMode,
    pub weight: f64,
}

impl Default for AmSettings {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            beta: 0.05,
            skip_rank_check: false,
            mode: AdaptationMode::Default,
            weight: 1.0,
        }
    }
}

/// Adaptive Metropolis (Haario et al.) on untransformed values.
///
/// The first `2 * dim` proposals use the base matrix. After that the
/// proposal matrix is `(1 - beta) * 2.38^2 / dim * empirical + beta * base`.
/// Steps are `scale_factor * L^T * z` for the Cholesky factor `L` of the
/// matrix in use.
#[derive(Debug)]
pub struct AdaptiveMetropolisOperator {
    parameter: CompoundParameter,
    settings: AmSettings,
    iterations: u64,
    estimator: OnlineCovariance,
    base: Mat<f64>,
    base_cholesky: Mat<f64>,
    proposal: Mat<f64>,
    cholesky: Mat<f64>,
    adapted: bool,
    current: Vec<f64>,
    epsilon: Vec<f64>,
    stats: AcceptanceStats,
}

impl AdaptiveMetropolisOperator {
    pub fn new(
        parameter: CompoundParameter,
        base: BaseMatrix,
        settings: AmSettings,
    ) -> std::result::Result<Self, OperatorError> {
        let dim = parameter.dimension();
        let wrap = |source: ConfigError| OperatorError::Configuration {
            operator: OPERATOR_NAME,
            parameter: parameter.name().to_string(),
            dim,
            source,
        };
        if dim == 0 {
            return Err(wrap(ConfigError::EmptyParameter));
        }
        validate_scalars(settings.scale_factor, settings.beta, settings.weight).map_err(wrap)?;
        let base = form_base(&base, dim, settings.skip_rank_check).map_err(wrap)?;
        let base_cholesky = linalg::cholesky(base.as_ref()).map_err(|err| wrap(err.into()))?;

        debug!("created {} on {} (dim {})", OPERATOR_NAME, parameter.name(), dim);

        Ok(Self {
            settings,
            iterations: 0,
            estimator: OnlineCovariance::new(dim, Recursion::Classical),
            proposal: base.clone(),
            cholesky: base_cholesky.clone(),
            adapted: false,
            base,
            base_cholesky,
            current: vec![0f64; dim],
            epsilon: vec![0f64; dim],
            stats: AcceptanceStats::default(),
            parameter,
        })
    }

    pub fn dim(&self) -> usize {
        self.parameter.dimension()
    }

    /// Number of calls that still use the base matrix.
    pub fn cutoff(&self) -> u64 {
        2 * self.dim() as u64
    }

    fn refresh(&mut self) -> Result<()> {
        let dim = self.dim();
        let beta = self.settings.beta;
        let factor = (1.0 - beta) * SCALING / dim as f64;
        let empirical = self.estimator.covariance();
        for i in 0..dim {
            for j in i..dim {
                let value = factor * empirical[(i, j)] + beta * self.base[(i, j)];
                self.proposal[(i, j)] = value;
                self.proposal[(j, i)] = value;
            }
        }
        match linalg::cholesky(self.proposal.as_ref()) {
            Ok(lower) => {
                self.cholesky = lower;
                Ok(())
            }
            Err(source) => Err(OperatorError::Numerical {
                operator: OPERATOR_NAME,
                parameter: self.parameter.name().to_string(),
                dim,
                source,
            }),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn scale_factor(&self) -> f64 {
        self.settings.scale_factor
    }

    pub fn base(&self) -> &Mat<f64> {
        &self.base
    }

    pub fn proposal(&self) -> &Mat<f64> {
        &self.proposal
    }

    /// The factor used by the most recent proposal.
    pub fn cholesky(&self) -> &Mat<f64> {
        if self.adapted {
            &self.cholesky
        } else {
            &self.base_cholesky
        }
    }

    pub fn mean(&self) -> &[f64] {
        self.estimator.mean()
    }

    pub fn covariance(&self) -> &Mat<f64> {
        self.estimator.covariance()
    }
}

impl Operator for AdaptiveMetropolisOperator {
    fn name(&self) -> String {
        self.to_string()
    }

    fn weight(&self) -> f64 {
        self.settings.weight
    }

    fn operate(&mut self, state: &mut ParameterSet, rng: &mut dyn RngCore) -> Result<f64> {
        self.iterations += 1;
        trace!("{} iteration {}", OPERATOR_NAME, self.iterations);
        self.parameter.read_into(state, &mut self.current);

        if self.iterations == 1 {
            self.estimator.seed_first(&self.current);
        } else {
            self.estimator.observe(&self.current);
            self.estimator.swap_means();
        }

        self.adapted = self.iterations > self.cutoff();
        if self.adapted {
            self.refresh()?;
        }

        let scale = self.settings.scale_factor;
        for eps in self.epsilon.iter_mut() {
            let z: f64 = rng.sample(StandardNormal);
            *eps = scale * z;
        }
        let factor = if self.adapted {
            &self.cholesky
        } else {
            &self.base_cholesky
        };
        let dim = self.current.len();
        for i in 0..dim {
            let shift: f64 = (i..dim).map(|j| factor[(j, i)] * self.epsilon[j]).sum();
            self.current[i] += shift;
        }
        self.parameter.write(state, &self.current);
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

impl Adaptable for AdaptiveMetropolisOperator {
    fn tuning_parameter(&self) -> f64 {
        self.settings.scale_factor.ln()
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.settings.scale_factor = value.exp();
    }

    fn raw_parameter(&self) -> f64 {
        self.settings.scale_factor
    }

    fn mode(&self) -> AdaptationMode {
        self.settings.mode
    }
}

impl Display for AdaptiveMetropolisOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", OPERATOR_NAME, self.parameter.name())
    }
}
