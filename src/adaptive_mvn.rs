use std::fmt::Display;

use faer::Mat;
use itertools::{izip, Itertools};
use log::{debug, info, trace};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    covariance::{OnlineCovariance, Recursion},
    linalg::{self, MatrixError},
    operator::{
        AcceptanceStats, Adaptable, AdaptationMode, ConfigError, Operator, OperatorError, Result,
    },
    parameter::{CompoundParameter, ParameterSet},
    transform::TransformList,
};

const OPERATOR_NAME: &str = "adaptableVarianceMultivariateNormal";

/// Settings for the adaptive variance multivariate normal operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvmvnSettings {
    /// Standard deviation multiplier of the proposal.
    pub scale_factor: f64,
    /// Weight of the fixed base matrix in the adapted proposal.
    pub beta: f64,
    /// Number of calls before the empirical covariance is used. Values at or
    /// below twice the dimension are raised to twice the dimension.
    pub initial: u64,
    /// Number of calls that are not used for the covariance estimate.
    pub burnin: u64,
    /// Accumulate and refresh only on calls that are a multiple of this.
    pub every: u64,
    pub skip_rank_check: bool,
    pub mode: AdaptationMode,
    pub weight: f64,
}

impl Default for AvmvnSettings {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            beta: 0.05,
            initial: 1000,
            burnin: 0,
            every: 1,
            skip_rank_check: false,
            mode: AdaptationMode::Default,
            weight: 1.0,
        }
    }
}

/// The fixed covariance the proposal starts from and falls back to.
#[derive(Debug, Clone)]
pub enum BaseMatrix {
    /// Used as given.
    Variance(Mat<f64>),
    /// An `N x dim` design matrix `X`, the base is `(X^T X)^-1`.
    Design(Mat<f64>),
    /// The base is `diag(c^2 / dim)`.
    Coefficient(f64),
}

pub(crate) fn validate_scalars(
    scale_factor: f64,
    beta: f64,
    weight: f64,
) -> std::result::Result<(), ConfigError> {
    if !(scale_factor > 0.0) || !scale_factor.is_finite() {
        return Err(ConfigError::InvalidScaleFactor(scale_factor));
    }
    if !(0.0..=1.0).contains(&beta) {
        return Err(ConfigError::InvalidBeta(beta));
    }
    if !(weight > 0.0) || !weight.is_finite() {
        return Err(ConfigError::InvalidWeight(weight));
    }
    Ok(())
}

/// Rank check, base formation and dimension check of a base matrix.
pub(crate) fn form_base(
    base: &BaseMatrix,
    dim: usize,
    skip_rank_check: bool,
) -> std::result::Result<Mat<f64>, ConfigError> {
    let supplied = match base {
        BaseMatrix::Variance(matrix) | BaseMatrix::Design(matrix) => matrix.clone(),
        BaseMatrix::Coefficient(coef) => linalg::scaled_identity(dim, coef * coef / dim as f64),
    };
    if !skip_rank_check {
        let rank = linalg::rank(supplied.as_ref())?;
        if rank != supplied.ncols() {
            return Err(ConfigError::RankDeficient {
                rank,
                expected: supplied.ncols(),
            });
        }
    }
    let formed = match base {
        BaseMatrix::Design(_) => linalg::form_xtx_inverse(supplied.as_ref())?,
        _ => supplied,
    };
    linalg::check_dimension(formed.as_ref(), dim)?;
    Ok(formed)
}

/// Adaptive variance multivariate normal operator.
///
/// Proposes `y' = y + scale_factor * L^T * z` in transformed space, where
/// `L * L^T` is a blend of the empirical covariance of past transformed
/// states and a fixed base matrix, and `z` is standard normal. The step
/// covariance is therefore `scale_factor^2 * L^T * L`, which equals the
/// blended matrix only when it is diagonal.
#[derive(Debug)]
pub struct AdaptiveMvnOperator {
    parameter: CompoundParameter,
    transforms: TransformList,
    settings: AvmvnSettings,
    iterations: u64,
    estimator: OnlineCovariance,
    base: Mat<f64>,
    proposal: Mat<f64>,
    cholesky: Mat<f64>,
    current: Vec<f64>,
    transformed: Vec<f64>,
    epsilon: Vec<f64>,
    proposed: Vec<f64>,
    stats: AcceptanceStats,
}

impl AdaptiveMvnOperator {
    pub fn new(
        parameter: CompoundParameter,
        transforms: TransformList,
        base: BaseMatrix,
        settings: AvmvnSettings,
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
        if settings.every == 0 {
            return Err(wrap(ConfigError::InvalidEvery));
        }
        if settings.burnin > settings.initial {
            return Err(wrap(ConfigError::InvalidBurnin {
                burnin: settings.burnin,
                initial: settings.initial,
            }));
        }
        transforms.check_covers(dim).map_err(wrap)?;

        let base = form_base(&base, dim, settings.skip_rank_check).map_err(wrap)?;
        let cholesky = linalg::cholesky(base.as_ref()).map_err(|err| wrap(err.into()))?;

        let mut settings = settings;
        let minimum = 2 * dim as u64;
        if settings.initial <= minimum {
            info!(
                "raising initial of {} on {} from {} to {}",
                OPERATOR_NAME,
                parameter.name(),
                settings.initial,
                minimum
            );
            settings.initial = minimum;
        }

        debug!(
            "created {} on {} (dim {}, transforms {})",
            OPERATOR_NAME,
            parameter.name(),
            dim,
            transforms
        );

        Ok(Self {
            transforms,
            settings,
            iterations: 0,
            estimator: OnlineCovariance::new(dim, Recursion::Shifted),
            proposal: base.clone(),
            base,
            cholesky,
            current: vec![0f64; dim],
            transformed: vec![0f64; dim],
            epsilon: vec![0f64; dim],
            proposed: vec![0f64; dim],
            stats: AcceptanceStats::default(),
            parameter,
        })
    }

    pub fn dim(&self) -> usize {
        self.parameter.dimension()
    }

    fn numerical(&self, source: MatrixError) -> OperatorError {
        OperatorError::Numerical {
            operator: OPERATOR_NAME,
            parameter: self.parameter.name().to_string(),
            dim: self.dim(),
            source,
        }
    }

    /// Update counters and the empirical statistics for the current call.
    fn advance(&mut self) -> Result<()> {
        let iterations = self.iterations;
        let AvmvnSettings { burnin, every, .. } = self.settings;

        if iterations > 1 && iterations > burnin {
            if iterations > burnin + 1 {
                if iterations % every == 0 {
                    self.estimator.observe(&self.transformed);
                }
            } else {
                self.estimator.clear();
            }
        } else if iterations == 1 {
            self.estimator.clear();
            self.proposal = self.base.clone();
        }

        if iterations > self.settings.initial && iterations % every == 0 {
            self.refresh()?;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        let beta = self.settings.beta;
        let dim = self.dim();
        let empirical = self.estimator.covariance();
        for i in 0..dim {
            for j in i..dim {
                let value = (1.0 - beta) * empirical[(i, j)] + beta * self.base[(i, j)];
                self.proposal[(i, j)] = value;
                self.proposal[(j, i)] = value;
            }
        }
        self.cholesky =
            linalg::cholesky(self.proposal.as_ref()).map_err(|err| self.numerical(err))?;
        debug!(
            "{} refreshed proposal at iteration {} after {} updates",
            self,
            self.iterations,
            self.estimator.updates()
        );
        Ok(())
    }

    /// Start the empirical statistics from recorded samples.
    ///
    /// `samples[i]` is the history of the `i`-th untransformed value. Each
    /// value is transformed with the transform of its position; values in a
    /// constrained-sum segment are log transformed. Afterwards the counters
    /// equal the number of samples used and `beta` is zero.
    pub fn seed_from_samples(
        &mut self,
        samples: &[Vec<f64>],
    ) -> std::result::Result<(), OperatorError> {
        let dim = self.dim();
        let wrap = |source: ConfigError| OperatorError::Configuration {
            operator: OPERATOR_NAME,
            parameter: self.parameter.name().to_string(),
            dim,
            source,
        };
        if samples.len() != dim {
            return Err(wrap(ConfigError::SampleDimension {
                expected: dim,
                found: samples.len(),
            }));
        }

        let transformed = izip!(self.transforms.elementwise(), samples)
            .map(|(transform, hist)| {
                hist.iter()
                    .map(|&val| transform.transform(val))
                    .collect::<Vec<f64>>()
            })
            .collect_vec();
        let count = self.estimator.seed_from_samples(&transformed).map_err(wrap)?;

        self.iterations = count;
        self.settings.beta = 0.0;
        info!("{} seeded from {} samples", self, count);
        Ok(())
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn updates(&self) -> u64 {
        self.estimator.updates()
    }

    pub fn scale_factor(&self) -> f64 {
        self.settings.scale_factor
    }

    pub fn beta(&self) -> f64 {
        self.settings.beta
    }

    pub fn initial(&self) -> u64 {
        self.settings.initial
    }

    pub fn settings(&self) -> &AvmvnSettings {
        &self.settings
    }

    pub fn parameter(&self) -> &CompoundParameter {
        &self.parameter
    }

    pub fn transforms(&self) -> &TransformList {
        &self.transforms
    }

    pub fn base(&self) -> &Mat<f64> {
        &self.base
    }

    pub fn proposal(&self) -> &Mat<f64> {
        &self.proposal
    }

    pub fn cholesky(&self) -> &Mat<f64> {
        &self.cholesky
    }

    pub fn mean(&self) -> &[f64] {
        self.estimator.mean()
    }

    pub fn covariance(&self) -> &Mat<f64> {
        self.estimator.covariance()
    }
}

impl Operator for AdaptiveMvnOperator {
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
        self.transforms.transform(&self.current, &mut self.transformed);

        self.advance()?;

        let scale = self.settings.scale_factor;
        for eps in self.epsilon.iter_mut() {
            let z: f64 = rng.sample(StandardNormal);
            *eps = scale * z;
        }

        // the factor is applied transposed, so the step covariance is
        // scale^2 * L^T * L rather than scale^2 * proposal
        let dim = self.dim();
        for i in 0..dim {
            let shift: f64 = (i..dim)
                .map(|j| self.cholesky[(j, i)] * self.epsilon[j])
                .sum();
            self.transformed[i] += shift;
        }

        self.transforms.inverse(&self.transformed, &mut self.proposed);
        let log_hastings = self
            .transforms
            .hastings_correction(&self.current, &self.proposed);
        self.parameter.write(state, &self.proposed);

        if self.iterations % self.settings.every == 0 {
            self.estimator.swap_means();
        }
        Ok(log_hastings)
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

impl Adaptable for AdaptiveMvnOperator {
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

impl Display for AdaptiveMvnOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", OPERATOR_NAME, self.parameter.name())?;
        if f.alternate() {
            writeln!(f)?;
            writeln!(f, "means: {:?}", self.estimator.mean())?;
            writeln!(f, "empirical covariance:")?;
            let cov = self.estimator.covariance();
            for i in 0..cov.nrows() {
                let row = (0..cov.ncols()).map(|j| cov[(i, j)]).join(" ");
                writeln!(f, "  {}", row)?;
            }
        }
        Ok(())
    }
}
