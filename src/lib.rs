//! Adaptive multivariate normal proposal operators for Metropolis-Hastings
//! samplers.
//!
//! Operators mutate a shared [`ParameterSet`] in place and return the log
//! Hastings ratio of the move; the caller decides whether to accept it and
//! reports back with [`Operator::record_outcome`].
//!
//! ```
//! use avmvn_rs::{
//!     AdaptiveMvnOperator, AvmvnSettings, BaseMatrix, CompoundParameter, Operator,
//!     ParameterSet, TransformList,
//! };
//! use rand::SeedableRng;
//!
//! let mut state = ParameterSet::new();
//! let theta = state.add("theta", vec![0.0, 0.0]);
//! let compound = CompoundParameter::from_parameters(&state, &[theta]);
//! let mut op = AdaptiveMvnOperator::new(
//!     compound,
//!     TransformList::identity(2),
//!     BaseMatrix::Coefficient(1.0),
//!     AvmvnSettings::default(),
//! )
//! .unwrap();
//!
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
//! let log_hastings = op.operate(&mut state, &mut rng).unwrap();
//! assert_eq!(log_hastings, 0.0);
//! ```

pub(crate) mod adaptive_metropolis;
pub(crate) mod adaptive_mvn;
pub(crate) mod covariance;
pub mod linalg;
pub(crate) mod operator;
pub(crate) mod parameter;
pub(crate) mod random_walk;
pub(crate) mod transform;
pub(crate) mod two_phase;

pub use adaptive_metropolis::{AdaptiveMetropolisOperator, AmSettings};
pub use adaptive_mvn::{AdaptiveMvnOperator, AvmvnSettings, BaseMatrix};
pub use covariance::{OnlineCovariance, Recursion};
pub use linalg::MatrixError;
pub use operator::{
    performance_suggestion, AcceptanceLevels, AcceptanceStats, Adaptable, AdaptationMode,
    ConfigError, Operator, OperatorError, Result, Suggestion,
};
pub use parameter::{BatchUpdate, ChangeEvent, CompoundParameter, ParameterId, ParameterSet};
pub use random_walk::{RandomWalkKind, RandomWalkOperator, RandomWalkSettings};
pub use transform::{Transform, TransformList, TransformSegment};
pub use two_phase::{Phase, TwoPhaseOperator, TwoPhaseSettings};
