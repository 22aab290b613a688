//! Bijections between the constrained parameter space and the unconstrained
//! space the proposals are drawn in.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::operator::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    None,
    Log,
    Logit,
    FisherZ,
    Negate,
    /// Elementwise log of a block whose elements add up to a fixed sum.
    LogConstrainedSum,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::None => "none",
            Transform::Log => "log",
            Transform::Logit => "logit",
            Transform::FisherZ => "fisherz",
            Transform::Negate => "negate",
            Transform::LogConstrainedSum => "logConstrainedSum",
        }
    }

    pub fn is_multivariate(&self) -> bool {
        matches!(self, Transform::LogConstrainedSum)
    }

    /// Forward transform of a single value.
    ///
    /// For `LogConstrainedSum` this is the elementwise log.
    pub fn transform(&self, value: f64) -> f64 {
        match self {
            Transform::None => value,
            Transform::Log | Transform::LogConstrainedSum => value.ln(),
            Transform::Logit => (value / (1.0 - value)).ln(),
            Transform::FisherZ => 0.5 * ((1.0 + value).ln() - (1.0 - value).ln()),
            Transform::Negate => -value,
        }
    }

    /// Inverse of [`transform`](Self::transform) for a single value.
    ///
    /// For `LogConstrainedSum` this is the elementwise exp without the
    /// rescaling done by [`TransformSegment::inverse`].
    pub fn inverse(&self, value: f64) -> f64 {
        match self {
            Transform::None => value,
            Transform::Log | Transform::LogConstrainedSum => value.exp(),
            Transform::Logit => 1.0 / (1.0 + (-value).exp()),
            Transform::FisherZ => {
                let e2 = (2.0 * value).exp();
                (e2 - 1.0) / (e2 + 1.0)
            }
            Transform::Negate => -value,
        }
    }

    /// Log Jacobian of the transform, evaluated at an untransformed value.
    pub fn log_jacobian(&self, value: f64) -> f64 {
        match self {
            Transform::None | Transform::Negate => 0.0,
            Transform::Log | Transform::LogConstrainedSum => -value.ln(),
            Transform::Logit => -(1.0 - value).ln() - value.ln(),
            Transform::FisherZ => -(1.0 - value).ln() - (1.0 + value).ln(),
        }
    }

    /// Derivative of the inverse transform, evaluated at an untransformed value.
    pub fn gradient(&self, value: f64) -> f64 {
        match self {
            Transform::None => 1.0,
            Transform::Log | Transform::LogConstrainedSum => value,
            Transform::Logit => value * (1.0 - value),
            Transform::FisherZ => 1.0 - value * value,
            Transform::Negate => -1.0,
        }
    }
}

impl FromStr for Transform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Transform::None),
            "log" => Ok(Transform::Log),
            "logit" => Ok(Transform::Logit),
            "fisherz" | "fisherZ" => Ok(Transform::FisherZ),
            "negate" => Ok(Transform::Negate),
            "logConstrainedSum" => Ok(Transform::LogConstrainedSum),
            _ => Err(ConfigError::UnknownTransform(s.to_string())),
        }
    }
}

impl Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A transform applied to `len` consecutive values.
///
/// Univariate segments always have length one. A constrained-sum segment
/// carries the sum its values are rescaled to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformSegment {
    pub transform: Transform,
    pub len: usize,
    pub sum: f64,
}

impl TransformSegment {
    pub fn univariate(transform: Transform) -> Self {
        Self {
            transform,
            len: 1,
            sum: 0.0,
        }
    }

    /// Constrained-sum segment. Without an explicit sum the values are
    /// assumed to add up to their count.
    pub fn constrained_sum(len: usize, sum: Option<f64>) -> Self {
        Self {
            transform: Transform::LogConstrainedSum,
            len,
            sum: sum.unwrap_or(len as f64),
        }
    }

    pub fn transform(&self, values: &[f64], out: &mut [f64]) {
        for (out, &val) in out.iter_mut().zip(values) {
            *out = self.transform.transform(val);
        }
    }

    pub fn inverse(&self, values: &[f64], out: &mut [f64]) {
        for (out, &val) in out.iter_mut().zip(values) {
            *out = self.transform.inverse(val);
        }
        if self.transform.is_multivariate() {
            let total: f64 = out.iter().sum();
            let scale = self.sum / total;
            out.iter_mut().for_each(|val| *val *= scale);
        }
    }

    pub fn log_jacobian(&self, values: &[f64]) -> f64 {
        values
            .iter()
            .map(|&val| self.transform.log_jacobian(val))
            .sum()
    }
}

/// A partition of a parameter vector into contiguous transform segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformList {
    segments: Vec<TransformSegment>,
}

impl TransformList {
    /// `dim` untransformed values.
    pub fn identity(dim: usize) -> Self {
        Self::uniform(Transform::None, dim)
    }

    /// The same univariate transform for all `dim` values.
    pub fn uniform(transform: Transform, dim: usize) -> Self {
        Self {
            segments: vec![TransformSegment::univariate(transform); dim],
        }
    }

    /// Build the list from `(transform, len)` blocks.
    ///
    /// A univariate block of length `n` becomes `n` segments of length one; a
    /// constrained-sum block stays a single segment.
    pub fn from_blocks(
        blocks: impl IntoIterator<Item = (Transform, usize)>,
    ) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        for (index, (transform, len)) in blocks.into_iter().enumerate() {
            if len == 0 {
                return Err(ConfigError::EmptySegment { index });
            }
            if transform.is_multivariate() {
                segments.push(TransformSegment::constrained_sum(len, None));
            } else {
                segments.extend(
                    std::iter::repeat(TransformSegment::univariate(transform)).take(len),
                );
            }
        }
        Ok(Self { segments })
    }

    /// Use explicit segments as given.
    pub fn from_segments(segments: Vec<TransformSegment>) -> Result<Self, ConfigError> {
        if let Some(index) = segments.iter().position(|seg| seg.len == 0) {
            return Err(ConfigError::EmptySegment { index });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[TransformSegment] {
        &self.segments
    }

    /// Number of values covered by all segments.
    pub fn dim(&self) -> usize {
        self.segments.iter().map(|seg| seg.len).sum()
    }

    pub fn check_covers(&self, dim: usize) -> Result<(), ConfigError> {
        if let Some(index) = self.segments.iter().position(|seg| seg.len == 0) {
            return Err(ConfigError::EmptySegment { index });
        }
        let covered = self.dim();
        if covered != dim {
            return Err(ConfigError::SegmentCoverage { covered, dim });
        }
        Ok(())
    }

    fn ranges(&self) -> impl Iterator<Item = (&TransformSegment, std::ops::Range<usize>)> {
        self.segments.iter().scan(0usize, |start, seg| {
            let range = *start..*start + seg.len;
            *start += seg.len;
            Some((seg, range))
        })
    }

    pub fn transform(&self, values: &[f64], out: &mut [f64]) {
        for (seg, range) in self.ranges() {
            seg.transform(&values[range.clone()], &mut out[range]);
        }
    }

    pub fn inverse(&self, values: &[f64], out: &mut [f64]) {
        for (seg, range) in self.ranges() {
            seg.inverse(&values[range.clone()], &mut out[range]);
        }
    }

    pub fn log_jacobian(&self, values: &[f64]) -> f64 {
        self.ranges()
            .map(|(seg, range)| seg.log_jacobian(&values[range]))
            .sum()
    }

    /// The transform acting on each individual value.
    pub fn elementwise(&self) -> Vec<Transform> {
        self.segments
            .iter()
            .flat_map(|seg| std::iter::repeat(seg.transform).take(seg.len))
            .collect()
    }

    /// `Σ (log_jacobian(old) - log_jacobian(new))`, the Hastings correction of
    /// a move from `old` to `new` proposed in transformed space.
    pub fn hastings_correction(&self, old: &[f64], new: &[f64]) -> f64 {
        self.ranges()
            .map(|(seg, range)| {
                seg.log_jacobian(&old[range.clone()]) - seg.log_jacobian(&new[range])
            })
            .sum()
    }
}

impl Display for TransformList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}[{}]", seg.transform, seg.len)?;
        }
        Ok(())
    }
}
