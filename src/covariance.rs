use faer::Mat;
use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::operator::ConfigError;

/// Which covariance recursion an estimator applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recursion {
    /// Unbiased sample covariance (divisor `n - 1`).
    Shifted,
    /// Maximum likelihood covariance (divisor `n`).
    Classical,
}

/// Online estimate of the mean and covariance of a stream of vectors.
///
/// The mean is double buffered. [`observe`](Self::observe) reads the
/// previous mean and writes the new one into the other buffer; the caller
/// decides when to [`swap_means`](Self::swap_means). Only the upper triangle
/// of the covariance is computed, the lower one is a mirror.
#[derive(Debug, Clone)]
pub struct OnlineCovariance {
    recursion: Recursion,
    old_means: Vec<f64>,
    new_means: Vec<f64>,
    empirical: Mat<f64>,
    updates: u64,
}

impl OnlineCovariance {
    pub fn new(dim: usize, recursion: Recursion) -> Self {
        Self {
            recursion,
            old_means: vec![0f64; dim],
            new_means: vec![0f64; dim],
            empirical: Mat::zeros(dim, dim),
            updates: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.old_means.len()
    }

    pub fn recursion(&self) -> Recursion {
        self.recursion
    }

    /// Zero both mean buffers and the covariance. The update count is kept.
    pub fn clear(&mut self) {
        self.old_means.fill(0.0);
        self.new_means.fill(0.0);
        self.empirical = Mat::zeros(self.dim(), self.dim());
    }

    pub fn observe(&mut self, x: &[f64]) {
        assert!(x.len() == self.dim());
        self.updates += 1;
        let n = self.updates as f64;

        for (new, &old, &val) in izip!(self.new_means.iter_mut(), &self.old_means, x) {
            *new = (old * (n - 1.0) + val) / n;
        }

        if self.updates < 2 {
            return;
        }

        let dim = self.dim();
        let old = &self.old_means;
        let new = &self.new_means;
        for i in 0..dim {
            for j in i..dim {
                let current = self.empirical[(i, j)];
                let cross = x[i] * x[j] + (n - 1.0) * old[i] * old[j] - n * new[i] * new[j];
                let value = match self.recursion {
                    Recursion::Shifted => (current * (n - 2.0) + cross) / (n - 1.0),
                    Recursion::Classical => (current * (n - 1.0) + cross) / n,
                };
                self.empirical[(i, j)] = value;
                self.empirical[(j, i)] = value;
            }
        }
    }

    pub fn swap_means(&mut self) {
        std::mem::swap(&mut self.old_means, &mut self.new_means);
    }

    /// Start the recursion at `x` with a count of one.
    pub fn seed_first(&mut self, x: &[f64]) {
        assert!(x.len() == self.dim());
        self.old_means.copy_from_slice(x);
        self.new_means.copy_from_slice(x);
        self.empirical = Mat::zeros(self.dim(), self.dim());
        self.updates = 1;
    }

    /// Set mean and covariance from per-dimension sample histories.
    ///
    /// Only the first `n` samples of each history are used, where `n` is the
    /// length of the shortest one. The covariance uses divisor `n`. Returns
    /// `n`.
    pub fn seed_from_samples(&mut self, samples: &[Vec<f64>]) -> Result<u64, ConfigError> {
        let dim = self.dim();
        if samples.len() != dim {
            return Err(ConfigError::SampleDimension {
                expected: dim,
                found: samples.len(),
            });
        }
        let n = samples.iter().map(|hist| hist.len()).min().unwrap_or(0);
        if n == 0 {
            return Err(ConfigError::MissingSamples);
        }
        let count = n as f64;

        for (mean, hist) in self.old_means.iter_mut().zip(samples) {
            *mean = hist[..n].iter().sum::<f64>() / count;
        }
        self.new_means.copy_from_slice(&self.old_means);

        for i in 0..dim {
            for j in i..dim {
                let product: f64 = samples[i][..n]
                    .iter()
                    .zip(&samples[j][..n])
                    .map(|(a, b)| a * b)
                    .sum();
                let value = product / count - self.old_means[i] * self.old_means[j];
                self.empirical[(i, j)] = value;
                self.empirical[(j, i)] = value;
            }
        }
        self.updates = n as u64;
        Ok(self.updates)
    }

    /// The mean as of the last swap.
    pub fn mean(&self) -> &[f64] {
        &self.old_means
    }

    /// The buffer written by the last [`observe`](Self::observe).
    pub fn pending_mean(&self) -> &[f64] {
        &self.new_means
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.empirical
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}
