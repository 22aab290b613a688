//! Dense matrix helpers used by the adaptive operators.
//!
//! All matrices are `faer::Mat<f64>`. Decompositions go through faer; the
//! helpers map its errors into [`MatrixError`].

use faer::{
    linalg::solvers::{DenseSolveCore, Llt, LltError},
    Mat, MatRef, Side,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error("matrix is not square ({rows} x {cols})")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix is not positive definite (pivot at index {index})")]
    NotPositiveDefinite { index: usize },
    #[error("expected a {expected} x {expected} matrix, found {rows} x {cols}")]
    DimensionMismatch {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("singular value decomposition failed")]
    Decomposition,
}

fn check_square(matrix: MatRef<'_, f64>) -> Result<usize, MatrixError> {
    let (rows, cols) = matrix.shape();
    if rows != cols {
        return Err(MatrixError::NotSquare { rows, cols });
    }
    Ok(rows)
}

/// Check that `matrix` is `dim x dim`.
pub fn check_dimension(matrix: MatRef<'_, f64>, dim: usize) -> Result<(), MatrixError> {
    let (rows, cols) = matrix.shape();
    if rows != dim || cols != dim {
        return Err(MatrixError::DimensionMismatch {
            expected: dim,
            rows,
            cols,
        });
    }
    Ok(())
}

/// Lower triangular Cholesky factor `L` with `L * L^T = matrix`.
///
/// Only the lower triangle of `matrix` is read. A pivot that is not strictly
/// positive (or not finite) means the matrix is not positive definite and
/// the decomposition fails.
pub fn cholesky(matrix: MatRef<'_, f64>) -> Result<Mat<f64>, MatrixError> {
    Ok(llt(matrix)?.L().to_owned())
}

fn llt(matrix: MatRef<'_, f64>) -> Result<Llt<f64>, MatrixError> {
    check_square(matrix)?;
    matrix.llt(Side::Lower).map_err(|err| match err {
        LltError::NonPositivePivot { index } => MatrixError::NotPositiveDefinite { index },
    })
}

/// Inverse of a symmetric positive definite matrix, from its Cholesky
/// factor. The result is exactly symmetric.
pub fn symmetric_inverse(matrix: MatRef<'_, f64>) -> Result<Mat<f64>, MatrixError> {
    Ok(llt(matrix)?.inverse())
}

/// Numerical rank from the singular values of `matrix`.
///
/// Singular values below `max(rows, cols) * s_max * eps` count as zero.
pub fn rank(matrix: MatRef<'_, f64>) -> Result<usize, MatrixError> {
    let (rows, cols) = matrix.shape();
    if rows == 0 || cols == 0 {
        return Ok(0);
    }
    let svd = matrix.thin_svd().map_err(|_| MatrixError::Decomposition)?;
    let singular = svd.S().column_vector();
    let largest = singular.iter().fold(0f64, |acc, &val| acc.max(val.abs()));
    let tolerance = (rows.max(cols) as f64) * largest * f64::EPSILON;
    Ok(singular.iter().filter(|&&val| val.abs() > tolerance).count())
}

/// `(X^T X)^-1` for an `N x P` design matrix.
pub fn form_xtx_inverse(design: MatRef<'_, f64>) -> Result<Mat<f64>, MatrixError> {
    let (nobs, npar) = design.shape();
    let mut xtx = Mat::<f64>::zeros(npar, npar);
    for i in 0..npar {
        for j in i..npar {
            let total: f64 = (0..nobs).map(|k| design[(k, i)] * design[(k, j)]).sum();
            xtx[(i, j)] = total;
            xtx[(j, i)] = total;
        }
    }
    symmetric_inverse(xtx.as_ref())
}

pub fn is_symmetric(matrix: MatRef<'_, f64>) -> bool {
    let (rows, cols) = matrix.shape();
    rows == cols && (0..rows).all(|i| (0..i).all(|j| matrix[(i, j)] == matrix[(j, i)]))
}

pub fn frobenius_norm_sq(matrix: MatRef<'_, f64>) -> f64 {
    let (rows, cols) = matrix.shape();
    (0..rows)
        .flat_map(|i| (0..cols).map(move |j| (i, j)))
        .map(|(i, j)| matrix[(i, j)] * matrix[(i, j)])
        .sum()
}

/// `diag(value)` of size `dim`.
pub fn scaled_identity(dim: usize, value: f64) -> Mat<f64> {
    Mat::from_fn(dim, dim, |i, j| if i == j { value } else { 0.0 })
}
