//! Small dense vector/matrix helpers with explicit dimension checks.
//!
//! Thin wrappers over nalgebra that turn a length disagreement into
//! [`MecpError::DimensionMismatch`] instead of a panic, so misconfigured atom
//! counts surface as a terminal error rather than an abort.

use crate::error::{MecpError, Result};
use nalgebra::{DMatrix, DVector};

fn check_len(expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(MecpError::DimensionMismatch { expected, found });
    }
    Ok(())
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &DVector<f64>, b: &DVector<f64>) -> Result<f64> {
    check_len(a.len(), b.len())?;
    Ok(a.dot(b))
}

/// Euclidean norm.
pub fn norm(a: &DVector<f64>) -> f64 {
    a.norm()
}

/// Outer product `a ⊗ b` as an `a.len() × b.len()` matrix.
pub fn outer(a: &DVector<f64>, b: &DVector<f64>) -> DMatrix<f64> {
    a * b.transpose()
}

/// Product of a square (symmetric) matrix with a vector.
pub fn sym_mat_vec(m: &DMatrix<f64>, v: &DVector<f64>) -> Result<DVector<f64>> {
    check_len(m.nrows(), m.ncols())?;
    check_len(m.ncols(), v.len())?;
    Ok(m * v)
}

/// Root mean square of the elements, `sqrt(mean(x_i^2))`. Zero for an empty vector.
pub fn rms(a: &DVector<f64>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    (a.norm_squared() / a.len() as f64).sqrt()
}

/// Largest absolute element. Zero for an empty vector.
pub fn max_abs(a: &DVector<f64>) -> f64 {
    a.iter().map(|x| x.abs()).fold(0.0, f64::max)
}

/// Elementwise difference `a - b`.
pub fn sub(a: &DVector<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    check_len(a.len(), b.len())?;
    Ok(a - b)
}
