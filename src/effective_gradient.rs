//! Effective gradient for crossing-point searches.
//!
//! Following Harvey et al. (Theor. Chim. Acta 1994), the search direction
//! combines two components built from the state gradients `gA`, `gB`:
//!
//! ```text
//! perp     = gA - gB
//! parallel = gA - (perp / |perp|) * (gA . perp / |perp|)
//! G        = facPP * (EA - EB) * perp + facP * parallel
//! ```
//!
//! The perpendicular part drives the energy gap to zero, the parallel part
//! minimizes state A within the crossing seam. The factors default to
//! `facPP = 140 / Hartree` and `facP = 1`, which makes the curvature along the
//! gap coordinate comparable to the 0.7 Å²/Hartree initial inverse Hessian.

use crate::error::{MecpError, Result};
use crate::geometry::{EnergyPair, GradientPair};
use crate::linalg;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Weighting of the perpendicular and parallel components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientFactors {
    /// Weight of `(EA - EB) * perp`, in 1/Hartree
    pub perpendicular: f64,
    /// Weight of the parallel gradient
    pub parallel: f64,
}

impl Default for GradientFactors {
    fn default() -> Self {
        Self {
            perpendicular: 140.0,
            parallel: 1.0,
        }
    }
}

/// Components of the effective gradient at one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveGradientResult {
    /// Difference gradient `gA - gB`
    pub perpendicular: DVector<f64>,
    /// State A gradient with the difference direction projected out
    pub parallel: DVector<f64>,
    /// Combined search gradient
    pub effective: DVector<f64>,
}

/// Computes the effective gradient from the two states' energies and gradients.
///
/// # Errors
///
/// - [`MecpError::InvalidGeometry`] for empty gradients
/// - [`MecpError::DimensionMismatch`] if the two gradients differ in length
/// - [`MecpError::DegenerateGradient`] if `gA == gB` (zero-norm difference)
///
/// # Examples
///
/// ```
/// use mecp::effective_gradient::{compute_effective_gradient, GradientFactors};
/// use mecp::geometry::{EnergyPair, GradientPair};
/// use nalgebra::DVector;
///
/// let energies = EnergyPair { a: -1.0, b: -1.001 };
/// let gradients = GradientPair {
///     a: DVector::from_vec(vec![0.1, 0.0, 0.0]),
///     b: DVector::from_vec(vec![-0.1, 0.0, 0.0]),
/// };
/// let result = compute_effective_gradient(&energies, &gradients, &GradientFactors::default()).unwrap();
/// assert!(result.parallel.norm() < 1e-15);
/// ```
pub fn compute_effective_gradient(
    energies: &EnergyPair,
    gradients: &GradientPair,
    factors: &GradientFactors,
) -> Result<EffectiveGradientResult> {
    let g_a = &gradients.a;
    let g_b = &gradients.b;
    if g_a.is_empty() {
        return Err(MecpError::InvalidGeometry(
            "effective gradient requires at least one atom".into(),
        ));
    }

    let perpendicular = linalg::sub(g_a, g_b)?;
    let norm_perp = linalg::norm(&perpendicular);
    if norm_perp == 0.0 {
        return Err(MecpError::DegenerateGradient);
    }

    let projection = linalg::dot(g_a, &perpendicular)? / norm_perp;
    let parallel = g_a - (&perpendicular / norm_perp) * projection;

    let effective =
        &perpendicular * (factors.perpendicular * energies.delta()) + &parallel * factors.parallel;

    Ok(EffectiveGradientResult {
        perpendicular,
        parallel,
        effective,
    })
}
