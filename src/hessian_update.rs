//! Inverse-Hessian BFGS update and step-length control.
//!
//! The optimizer keeps an approximate *inverse* Hessian `H` of the effective
//! potential and proposes `x_new = x + limit(-H g)`. Three regimes exist:
//!
//! - [`UpdateRegime::ColdStart`]: first step of a fresh run, steepest descent
//!   with the fixed curvature `0.7 Å²/Hartree`
//! - [`UpdateRegime::Update`]: BFGS update from the last two points
//! - [`UpdateRegime::Replay`]: re-derives the step already taken from a
//!   stored `(H, g)` pair when resuming from a checkpoint
//!
//! # References
//!
//! - Press, W. H. et al. *Numerical Recipes*, `dfpmin` (BFGS inverse update).
//! - Harvey, J. N. MECP program, `UpdateX` (Nov. 2003).

use crate::error::{MecpError, Result};
use crate::linalg;
use nalgebra::{DMatrix, DVector};

/// Diagonal of the initial inverse Hessian, in Å²/Hartree.
pub const INITIAL_INVERSE_HESSIAN: f64 = 0.7;

/// Default per-coordinate step cap, in Å.
pub const DEFAULT_MAX_STEP_LENGTH: f64 = 0.1;

/// Returns the fresh-run inverse Hessian `0.7 * I`.
pub fn initial_inverse_hessian(dof: usize) -> DMatrix<f64> {
    DMatrix::identity(dof, dof) * INITIAL_INVERSE_HESSIAN
}

/// How the next step is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRegime {
    /// Fresh run, step 0: `-0.7 * g`, inverse Hessian passed through
    ColdStart,
    /// Step > 0: BFGS-update the inverse Hessian from the last two points
    Update,
    /// Resume: `-H * g` with the stored inverse Hessian passed through
    Replay,
}

impl UpdateRegime {
    /// Regime used for an ordinary iteration at `step`.
    pub fn for_step(step: usize) -> Self {
        if step == 0 {
            UpdateRegime::ColdStart
        } else {
            UpdateRegime::Update
        }
    }
}

/// Inputs of one step proposal.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Step index (used for error context)
    pub step: usize,
    /// Which update rule applies
    pub regime: UpdateRegime,
    /// Per-coordinate step cap in Å
    pub max_step_length: f64,
    /// Geometry at which `current_gradient` was evaluated
    pub current_coords: &'a DVector<f64>,
    /// Geometry of the previous iteration
    pub previous_coords: &'a DVector<f64>,
    /// Effective gradient at `current_coords`
    pub current_gradient: &'a DVector<f64>,
    /// Effective gradient at `previous_coords`
    pub previous_gradient: &'a DVector<f64>,
    /// Inverse Hessian carried over from the previous iteration
    pub inverse_hessian: &'a DMatrix<f64>,
}

/// Result of one step proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProposal {
    /// Proposed next coordinates
    pub next_coords: DVector<f64>,
    /// Inverse Hessian to carry into the next iteration
    pub inverse_hessian: DMatrix<f64>,
    /// Step before length limiting
    pub raw_step: DVector<f64>,
    /// Step actually taken (after limiting)
    pub step: DVector<f64>,
}

/// Updates the inverse Hessian using the BFGS formula.
///
/// Sherman–Morrison form of the standard BFGS inverse update, with
/// `s = Δx`, `y = Δg`:
/// ```text
/// a = 1 / (y·s)
/// b = 1 / (y·H·y)
/// w = a·s - b·H·y
/// H_new = H + a·s·sᵀ - b·(H·y)(H·y)ᵀ + (y·H·y)·w·wᵀ
/// ```
/// which equals `(I - ρ·s·yᵀ) H (I - ρ·y·sᵀ) + ρ·s·sᵀ` with `ρ = a`. The
/// result is symmetrised.
///
/// # Errors
///
/// - [`MecpError::StationaryUpdate`] if `y·s == 0` or `y·H·y == 0`
/// - [`MecpError::DimensionMismatch`] on inconsistent sizes
pub fn update_inverse_hessian_bfgs(
    h_inv: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
    step: usize,
) -> Result<DMatrix<f64>> {
    let h_del_g = linalg::sym_mat_vec(h_inv, delta_g)?;

    let fac_denom = linalg::dot(delta_g, delta_x)?;
    let fae = delta_g.dot(&h_del_g);
    if fac_denom == 0.0 || fae == 0.0 {
        return Err(MecpError::StationaryUpdate { step });
    }

    let fac = 1.0 / fac_denom;
    let fad = 1.0 / fae;

    let w = delta_x * fac - &h_del_g * fad;

    let term1 = linalg::outer(delta_x, delta_x) * fac;
    let term2 = linalg::outer(&h_del_g, &h_del_g) * fad;
    let term3 = linalg::outer(&w, &w) * fae;

    let h_inv_new = h_inv + term1 - term2 + term3;
    Ok((&h_inv_new + h_inv_new.transpose()) * 0.5)
}

/// Limits a raw step in two stages, in this order:
///
/// 1. if `|step| > max_step_length * sqrt(dof)`, rescale the whole step to
///    that norm
/// 2. if `max_i |step_i| > max_step_length`, rescale so the largest
///    component equals `max_step_length`
///
/// Applying the limiter to an already limited step leaves it unchanged.
pub fn limit_step(step: &DVector<f64>, max_step_length: f64) -> DVector<f64> {
    let mut limited = step.clone();

    let norm_cap = max_step_length * (step.len() as f64).sqrt();
    let norm = limited.norm();
    if norm > norm_cap {
        limited *= norm_cap / norm;
    }

    let largest = linalg::max_abs(&limited);
    if largest > max_step_length {
        limited *= max_step_length / largest;
    }

    limited
}

/// Proposes the next geometry and the inverse Hessian to carry forward.
///
/// # Errors
///
/// - [`MecpError::StationaryUpdate`] in the update regime when the
///   gradient/coordinate changes carry no curvature information
/// - [`MecpError::DimensionMismatch`] on inconsistent sizes
pub fn propose_step(input: &StepInput<'_>) -> Result<StepProposal> {
    let n = input.current_coords.len();
    for len in [
        input.previous_coords.len(),
        input.current_gradient.len(),
        input.previous_gradient.len(),
        input.inverse_hessian.nrows(),
        input.inverse_hessian.ncols(),
    ] {
        if len != n {
            return Err(MecpError::DimensionMismatch {
                expected: n,
                found: len,
            });
        }
    }

    let (inverse_hessian, raw_step) = match input.regime {
        UpdateRegime::ColdStart => (
            input.inverse_hessian.clone(),
            input.current_gradient * -INITIAL_INVERSE_HESSIAN,
        ),
        UpdateRegime::Replay => {
            let step = -(input.inverse_hessian * input.current_gradient);
            (input.inverse_hessian.clone(), step)
        }
        UpdateRegime::Update => {
            let delta_g = input.current_gradient - input.previous_gradient;
            let delta_x = input.current_coords - input.previous_coords;
            let h_new =
                update_inverse_hessian_bfgs(input.inverse_hessian, &delta_x, &delta_g, input.step)?;
            let step = -(&h_new * input.current_gradient);
            (h_new, step)
        }
    };

    let step = limit_step(&raw_step, input.max_step_length);
    let next_coords = input.current_coords + &step;

    Ok(StepProposal {
        next_coords,
        inverse_hessian,
        raw_step,
        step,
    })
}
