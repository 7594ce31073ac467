//! Five-criterion convergence test for crossing-point searches.
//!
//! A step is converged when every one of the following is strictly below its
//! threshold:
//!
//! 1. max |G_i| of the effective gradient (Hartree/Å)
//! 2. RMS of the effective gradient (Hartree/Å)
//! 3. max |Δx_i| between the current and the proposed geometry (Å)
//! 4. RMS of that displacement (Å)
//! 5. |E_A - E_B| (Hartree)

use crate::error::Result;
use crate::geometry::EnergyPair;
use crate::linalg;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Convergence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Maximum effective-gradient component, Hartree/Å
    pub max_grad: f64,
    /// RMS effective gradient, Hartree/Å
    pub rms_grad: f64,
    /// Maximum coordinate change, Å
    pub max_chg: f64,
    /// RMS coordinate change, Å
    pub rms_chg: f64,
    /// Energy gap |E_A - E_B|, Hartree
    pub energy_diff: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_grad: 0.0007,
            rms_grad: 0.0005,
            max_chg: 0.004,
            rms_chg: 0.0025,
            energy_diff: 0.00005,
        }
    }
}

impl Thresholds {
    /// Rejects non-positive or non-finite thresholds.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, value) in [
            ("max_grad", self.max_grad),
            ("rms_grad", self.rms_grad),
            ("max_chg", self.max_chg),
            ("rms_chg", self.rms_chg),
            ("energy_diff", self.energy_diff),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("threshold {} must be positive, got {}", name, value));
            }
        }
        Ok(())
    }
}

/// One row of the convergence table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Criterion {
    /// Measured value
    pub value: f64,
    /// Threshold it is compared against
    pub threshold: f64,
    /// `value < threshold`
    pub passed: bool,
}

impl Criterion {
    fn new(value: f64, threshold: f64) -> Self {
        Self {
            value,
            threshold,
            passed: value < threshold,
        }
    }
}

/// Outcome of one convergence test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceReport {
    /// Maximum effective-gradient component
    pub max_grad: Criterion,
    /// RMS effective gradient
    pub rms_grad: Criterion,
    /// Maximum coordinate change
    pub max_chg: Criterion,
    /// RMS coordinate change
    pub rms_chg: Criterion,
    /// Energy gap
    pub energy_diff: Criterion,
}

impl ConvergenceReport {
    /// All five criteria passed.
    pub fn is_converged(&self) -> bool {
        self.criteria().iter().all(|(_, c)| c.passed)
    }

    /// Criteria in table order, with their labels.
    pub fn criteria(&self) -> [(&'static str, Criterion); 5] {
        [
            ("Maximum gradient", self.max_grad),
            ("RMS gradient", self.rms_grad),
            ("Maximum change of X", self.max_chg),
            ("RMS change of X", self.rms_chg),
            ("Energy difference", self.energy_diff),
        ]
    }
}

impl fmt::Display for ConvergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " Criteria                     Current           Threshold        Pass"
        )?;
        writeln!(
            f,
            "---------------------------------------------------------------------"
        )?;
        for (i, (label, c)) in self.criteria().iter().enumerate() {
            writeln!(
                f,
                "  {}. {:<22}  {:>14.8}      {:>12.8}       {}",
                i + 1,
                label,
                c.value,
                c.threshold,
                if c.passed { "YES" } else { "NO " }
            )?;
        }
        write!(
            f,
            " Converged: {}",
            if self.is_converged() { "YES" } else { "NO" }
        )
    }
}

/// Evaluates all five criteria.
///
/// The displacement is measured between `current` (the geometry the
/// gradients were computed at) and `proposed` (the next geometry).
///
/// # Errors
///
/// [`crate::error::MecpError::DimensionMismatch`] if the geometries differ in length.
pub fn check_convergence(
    current: &DVector<f64>,
    proposed: &DVector<f64>,
    energies: &EnergyPair,
    effective_gradient: &DVector<f64>,
    thresholds: &Thresholds,
) -> Result<ConvergenceReport> {
    let displacement = linalg::sub(proposed, current)?;

    Ok(ConvergenceReport {
        max_grad: Criterion::new(linalg::max_abs(effective_gradient), thresholds.max_grad),
        rms_grad: Criterion::new(linalg::rms(effective_gradient), thresholds.rms_grad),
        max_chg: Criterion::new(linalg::max_abs(&displacement), thresholds.max_chg),
        rms_chg: Criterion::new(linalg::rms(&displacement), thresholds.rms_chg),
        energy_diff: Criterion::new(energies.delta().abs(), thresholds.energy_diff),
    })
}
