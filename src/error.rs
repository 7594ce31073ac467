//! Error taxonomy for MECP optimization.
//!
//! Every failure the optimizer can hit maps onto one [`MecpError`] variant.
//! None of them are retried: the driver turns any of these into a terminal
//! `Failed` outcome and logs the variant together with the step index and,
//! for provider failures, the state label and output location.

use crate::provider::{ProviderError, StateLabel};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the MECP core and its driver.
#[derive(Error, Debug)]
pub enum MecpError {
    /// The external energy/gradient provider failed for one state.
    #[error("provider failure at step {step}, state {label}: {source}{}", fmt_output(.output))]
    ProviderFailure {
        /// Optimization step at which the provider was invoked
        step: usize,
        /// State whose evaluation failed
        label: StateLabel,
        /// Underlying provider error
        #[source]
        source: ProviderError,
        /// Raw provider output location, when one exists
        output: Option<PathBuf>,
    },
    /// The two states' gradients coincide, so the seam direction is undefined.
    #[error("degenerate gradients: the difference gradient has zero norm")]
    DegenerateGradient,
    /// The BFGS update received no curvature information (dGrad . dCoord == 0).
    #[error("stationary update at step {step}: gradient and coordinate changes carry no curvature information")]
    StationaryUpdate {
        /// Step at which the update was attempted
        step: usize,
    },
    /// Vector or matrix lengths disagree with the configured degrees of freedom.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected length
        expected: usize,
        /// Length actually provided
        found: usize,
    },
    /// The geometry cannot be optimized (no atoms, unknown element, ...).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// A checkpoint exists but is unreadable or inconsistent.
    #[error("checkpoint corruption: {0}")]
    CheckpointCorruption(String),
    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// File system failure outside of the provider (run log, geometry files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_output(output: &Option<PathBuf>) -> String {
    match output {
        Some(path) => format!(" (output: {})", path.display()),
        None => String::new(),
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MecpError>;
