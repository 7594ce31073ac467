#![deny(missing_docs)]

//! mecp - Minimum Energy Crossing Point optimizer
//!
//! Locates the lowest-energy geometry at which two electronic states (usually
//! of different spin multiplicity) are degenerate, following the algorithm of
//! Harvey et al. (Theor. Chim. Acta 1994).
//!
//! # Algorithm
//!
//! An external quantum chemistry program computes the energy and Cartesian
//! gradient of each state at the current geometry. The two gradients are
//! combined into an effective gradient
//!
//! ```text
//! perp     = gA - gB
//! parallel = gA - (perp / |perp|) * (gA . perp / |perp|)
//! G        = 140 * (EA - EB) * perp + parallel
//! ```
//!
//! whose zero is the crossing point. A quasi-Newton search on `G` with a
//! BFGS-updated inverse Hessian (starting at `0.7 * I`) and a per-coordinate
//! step cap of 0.1 Å proposes the next geometry. The search stops when the
//! maximum and RMS effective gradient, the maximum and RMS displacement and
//! the energy gap are all below their thresholds.
//!
//! # Quick Start
//!
//! ```no_run
//! use mecp::config::Config;
//! use mecp::driver::OptimizationDriver;
//! use mecp::energy_parser::BuiltinEnergyParser;
//! use mecp::geometry::Geometry;
//! use mecp::naming::FileNaming;
//! use mecp::provider::{CancellationToken, GaussianProvider};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let input = Path::new("ethylene.xyz");
//!     let geometry = Geometry::from_xyz_file(input)?;
//!     let naming = FileNaming::from_input(input);
//!
//!     let mut config = Config::default();
//!     config.job = naming.basename().to_string();
//!     config.provider.method = "B3LYP/6-31G*".to_string();
//!
//!     let provider = GaussianProvider::new(
//!         config.provider.gaussian_settings(&config.job),
//!         Box::new(BuiltinEnergyParser::Dft),
//!     );
//!     let mut driver =
//!         OptimizationDriver::new(config, &provider, naming, CancellationToken::new());
//!     let summary = driver.run(geometry)?;
//!     println!("{:?} after {} iterations", driver.state(), summary.iterations);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`geometry`](geometry/index.html) - Molecules, unit conversion, energy/gradient pairs
//! - [`effective_gradient`](effective_gradient/index.html) - Crossing-point search direction
//! - [`hessian_update`](hessian_update/index.html) - Inverse-Hessian BFGS and step control
//! - [`convergence`](convergence/index.html) - Five-criterion convergence test
//! - [`driver`](driver/index.html) - Iteration loop and termination states
//! - [`provider`](provider/index.html) - External program interface, Gaussian adapter
//! - [`checkpoint`](checkpoint/index.html) - Restart functionality
//! - [`settings`](settings/index.html) - INI settings files
//!
//! # References
//!
//! - Harvey, J. N.; Aschi, M.; Schwarz, H.; Koch, W. *Theor. Chem. Acc.* **1998**, 99, 95.
//! - Harvey, J. N.; Aschi, M. *Phys. Chem. Chem. Phys.* **1999**, 1, 5555.

/// Checkpoint save/load for resuming runs
pub mod checkpoint;
/// Run configuration
pub mod config;
/// Convergence thresholds and test
pub mod convergence;
/// Optimization driver state machine
pub mod driver;
/// Effective gradient from the two states
pub mod effective_gradient;
/// Energy extraction from provider output
pub mod energy_parser;
/// Error types
pub mod error;
/// Molecular geometry and unit conversion
pub mod geometry;
/// Inverse-Hessian update and step limiting
pub mod hessian_update;
/// Dimension-checked vector helpers
pub mod linalg;
/// Output file naming
pub mod naming;
/// Energy/gradient providers
pub mod provider;
/// Human-readable run log
pub mod run_log;
/// INI settings files
pub mod settings;
