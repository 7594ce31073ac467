//! Checkpoints for resuming MECP optimizations.
//!
//! After every completed iteration the driver writes the optimizer state to a
//! JSON file. A checkpoint holds:
//!
//! - **Step number**: index of the next iteration to run
//! - **Geometries**: initial, previous and current
//! - **Previous effective gradient**: gradient at the previous geometry
//! - **Inverse Hessian**: as a list of rows
//! - **Last step length**: the step cap that produced the current geometry
//! - **Configuration**: the complete run [`Config`]
//!
//! nalgebra types are converted to plain `Vec`s through serializable
//! wrappers. Files are written to a temporary file in the destination
//! directory and renamed into place, so a crash mid-write never leaves a
//! truncated checkpoint behind.
//!
//! ```no_run
//! use mecp::checkpoint::{Checkpoint, OptimizerState};
//! use mecp::config::Config;
//! use mecp::geometry::Geometry;
//! use std::path::Path;
//!
//! let geometry = Geometry::new(vec![1, 1], vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.74])?;
//! let state = OptimizerState::fresh(geometry);
//! Checkpoint::new(&state, &Config::default()).save(Path::new("h2_checkpoint.json"))?;
//! let (state, config) = Checkpoint::load(Path::new("h2_checkpoint.json"))?;
//! # Ok::<(), mecp::error::MecpError>(())
//! ```

use crate::config::Config;
use crate::error::{MecpError, Result};
use crate::geometry::Geometry;
use crate::hessian_update::{initial_inverse_hessian, DEFAULT_MAX_STEP_LENGTH};
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Version written into every checkpoint.
pub const FORMAT_VERSION: u32 = 1;

/// Largest tolerated `|H_ij - H_ji|` in a loaded inverse Hessian.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// State carried between iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    /// Index of the next iteration
    pub step: usize,
    /// Geometry the run started from
    pub initial: Geometry,
    /// Geometry of the previous iteration
    pub previous: Geometry,
    /// Geometry to evaluate next
    pub current: Geometry,
    /// Effective gradient at `previous`
    pub previous_gradient: DVector<f64>,
    /// Approximate inverse Hessian
    pub inverse_hessian: DMatrix<f64>,
    /// Step cap (Å) that produced `current` from `previous`
    pub last_step_length: f64,
}

impl OptimizerState {
    /// Starting state of a fresh run.
    pub fn fresh(geometry: Geometry) -> Self {
        let dof = geometry.dof();
        Self {
            step: 0,
            initial: geometry.clone(),
            previous: geometry.clone(),
            current: geometry,
            previous_gradient: DVector::zeros(dof),
            inverse_hessian: initial_inverse_hessian(dof),
            last_step_length: DEFAULT_MAX_STEP_LENGTH,
        }
    }
}

/// Serializable wrapper for [`Geometry`].
#[derive(Debug, Serialize, Deserialize)]
pub struct SerializableGeometry {
    /// Atomic numbers
    atomic_numbers: Vec<u8>,
    /// Flattened coordinates in Å
    coords: Vec<f64>,
}

impl From<&Geometry> for SerializableGeometry {
    fn from(geom: &Geometry) -> Self {
        Self {
            atomic_numbers: geom.atomic_numbers.clone(),
            coords: geom.coords.iter().copied().collect(),
        }
    }
}

impl SerializableGeometry {
    fn into_geometry(self, what: &str) -> Result<Geometry> {
        Geometry::new(self.atomic_numbers, self.coords)
            .map_err(|e| MecpError::CheckpointCorruption(format!("{} geometry: {}", what, e)))
    }
}

/// On-disk checkpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layout version
    pub format_version: u32,
    /// Index of the next iteration
    pub step: usize,
    initial_geometry: SerializableGeometry,
    previous_geometry: SerializableGeometry,
    current_geometry: SerializableGeometry,
    previous_gradient: Vec<f64>,
    inverse_hessian: Vec<Vec<f64>>,
    last_step_length: f64,
    /// Run configuration
    pub config: Config,
}

impl Checkpoint {
    /// Snapshots `state` and `config`.
    pub fn new(state: &OptimizerState, config: &Config) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            step: state.step,
            initial_geometry: (&state.initial).into(),
            previous_geometry: (&state.previous).into(),
            current_geometry: (&state.current).into(),
            previous_gradient: state.previous_gradient.iter().copied().collect(),
            inverse_hessian: state
                .inverse_hessian
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
            last_step_length: state.last_step_length,
            config: config.clone(),
        }
    }

    /// Writes the checkpoint atomically.
    ///
    /// # Errors
    ///
    /// [`MecpError::Io`] if the temporary file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MecpError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| MecpError::Io(e.error))?;
        debug!("Checkpoint for step {} written to {}", self.step, path.display());
        Ok(())
    }

    /// Reads and validates a checkpoint.
    ///
    /// # Errors
    ///
    /// - [`MecpError::Io`] if the file cannot be read
    /// - [`MecpError::CheckpointCorruption`] for malformed JSON, an unknown
    ///   format version, inconsistent shapes, non-finite values or a
    ///   non-symmetric inverse Hessian
    pub fn load(path: &Path) -> Result<(OptimizerState, Config)> {
        let content = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .map_err(|e| MecpError::CheckpointCorruption(format!("{}: {}", path.display(), e)))?;
        checkpoint.into_state()
    }

    /// Validates the snapshot and converts it back into optimizer state.
    pub fn into_state(self) -> Result<(OptimizerState, Config)> {
        let corrupt = |msg: String| MecpError::CheckpointCorruption(msg);

        if self.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }

        let initial = self.initial_geometry.into_geometry("initial")?;
        let previous = self.previous_geometry.into_geometry("previous")?;
        let current = self.current_geometry.into_geometry("current")?;
        for (what, geom) in [("previous", &previous), ("current", &current)] {
            if geom.atomic_numbers != initial.atomic_numbers {
                return Err(corrupt(format!(
                    "{} geometry has a different atom list than the initial geometry",
                    what
                )));
            }
        }

        let n = initial.dof();
        if self.previous_gradient.len() != n {
            return Err(corrupt(format!(
                "previous gradient has {} components, expected {}",
                self.previous_gradient.len(),
                n
            )));
        }
        if self.previous_gradient.iter().any(|g| !g.is_finite()) {
            return Err(corrupt("previous gradient contains non-finite values".into()));
        }

        if self.inverse_hessian.len() != n || self.inverse_hessian.iter().any(|r| r.len() != n) {
            return Err(corrupt(format!("inverse Hessian is not {}x{}", n, n)));
        }
        let flat: Vec<f64> = self.inverse_hessian.into_iter().flatten().collect();
        if flat.iter().any(|h| !h.is_finite()) {
            return Err(corrupt("inverse Hessian contains non-finite values".into()));
        }
        let inverse_hessian = DMatrix::from_row_slice(n, n, &flat);
        let asymmetry = (&inverse_hessian - inverse_hessian.transpose()).amax();
        if asymmetry > SYMMETRY_TOLERANCE {
            return Err(corrupt(format!(
                "inverse Hessian is not symmetric (max deviation {:e})",
                asymmetry
            )));
        }

        if !(self.last_step_length.is_finite() && self.last_step_length > 0.0) {
            return Err(corrupt(format!(
                "last step length {} is not positive",
                self.last_step_length
            )));
        }

        self.config
            .validate()
            .map_err(|e| corrupt(format!("stored configuration: {}", e)))?;

        let state = OptimizerState {
            step: self.step,
            initial,
            previous,
            current,
            previous_gradient: DVector::from_vec(self.previous_gradient),
            inverse_hessian,
            last_step_length: self.last_step_length,
        };
        Ok((state, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn sample_state() -> OptimizerState {
        let geom = Geometry::new(vec![6, 8], vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.13]).unwrap();
        let mut state = OptimizerState::fresh(geom.clone());
        state.step = 3;
        state.current = geom
            .with_coords(DVector::from_vec(vec![0.0, 0.0, 0.01, 0.0, 0.0, 1.12]))
            .unwrap();
        state.previous_gradient = DVector::from_vec(vec![0.0, 0.0, 0.02, 0.0, 0.0, -0.02]);
        state.inverse_hessian[(2, 5)] = 0.05;
        state.inverse_hessian[(5, 2)] = 0.05;
        state.last_step_length = 0.2;
        state
    }

    fn tamper(path: &Path, edit: impl FnOnce(&mut Value)) {
        let mut json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        edit(&mut json);
        fs::write(path, serde_json::to_string(&json).unwrap()).unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job_checkpoint.json");
        let state = sample_state();
        let mut config = Config::default();
        config.job = "co".into();

        Checkpoint::new(&state, &config).save(&path).unwrap();
        let (loaded, loaded_config) = Checkpoint::load(&path).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded_config, config);
    }

    #[test]
    fn test_overwrite_leaves_no_temporaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job_checkpoint.json");
        let mut state = sample_state();
        for step in 0..3 {
            state.step = step;
            Checkpoint::new(&state, &Config::default()).save(&path).unwrap();
        }
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(Checkpoint::load(&path).unwrap().0.step, 2);
    }

    #[test]
    fn test_asymmetric_hessian_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.json");
        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["inverse_hessian"][0][1] = Value::from(0.5);
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));
    }

    #[test]
    fn test_shape_errors_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.json");

        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["previous_gradient"].as_array_mut().unwrap().pop();
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));

        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["inverse_hessian"].as_array_mut().unwrap().pop();
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));

        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["last_step_length"] = Value::from(0.0);
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));

        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["current_geometry"]["atomic_numbers"][1] = Value::from(7);
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));
    }

    #[test]
    fn test_garbage_and_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));

        Checkpoint::new(&sample_state(), &Config::default()).save(&path).unwrap();
        tamper(&path, |json| {
            json["format_version"] = Value::from(99);
        });
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MecpError::CheckpointCorruption(_))
        ));

        assert!(matches!(
            Checkpoint::load(&dir.path().join("missing.json")),
            Err(MecpError::Io(_))
        ));
    }

    #[test]
    fn test_fresh_state() {
        let geom = Geometry::new(vec![1], vec![0.0, 0.0, 0.0]).unwrap();
        let state = OptimizerState::fresh(geom.clone());
        assert_eq!(state.step, 0);
        assert_eq!(state.previous, geom);
        assert_eq!(state.current, geom);
        assert_eq!(state.previous_gradient, DVector::zeros(3));
        assert_eq!(state.inverse_hessian, DMatrix::identity(3, 3) * 0.7);
        assert_eq!(state.last_step_length, DEFAULT_MAX_STEP_LENGTH);
    }
}
