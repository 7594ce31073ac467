//! File naming for one MECP job.
//!
//! Every file a run produces is prefixed with the job name, so several jobs
//! can share a directory without clobbering each other.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use mecp::naming::FileNaming;
//!
//! let naming = FileNaming::from_input(Path::new("runs/ethylene.xyz"));
//! assert_eq!(naming.basename(), "ethylene");
//! assert_eq!(naming.checkpoint(), Path::new("runs/ethylene_checkpoint.json"));
//! assert_eq!(naming.final_mecp_xyz(), Path::new("runs/ethylene_mecp.xyz"));
//! ```

use std::path::{Path, PathBuf};

/// Output file names of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    basename: String,
    dir: PathBuf,
}

impl FileNaming {
    /// Names files `<dir>/<job>_*`.
    pub fn new(job: &str, dir: &Path) -> Self {
        Self {
            basename: job.to_string(),
            dir: dir.to_path_buf(),
        }
    }

    /// Derives the job name from the stem of `input_path` and places output
    /// files next to it.
    pub fn from_input(input_path: &Path) -> Self {
        let basename = input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("mecp_job")
            .to_string();
        let dir = input_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self { basename, dir }
    }

    /// Job name used as prefix.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Directory output files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.basename, suffix))
    }

    /// `<job>_checkpoint.json`
    pub fn checkpoint(&self) -> PathBuf {
        self.file("_checkpoint.json")
    }

    /// `<job>_mecp.log`, the human-readable run log
    pub fn run_log(&self) -> PathBuf {
        self.file("_mecp.log")
    }

    /// `<job>_traj.xyz`, one frame per iteration
    pub fn trajectory(&self) -> PathBuf {
        self.file("_traj.xyz")
    }

    /// `<job>_mecp.xyz`, the final geometry
    pub fn final_mecp_xyz(&self) -> PathBuf {
        self.file("_mecp.xyz")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename_extraction() {
        let naming = FileNaming::from_input(Path::new("compound_xyz_123.xyz"));
        assert_eq!(naming.basename(), "compound_xyz_123");
        assert_eq!(naming.dir(), Path::new(""));
        assert_eq!(naming.run_log(), PathBuf::from("compound_xyz_123_mecp.log"));
    }

    #[test]
    fn test_files_follow_input_directory() {
        let naming = FileNaming::from_input(Path::new("/path/to/molecule.xyz"));
        assert_eq!(naming.trajectory(), PathBuf::from("/path/to/molecule_traj.xyz"));
        assert_eq!(naming.checkpoint(), PathBuf::from("/path/to/molecule_checkpoint.json"));
    }

    #[test]
    fn test_explicit_job() {
        let naming = FileNaming::new("scan", Path::new("out"));
        assert_eq!(naming.final_mecp_xyz(), PathBuf::from("out/scan_mecp.xyz"));
    }
}
