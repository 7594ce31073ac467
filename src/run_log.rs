//! Human-readable run log.
//!
//! The run log is an append-only text file, separate from diagnostic logging.
//! Each iteration records the geometry it started from, both energies, the
//! gradient components and the convergence table. At termination the initial
//! and final geometries, a status line and a timing report are appended.
//! A resumed run keeps appending to the same file.

use crate::config::HessianDisplay;
use crate::convergence::ConvergenceReport;
use crate::effective_gradient::EffectiveGradientResult;
use crate::geometry::{EnergyPair, Geometry};
use crate::linalg;
use nalgebra::{DMatrix, DVector};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const FULL_BLOCK: usize = 6;
const SIGN_BLOCK: usize = 18;
const RULE: &str =
    "------------------------------------------------------------------------------";

/// Wall-clock accounting for the timing report.
#[derive(Debug, Clone)]
pub struct RunTimer {
    started: Instant,
    provider: Duration,
}

impl Default for RunTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTimer {
    /// Starts the clock.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            provider: Duration::ZERO,
        }
    }

    /// Adds time spent inside the provider.
    pub fn add_provider_time(&mut self, elapsed: Duration) {
        self.provider += elapsed;
    }

    /// Time since the clock started.
    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time spent inside the provider.
    pub fn provider(&self) -> Duration {
        self.provider
    }
}

/// Everything logged for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct StepRecord<'a> {
    /// Iteration index
    pub step: usize,
    /// Geometry the gradients were evaluated at
    pub geometry: &'a Geometry,
    /// Energies of both states
    pub energies: &'a EnergyPair,
    /// Effective-gradient components
    pub gradient: &'a EffectiveGradientResult,
    /// Convergence table
    pub report: &'a ConvergenceReport,
    /// Geometry proposed for the next iteration
    pub proposed: &'a Geometry,
    /// Inverse Hessian used for the step
    pub inverse_hessian: &'a DMatrix<f64>,
}

/// Append-only run log.
pub struct RunLog {
    path: PathBuf,
    out: BufWriter<File>,
    show_hessian: HessianDisplay,
}

impl RunLog {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path, show_hessian: HessianDisplay) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            show_hessian,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the banner for a new or resumed invocation.
    pub fn write_header(&mut self, job: &str, start_step: usize, resumed: bool) -> io::Result<()> {
        writeln!(self.out, "{}", RULE)?;
        if resumed {
            writeln!(self.out, " MECP job '{}' resumed at step {}", job, start_step)?;
        } else {
            writeln!(self.out, " MECP job '{}' started", job)?;
        }
        writeln!(self.out, "{}", RULE)?;
        self.out.flush()
    }

    /// Appends the record of one iteration.
    pub fn write_step(&mut self, record: &StepRecord<'_>) -> io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "\nGeometry at beginning of step {}:", record.step)?;
        write!(out, "{}", record.geometry)?;
        writeln!(out)?;
        writeln!(out, "Energy of first state  (A): {:>20.10}", record.energies.a)?;
        writeln!(out, "Energy of second state (B): {:>20.10}", record.energies.b)?;
        writeln!(out, "Difference E(A) - E(B):     {:>20.10}", record.energies.delta())?;
        writeln!(out)?;

        let g = record.gradient;
        write_vector(out, "Effective gradient", &g.effective)?;
        write_vector(out, "Difference gradient (gA - gB)", &g.perpendicular)?;
        write_vector(out, "Parallel gradient", &g.parallel)?;
        writeln!(out)?;

        writeln!(out, "{}", record.report)?;
        writeln!(out)?;
        writeln!(out, "Proposed geometry:")?;
        write!(out, "{}", record.proposed)?;

        match self.show_hessian {
            HessianDisplay::None => {}
            HessianDisplay::Full => {
                writeln!(out, "\nInverse Hessian:")?;
                write_hessian(out, record.inverse_hessian)?;
            }
            HessianDisplay::Sign => {
                writeln!(out, "\nInverse Hessian (signs):")?;
                write_hessian_sign(out, record.inverse_hessian)?;
            }
        }
        out.flush()
    }

    /// Appends the closing section.
    pub fn write_termination(
        &mut self,
        initial: &Geometry,
        last: &Geometry,
        status: &str,
        timer: &RunTimer,
    ) -> io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "\n{}", RULE)?;
        writeln!(out, "Initial geometry:")?;
        write!(out, "{}", initial)?;
        writeln!(out, "\nFinal geometry:")?;
        write!(out, "{}", last)?;
        writeln!(out, "\n{}", status)?;
        write_timing(out, timer)?;
        writeln!(out, "{}", RULE)?;
        out.flush()
    }
}

fn write_vector<W: Write>(out: &mut W, title: &str, v: &DVector<f64>) -> io::Result<()> {
    writeln!(out, "{} (RMS {:.8}):", title, linalg::rms(v))?;
    for (atom, chunk) in v.as_slice().chunks(3).enumerate() {
        write!(out, "{:>4}", atom + 1)?;
        for value in chunk {
            write!(out, " {:>15.8}", value)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn coord_label(index: usize) -> String {
    let axis = ['X', 'Y', 'Z'][index % 3];
    format!("{}{}", axis, index / 3 + 1)
}

fn signed(value: f64) -> String {
    if value.is_sign_negative() {
        format!("{:.8}", value)
    } else {
        format!(" {:.8}", value)
    }
}

/// Lower triangle in column blocks of six with numeric values.
pub fn write_hessian<W: Write>(out: &mut W, h: &DMatrix<f64>) -> io::Result<()> {
    let size = h.nrows();
    for diag in (0..size).step_by(FULL_BLOCK) {
        let end = (diag + FULL_BLOCK).min(size);
        write!(out, "    ")?;
        for c in diag..end {
            write!(out, "{:^12}", coord_label(c))?;
        }
        writeln!(out)?;
        for row in diag..size {
            write!(out, "{:<4}", coord_label(row))?;
            for col in diag..(row + 1).min(end) {
                write!(out, "{:>12}", signed(h[(row, col)]))?;
            }
            writeln!(out)?;
        }
    }
    writeln!(out)
}

fn sign_symbol(value: f64) -> &'static str {
    if value == 0.0 {
        "  0 "
    } else if value < -1.0 {
        " ---"
    } else if value > 1.0 {
        " +++"
    } else if value < -0.35 {
        " -- "
    } else if value > 0.35 {
        " ++ "
    } else if value < 0.0 {
        "  - "
    } else {
        "  + "
    }
}

/// Lower triangle in column blocks of eighteen, one sign symbol per element.
pub fn write_hessian_sign<W: Write>(out: &mut W, h: &DMatrix<f64>) -> io::Result<()> {
    let size = h.nrows();
    for diag in (0..size).step_by(SIGN_BLOCK) {
        let end = (diag + SIGN_BLOCK).min(size);
        write!(out, "    ")?;
        for c in diag..end {
            write!(out, "{:^4}", coord_label(c))?;
        }
        writeln!(out)?;
        for row in diag..size {
            write!(out, "{:<4}", coord_label(row))?;
            for col in diag..(row + 1).min(end) {
                write!(out, "{}", sign_symbol(h[(row, col)]))?;
            }
            writeln!(out)?;
        }
    }
    writeln!(out)
}

fn write_timing<W: Write>(out: &mut W, timer: &RunTimer) -> io::Result<()> {
    let total = timer.total();
    let provider = timer.provider().min(total);
    let own = total - provider;
    let share = |d: Duration| {
        if total.is_zero() {
            0.0
        } else {
            d.as_secs_f64() * 100.0 / total.as_secs_f64()
        }
    };
    writeln!(out, "Total running time: {:.2?}", total)?;
    writeln!(
        out,
        "  Provider running time: {:.2?} ({:.3}%)",
        provider,
        share(provider)
    )?;
    writeln!(out, "  MECP running time:     {:.2?} ({:.3}%)", own, share(own))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::{check_convergence, Thresholds};
    use crate::effective_gradient::{compute_effective_gradient, GradientFactors};
    use crate::geometry::GradientPair;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hessian_full_layout() {
        let h = DMatrix::identity(3, 3) * 0.7;
        let mut buf = Vec::new();
        write_hessian(&mut buf, &h).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("X1") && lines[0].contains("Z1"));
        assert!(lines[1].starts_with("X1"));
        assert!(lines[1].contains("0.70000000"));
        // Lower triangle: row 3 has three entries.
        assert_eq!(lines[3].matches("0.").count(), 3);
    }

    #[test]
    fn test_hessian_sign_symbols() {
        let h = DMatrix::from_row_slice(
            3,
            3,
            &[2.0, -0.5, 0.1, -0.5, -2.0, 0.0, 0.1, 0.0, 0.4],
        );
        let mut buf = Vec::new();
        write_hessian_sign(&mut buf, &h).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "X1   +++");
        assert_eq!(lines[2], "Y1   --  ---");
        assert_eq!(lines[3], "Z1     +   0  ++ ");
    }

    #[test]
    fn test_step_and_termination() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job_mecp.log");
        let geom = Geometry::new(vec![1, 1], vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.74]).unwrap();
        let energies = EnergyPair { a: -1.1, b: -1.0 };
        let gradients = GradientPair {
            a: DVector::from_vec(vec![0.0, 0.0, 0.1, 0.0, 0.0, -0.1]),
            b: DVector::from_vec(vec![0.0, 0.0, -0.1, 0.0, 0.0, 0.1]),
        };
        let gradient =
            compute_effective_gradient(&energies, &gradients, &GradientFactors::default())
                .unwrap();
        let report = check_convergence(
            &geom.coords,
            &geom.coords,
            &energies,
            &gradient.effective,
            &Thresholds::default(),
        )
        .unwrap();
        let h = DMatrix::identity(6, 6) * 0.7;

        {
            let mut log = RunLog::open(&path, HessianDisplay::Sign).unwrap();
            log.write_header("h2", 0, false).unwrap();
            log.write_step(&StepRecord {
                step: 0,
                geometry: &geom,
                energies: &energies,
                gradient: &gradient,
                report: &report,
                proposed: &geom,
                inverse_hessian: &h,
            })
            .unwrap();
        }
        {
            let mut log = RunLog::open(&path, HessianDisplay::None).unwrap();
            log.write_header("h2", 1, true).unwrap();
            let mut timer = RunTimer::new();
            timer.add_provider_time(Duration::from_millis(1));
            log.write_termination(&geom, &geom, "Maximum number of steps reached.", &timer)
                .unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("MECP job 'h2' started"));
        assert!(text.contains("Geometry at beginning of step 0:"));
        assert!(text.contains("Inverse Hessian (signs):"));
        assert!(text.contains("resumed at step 1"));
        assert!(text.contains("Maximum number of steps reached."));
        assert!(text.contains("Provider running time"));
        assert!(text.find("started").unwrap() < text.find("resumed").unwrap());
    }
}
