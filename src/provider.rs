//! Energy/gradient providers.
//!
//! The optimizer never talks to a quantum chemistry program directly; it asks
//! an [`EnergyGradientProvider`] for the energy and Cartesian gradient of one
//! state at one geometry. [`GaussianProvider`] is the text-file adapter:
//!
//! 1. write `<job>_<step>_<A|B>.gjf` into the work directory
//! 2. run `<program> <input>`, honoring the timeout and cancellation token
//! 3. parse `<job>_<step>_<A|B>.log` for the energy and the forces block
//!
//! Tests and embedding code can implement the trait in-process.

use crate::energy_parser::EnergyParser;
use crate::geometry::{forces_to_gradient, Geometry};
use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Polling interval while waiting on a provider process.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors reported by a provider for a single evaluation.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// File system failure while writing input or reading output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The program could not be started
    #[error("failed to launch '{program}': {source}")]
    Launch {
        /// Program that failed to start
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
    /// The program exited unsuccessfully
    #[error("program exited with {0}")]
    ExitStatus(ExitStatus),
    /// The program exceeded its time budget and was killed
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The run was cancelled and the program was killed
    #[error("cancelled")]
    Cancelled,
    /// The electronic structure calculation did not converge
    #[error("SCF convergence failure")]
    ConvergenceFailure,
    /// Output lacked the energy or the gradient, or they were malformed
    #[error("missing or invalid data: {0}")]
    MissingData(String),
}

/// Which of the two electronic states is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateLabel {
    /// First state (the one minimized along the seam)
    A,
    /// Second state
    B,
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateLabel::A => f.write_str("A"),
            StateLabel::B => f.write_str("B"),
        }
    }
}

/// Shared cancellation flag.
///
/// Cloning shares the flag; cancelling any clone cancels all of them. A
/// [`child`](Self::child) token is also cancelled by its parent, but not the
/// other way round.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancellationToken>>,
}

impl CancellationToken {
    /// Creates an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested on this token or a parent.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    /// Creates a token that can be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }
}

/// One evaluation request.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    /// Optimization step
    pub step: usize,
    /// State to evaluate
    pub label: StateLabel,
    /// Spin multiplicity of the state
    pub multiplicity: u32,
    /// Method string, e.g. `B3LYP/6-31G*`
    pub method: &'a str,
    /// Extra route keywords, may be empty
    pub extra_route: &'a str,
    /// Geometry to evaluate at
    pub geometry: &'a Geometry,
}

/// Energy (Hartree) and gradient (Hartree/Å) of one state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateResult {
    /// Total energy
    pub energy: f64,
    /// Cartesian gradient, length 3N
    pub gradient: DVector<f64>,
}

/// Something that can evaluate the energy and gradient of a state.
pub trait EnergyGradientProvider: Send + Sync {
    /// Evaluates one state at one geometry. Blocks until done.
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError>;

    /// Location of the raw output for `request`, reported on failure.
    fn output_location(&self, _request: &ProviderRequest<'_>) -> Option<PathBuf> {
        None
    }
}

/// Runs `command` to completion, killing it on timeout or cancellation.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ProviderError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|source| ProviderError::Launch {
        program: program.clone(),
        source,
    })?;
    let started = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            warn!("Cancellation requested, killing '{}'", program);
            kill_and_reap(&mut child);
            return Err(ProviderError::Cancelled);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                warn!("'{}' exceeded {:?}, killing it", program, limit);
                kill_and_reap(&mut child);
                return Err(ProviderError::Timeout(limit));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(child: &mut std::process::Child) {
    if let Err(e) = child.kill() {
        debug!("kill failed (process may have exited): {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("wait after kill failed: {}", e);
    }
}

/// Settings of the Gaussian adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianSettings {
    /// Executable, e.g. `g16`
    pub program: String,
    /// Directory input and output files are written to
    pub work_dir: PathBuf,
    /// Job name, prefix of every file
    pub job: String,
    /// Molecular charge, shared by both states
    pub charge: i32,
    /// `%nprocshared`
    pub nprocs: u32,
    /// `%mem`
    pub mem: String,
    /// Text appended after the geometry (basis sets, ECPs, ...)
    pub footer: String,
    /// Add `guess=read` from step 1 onward
    pub read_later: bool,
    /// Wall-clock limit per evaluation
    pub timeout: Option<Duration>,
}

/// Gaussian text-file adapter.
pub struct GaussianProvider {
    settings: GaussianSettings,
    energy_parser: Box<dyn EnergyParser>,
    energy_parser_b: Option<Box<dyn EnergyParser>>,
}

impl GaussianProvider {
    /// Creates the adapter, reading both states' energies with `energy_parser`.
    pub fn new(settings: GaussianSettings, energy_parser: Box<dyn EnergyParser>) -> Self {
        Self {
            settings,
            energy_parser,
            energy_parser_b: None,
        }
    }

    /// Reads state B's energy with `energy_parser` instead.
    pub fn with_energy_parser_b(mut self, energy_parser: Box<dyn EnergyParser>) -> Self {
        self.energy_parser_b = Some(energy_parser);
        self
    }

    fn energy_parser(&self, label: StateLabel) -> &dyn EnergyParser {
        match (label, &self.energy_parser_b) {
            (StateLabel::B, Some(parser)) => parser.as_ref(),
            _ => self.energy_parser.as_ref(),
        }
    }

    fn stem(&self, step: usize, label: StateLabel) -> String {
        format!("{}_{}_{}", self.settings.job, step, label)
    }

    /// Path of the input file for `step` and `label`.
    pub fn input_path(&self, step: usize, label: StateLabel) -> PathBuf {
        self.settings
            .work_dir
            .join(format!("{}.gjf", self.stem(step, label)))
    }

    /// Path of the log file Gaussian writes for `step` and `label`.
    pub fn log_path(&self, step: usize, label: StateLabel) -> PathBuf {
        self.settings
            .work_dir
            .join(format!("{}.log", self.stem(step, label)))
    }

    /// Renders the Gaussian input deck for `request`.
    pub fn render_input(&self, request: &ProviderRequest<'_>) -> String {
        let s = &self.settings;
        let mut content = String::new();

        content.push_str(&format!("%chk={}_{}.chk\n", s.job, request.label));
        if !s.mem.is_empty() {
            content.push_str(&format!("%mem={}\n", s.mem));
        }
        content.push_str(&format!("%nprocshared={}\n", s.nprocs));

        let mut route = format!("#n {} force", request.method);
        let extra = request.extra_route.trim();
        if !extra.is_empty() {
            route.push(' ');
            route.push_str(extra);
        }
        if s.read_later && request.step > 0 {
            route.push_str(" guess=read");
        }
        content.push_str(&route);
        content.push_str("\n\n");

        content.push_str(&format!(
            "{} step {} state {}\n\n",
            s.job, request.step, request.label
        ));
        content.push_str(&format!("{} {}\n", s.charge, request.multiplicity));

        let geom = request.geometry;
        for i in 0..geom.num_atoms() {
            let c = geom.get_atom_coords(i);
            content.push_str(&format!(
                "{:<2}  {:>14.8}  {:>14.8}  {:>14.8}\n",
                geom.symbol(i),
                c[0],
                c[1],
                c[2]
            ));
        }
        content.push('\n');

        let footer = s.footer.trim();
        if !footer.is_empty() {
            content.push_str(footer);
            content.push('\n');
        }
        // Gaussian needs trailing blank lines.
        content.push_str("\n\n");
        content
    }
}

impl EnergyGradientProvider for GaussianProvider {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let input = self.input_path(request.step, request.label);
        let log_path = self.log_path(request.step, request.label);
        fs::create_dir_all(&self.settings.work_dir)?;
        fs::write(&input, self.render_input(request))?;
        debug!("Wrote {}", input.display());

        let file_name = input
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| input.clone());
        let mut command = Command::new(&self.settings.program);
        command
            .arg(file_name)
            .current_dir(&self.settings.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let status = run_with_timeout(&mut command, self.settings.timeout, cancel)?;
        let log = match fs::read_to_string(&log_path) {
            Ok(log) => log,
            Err(_) if !status.success() => return Err(ProviderError::ExitStatus(status)),
            Err(e) => {
                return Err(ProviderError::MissingData(format!(
                    "cannot read {}: {}",
                    log_path.display(),
                    e
                )))
            }
        };

        // A failed SCF is reported even if the program exited non-zero.
        if log.contains("Convergence failure") {
            return Err(ProviderError::ConvergenceFailure);
        }
        if !status.success() {
            return Err(ProviderError::ExitStatus(status));
        }

        parse_gaussian_log(
            &log,
            request.geometry.num_atoms(),
            self.energy_parser(request.label),
        )
    }

    fn output_location(&self, request: &ProviderRequest<'_>) -> Option<PathBuf> {
        Some(self.log_path(request.step, request.label))
    }
}

/// Extracts the energy and gradient of `num_atoms` atoms from a Gaussian log.
///
/// The forces block follows the `Center Atomic Forces` header: two lines are
/// skipped, then one row per atom with Fx, Fy, Fz in columns 3 to 5
/// (Hartree/Bohr). The last block in the log wins.
pub fn parse_gaussian_log(
    log: &str,
    num_atoms: usize,
    energy_parser: &dyn EnergyParser,
) -> Result<StateResult, ProviderError> {
    if log.contains("Convergence failure") {
        return Err(ProviderError::ConvergenceFailure);
    }

    let lines: Vec<&str> = log.lines().collect();
    let mut forces: Option<Vec<f64>> = None;
    let mut i = 0;
    while i < lines.len() {
        let fields: Vec<&str> = lines[i].split_whitespace().collect();
        if fields.len() > 2
            && fields[0] == "Center"
            && fields[1] == "Atomic"
            && fields[2] == "Forces"
        {
            let start = i + 3;
            let end = start + num_atoms;
            if end > lines.len() {
                return Err(ProviderError::MissingData(
                    "forces block ends before all atoms were read".into(),
                ));
            }
            let mut block = Vec::with_capacity(3 * num_atoms);
            for row in &lines[start..end] {
                let cols: Vec<&str> = row.split_whitespace().collect();
                if cols.len() < 5 {
                    return Err(ProviderError::MissingData(format!(
                        "malformed forces row: '{}'",
                        row.trim()
                    )));
                }
                for token in &cols[2..5] {
                    let value: f64 = token.parse().map_err(|_| {
                        ProviderError::MissingData(format!("invalid force component '{}'", token))
                    })?;
                    block.push(value);
                }
            }
            forces = Some(block);
            i = end;
            continue;
        }
        i += 1;
    }

    let forces =
        forces.ok_or_else(|| ProviderError::MissingData("no forces block found".into()))?;
    let energy = energy_parser
        .parse(log)
        .ok_or_else(|| ProviderError::MissingData("no energy found".into()))?;
    if !energy.is_finite() || forces.iter().any(|f| !f.is_finite()) {
        return Err(ProviderError::MissingData("non-finite energy or forces".into()));
    }

    Ok(StateResult {
        energy,
        gradient: forces_to_gradient(&DVector::from_vec(forces)),
    })
}
