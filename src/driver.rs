//! Optimization driver.
//!
//! The driver owns the iteration loop of a crossing-point search:
//!
//! ```text
//! Initializing -> Iterating -> { Converged | Failed | MaxStepsReached | Cancelled }
//! ```
//!
//! Each iteration evaluates both states at the current geometry, builds the
//! effective gradient, proposes a step and tests convergence. A converged
//! iteration reports the geometry the gradients were evaluated at; otherwise
//! the state advances and a checkpoint is written, so an interrupted run can
//! be resumed with identical results.
//!
//! Errors are never retried. A provider error, a degenerate gradient, a
//! stationary update or a dimension mismatch ends the run as `Failed`; the
//! last checkpoint still holds the state from before the failing iteration.

use crate::checkpoint::{Checkpoint, OptimizerState};
use crate::config::Config;
use crate::convergence::{check_convergence, ConvergenceReport};
use crate::effective_gradient::compute_effective_gradient;
use crate::error::{MecpError, Result};
use crate::geometry::{EnergyPair, Geometry, GradientPair};
use crate::hessian_update::{propose_step, StepInput, UpdateRegime};
use crate::naming::FileNaming;
use crate::provider::{
    CancellationToken, EnergyGradientProvider, ProviderError, ProviderRequest, StateLabel,
    StateResult,
};
use crate::run_log::{RunLog, RunTimer, StepRecord};
use log::{debug, error, info, warn};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::thread;
use std::time::Instant;

/// Largest tolerated disagreement (Å) between a stored current geometry and
/// the one re-derived from the rest of a checkpoint.
pub const RESUME_TOLERANCE: f64 = 1e-8;

/// Lifecycle of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Setting up or validating the starting state
    Initializing,
    /// Inside the iteration loop
    Iterating,
    /// All convergence criteria met
    Converged,
    /// Terminated by an error
    Failed,
    /// Iteration budget of this invocation exhausted
    MaxStepsReached,
    /// Stopped by the cancellation token
    Cancelled,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Initializing => "initializing",
            DriverState::Iterating => "iterating",
            DriverState::Converged => "converged",
            DriverState::Failed => "failed",
            DriverState::MaxStepsReached => "max steps reached",
            DriverState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    /// All five criteria passed
    Converged,
    /// `max_steps` iterations ran without convergence
    MaxStepsReached,
    /// An unrecoverable error
    Failed(MecpError),
    /// Stopped on request
    Cancelled,
}

impl Outcome {
    /// Terminal driver state for this outcome.
    pub fn state(&self) -> DriverState {
        match self {
            Outcome::Converged => DriverState::Converged,
            Outcome::MaxStepsReached => DriverState::MaxStepsReached,
            Outcome::Failed(_) => DriverState::Failed,
            Outcome::Cancelled => DriverState::Cancelled,
        }
    }

    /// Process exit code: 0 converged, 1 max steps, 2 failed, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Converged => 0,
            Outcome::MaxStepsReached => 1,
            Outcome::Failed(_) => 2,
            Outcome::Cancelled => 130,
        }
    }
}

/// Result of one driver invocation.
#[derive(Debug)]
pub struct RunSummary {
    /// How the run ended
    pub outcome: Outcome,
    /// Optimizer state at termination (the checkpointed state unless converged)
    pub state: OptimizerState,
    /// Reported geometry: the converged geometry, or the next one to evaluate
    pub final_geometry: Geometry,
    /// Energies of the last completed iteration
    pub last_energies: Option<EnergyPair>,
    /// Convergence table of the last completed iteration
    pub last_report: Option<ConvergenceReport>,
    /// Iterations completed in this invocation
    pub iterations: usize,
}

/// Internal result of one pass through the loop.
enum Iteration {
    Advanced,
    Converged,
    Cancelled,
}

/// Drives an MECP search against a provider.
pub struct OptimizationDriver<'a, P: EnergyGradientProvider + ?Sized> {
    config: Config,
    provider: &'a P,
    naming: FileNaming,
    cancel: CancellationToken,
    state: DriverState,
    timer: RunTimer,
    last_energies: Option<EnergyPair>,
    last_report: Option<ConvergenceReport>,
}

impl<'a, P: EnergyGradientProvider + ?Sized> OptimizationDriver<'a, P> {
    /// Creates a driver. Output files are named by `naming`.
    pub fn new(
        config: Config,
        provider: &'a P,
        naming: FileNaming,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            naming,
            cancel,
            state: DriverState::Initializing,
            timer: RunTimer::new(),
            last_energies: None,
            last_report: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a fresh search from `geometry`.
    ///
    /// # Errors
    ///
    /// Setup failures only (invalid configuration, unwritable output files).
    /// Failures during iteration are reported as [`Outcome::Failed`].
    pub fn run(&mut self, geometry: Geometry) -> Result<RunSummary> {
        self.state = DriverState::Initializing;
        self.config.validate()?;
        let state = OptimizerState::fresh(geometry);
        info!(
            "Starting MECP search '{}' with {} atoms",
            self.config.job,
            state.initial.num_atoms()
        );
        self.save_checkpoint(&state)?;
        let mut log = self.open_log()?;
        log.write_header(&self.config.job, state.step, false)?;
        Ok(self.iterate(state, log))
    }

    /// Continues a search from checkpointed state.
    ///
    /// For `step > 0` the stored current geometry is re-derived from the
    /// previous geometry, previous gradient, inverse Hessian and the step cap
    /// recorded with them; a mismatch beyond [`RESUME_TOLERANCE`] means the
    /// checkpoint is inconsistent. A changed `max_step_length` only applies
    /// to the steps taken after the resume.
    ///
    /// # Errors
    ///
    /// [`MecpError::CheckpointCorruption`] for an inconsistent state, plus the
    /// setup failures of [`run`](Self::run).
    pub fn resume(&mut self, state: OptimizerState) -> Result<RunSummary> {
        self.state = DriverState::Initializing;
        self.config.validate()?;
        if state.step > 0 {
            self.verify_resume(&state)?;
        }
        info!(
            "Resuming MECP search '{}' at step {}",
            self.config.job, state.step
        );
        let mut log = self.open_log()?;
        log.write_header(&self.config.job, state.step, true)?;
        Ok(self.iterate(state, log))
    }

    fn verify_resume(&self, state: &OptimizerState) -> Result<()> {
        let replay = propose_step(&StepInput {
            step: state.step,
            regime: UpdateRegime::Replay,
            max_step_length: state.last_step_length,
            current_coords: &state.previous.coords,
            previous_coords: &state.previous.coords,
            current_gradient: &state.previous_gradient,
            previous_gradient: &state.previous_gradient,
            inverse_hessian: &state.inverse_hessian,
        })
        .map_err(|e| MecpError::CheckpointCorruption(format!("cannot replay last step: {}", e)))?;

        let deviation = (&replay.next_coords - &state.current.coords).amax();
        if deviation > RESUME_TOLERANCE {
            return Err(MecpError::CheckpointCorruption(format!(
                "stored current geometry deviates from the replayed step by {:e} Å",
                deviation
            )));
        }
        debug!("Replayed step {} matches stored geometry", state.step - 1);
        Ok(())
    }

    fn open_log(&self) -> Result<RunLog> {
        Ok(RunLog::open(&self.naming.run_log(), self.config.show_hessian)?)
    }

    fn save_checkpoint(&self, state: &OptimizerState) -> Result<()> {
        Checkpoint::new(state, &self.config).save(&self.naming.checkpoint())
    }

    fn iterate(&mut self, mut state: OptimizerState, mut log: RunLog) -> RunSummary {
        self.state = DriverState::Iterating;
        let mut iterations = 0;

        let outcome = loop {
            if iterations >= self.config.max_steps {
                break Outcome::MaxStepsReached;
            }
            match self.step_once(&mut state, &mut log) {
                Ok(Iteration::Advanced) => iterations += 1,
                Ok(Iteration::Converged) => {
                    iterations += 1;
                    break Outcome::Converged;
                }
                Ok(Iteration::Cancelled) => break Outcome::Cancelled,
                Err(e) => break Outcome::Failed(e),
            }
        };

        self.finish(state, log, outcome, iterations)
    }

    /// Runs one iteration. On success `state` has either advanced (and been
    /// checkpointed) or is left at the converged iteration.
    fn step_once(&mut self, state: &mut OptimizerState, log: &mut RunLog) -> Result<Iteration> {
        let step = state.step;
        if self.cancel.is_cancelled() {
            return Ok(Iteration::Cancelled);
        }
        info!("Step {}: evaluating states A and B", step);

        let (result_a, result_b) = match self.evaluate_pair(step, &state.current) {
            Ok(pair) => pair,
            Err(_) if self.cancel.is_cancelled() => return Ok(Iteration::Cancelled),
            Err(e) => return Err(e),
        };

        let dof = state.current.dof();
        for result in [&result_a, &result_b] {
            if result.gradient.len() != dof {
                return Err(MecpError::DimensionMismatch {
                    expected: dof,
                    found: result.gradient.len(),
                });
            }
        }

        let energies = EnergyPair {
            a: result_a.energy,
            b: result_b.energy,
        };
        let gradients = GradientPair {
            a: result_a.gradient,
            b: result_b.gradient,
        };
        let gradient = compute_effective_gradient(&energies, &gradients, &self.config.factors)?;

        let proposal = propose_step(&StepInput {
            step,
            regime: UpdateRegime::for_step(step),
            max_step_length: self.config.max_step_length,
            current_coords: &state.current.coords,
            previous_coords: &state.previous.coords,
            current_gradient: &gradient.effective,
            previous_gradient: &state.previous_gradient,
            inverse_hessian: &state.inverse_hessian,
        })?;
        let proposed = state.current.with_coords(proposal.next_coords)?;

        let report = check_convergence(
            &state.current.coords,
            &proposed.coords,
            &energies,
            &gradient.effective,
            &self.config.thresholds,
        )?;

        log.write_step(&StepRecord {
            step,
            geometry: &state.current,
            energies: &energies,
            gradient: &gradient,
            report: &report,
            proposed: &proposed,
            inverse_hessian: &proposal.inverse_hessian,
        })?;
        self.append_trajectory(step, &state.current, &energies)?;

        info!(
            "Step {}: E(A) = {:.10}, E(B) = {:.10}, dE = {:.3e}, converged: {}",
            step,
            energies.a,
            energies.b,
            energies.delta(),
            report.is_converged()
        );
        self.last_energies = Some(energies);
        let converged = report.is_converged();
        self.last_report = Some(report);

        if converged {
            return Ok(Iteration::Converged);
        }

        state.step += 1;
        state.previous = std::mem::replace(&mut state.current, proposed);
        state.previous_gradient = gradient.effective;
        state.inverse_hessian = proposal.inverse_hessian;
        state.last_step_length = self.config.max_step_length;
        self.save_checkpoint(state)?;
        Ok(Iteration::Advanced)
    }

    fn evaluate_pair(&mut self, step: usize, geometry: &Geometry) -> Result<(StateResult, StateResult)> {
        let started = Instant::now();
        let this = &*self;
        let result = if this.config.provider.parallel {
            // A failure of either state stops the other one early.
            let siblings = this.cancel.child();
            let (a, b) = thread::scope(|scope| {
                let handle_b = scope.spawn(|| {
                    let b = this.evaluate(step, StateLabel::B, geometry, &siblings);
                    if b.is_err() {
                        siblings.cancel();
                    }
                    b
                });
                let a = this.evaluate(step, StateLabel::A, geometry, &siblings);
                if a.is_err() {
                    siblings.cancel();
                }
                let b = handle_b.join().unwrap_or_else(|_| {
                    Err(MecpError::ProviderFailure {
                        step,
                        label: StateLabel::B,
                        source: ProviderError::MissingData("provider thread panicked".into()),
                        output: None,
                    })
                });
                (a, b)
            });
            match (a, b) {
                (Ok(a), Ok(b)) => Ok((a, b)),
                (Err(e), Err(other)) if is_cancellation(&e) => Err(other),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        } else {
            this.evaluate(step, StateLabel::A, geometry, &this.cancel).and_then(|a| {
                this.evaluate(step, StateLabel::B, geometry, &this.cancel)
                    .map(|b| (a, b))
            })
        };
        self.timer.add_provider_time(started.elapsed());
        result
    }

    fn evaluate(
        &self,
        step: usize,
        label: StateLabel,
        geometry: &Geometry,
        cancel: &CancellationToken,
    ) -> Result<StateResult> {
        let provider = &self.config.provider;
        let request = ProviderRequest {
            step,
            label,
            multiplicity: provider.multiplicity(label),
            method: provider.method(label),
            extra_route: provider.extra_route(label),
            geometry,
        };
        let failure = |source: ProviderError| MecpError::ProviderFailure {
            step,
            label,
            source,
            output: self.provider.output_location(&request),
        };

        if cancel.is_cancelled() {
            return Err(failure(ProviderError::Cancelled));
        }
        debug!("Step {}: provider call for state {}", step, label);
        self.provider.evaluate(&request, cancel).map_err(failure)
    }

    fn append_trajectory(&self, step: usize, geometry: &Geometry, energies: &EnergyPair) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.naming.trajectory())?;
        let comment = format!(
            "step {} E(A) = {:.10} E(B) = {:.10}",
            step, energies.a, energies.b
        );
        file.write_all(geometry.to_xyz_string(&comment).as_bytes())?;
        Ok(())
    }

    fn finish(
        &mut self,
        state: OptimizerState,
        mut log: RunLog,
        outcome: Outcome,
        iterations: usize,
    ) -> RunSummary {
        let final_geometry = state.current.clone();
        let status = match &outcome {
            Outcome::Converged => {
                info!("MECP converged at step {}", state.step);
                if let Err(e) = final_geometry.write_xyz(
                    &self.naming.final_mecp_xyz(),
                    &format!("MECP {} converged at step {}", self.config.job, state.step),
                ) {
                    error!("Failed to write final geometry: {}", e);
                }
                format!("The MECP optimization has converged at step {}.", state.step)
            }
            Outcome::MaxStepsReached => {
                warn!(
                    "Not converged after {} iterations; resume from {}",
                    iterations,
                    self.naming.checkpoint().display()
                );
                format!(
                    "Maximum number of steps ({}) reached without convergence.",
                    self.config.max_steps
                )
            }
            Outcome::Failed(e) => {
                error!("MECP search failed: {}", e);
                format!("Run failed: {}", e)
            }
            Outcome::Cancelled => {
                warn!("Cancellation requested at step {}", state.step);
                if let Err(e) = self.save_checkpoint(&state) {
                    error!("Failed to persist state after cancellation: {}", e);
                }
                format!("Run cancelled at step {}; state saved.", state.step)
            }
        };

        if let Err(e) = log.write_termination(&state.initial, &final_geometry, &status, &self.timer) {
            error!("Failed to finish run log {}: {}", log.path().display(), e);
        }

        self.state = outcome.state();
        RunSummary {
            outcome,
            state,
            final_geometry,
            last_energies: self.last_energies,
            last_report: self.last_report,
            iterations,
        }
    }
}

fn is_cancellation(error: &MecpError) -> bool {
    matches!(
        error,
        MecpError::ProviderFailure {
            source: ProviderError::Cancelled,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two states with equal and opposite constant gradients along x of atom 1.
    struct Opposed {
        calls: AtomicUsize,
    }

    impl EnergyGradientProvider for Opposed {
        fn evaluate(
            &self,
            request: &ProviderRequest<'_>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<StateResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let x = request.geometry.coords[0];
            let sign = match request.label {
                StateLabel::A => 1.0,
                StateLabel::B => -1.0,
            };
            let mut gradient = DVector::zeros(request.geometry.dof());
            gradient[0] = sign * 0.05;
            Ok(StateResult {
                energy: -1.0 + sign * 0.05 * x,
                gradient,
            })
        }
    }

    fn geometry() -> Geometry {
        Geometry::new(vec![1, 1], vec![0.05, 0.0, 0.0, 0.0, 0.0, 0.74]).unwrap()
    }

    #[test]
    fn test_state_transitions_and_exit_codes() {
        let dir = TempDir::new().unwrap();
        let provider = Opposed {
            calls: AtomicUsize::new(0),
        };
        let mut config = Config::default();
        config.max_steps = 1;
        let mut driver = OptimizationDriver::new(
            config,
            &provider,
            FileNaming::new("t", dir.path()),
            CancellationToken::new(),
        );
        assert_eq!(driver.state(), DriverState::Initializing);

        let summary = driver.run(geometry()).unwrap();
        assert!(matches!(summary.outcome, Outcome::MaxStepsReached));
        assert_eq!(summary.outcome.exit_code(), 1);
        assert_eq!(driver.state(), DriverState::MaxStepsReached);
        assert_eq!(summary.iterations, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.state.step, 1);
    }

    #[test]
    fn test_invalid_config_is_setup_error() {
        let dir = TempDir::new().unwrap();
        let provider = Opposed {
            calls: AtomicUsize::new(0),
        };
        let mut config = Config::default();
        config.max_step_length = 0.0;
        let mut driver = OptimizationDriver::new(
            config,
            &provider,
            FileNaming::new("t", dir.path()),
            CancellationToken::new(),
        );
        assert!(matches!(driver.run(geometry()), Err(MecpError::Config(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(Outcome::Converged.exit_code(), 0);
        assert_eq!(Outcome::Cancelled.exit_code(), 130);
        assert_eq!(Outcome::Failed(MecpError::DegenerateGradient).exit_code(), 2);
        assert_eq!(Outcome::Cancelled.state(), DriverState::Cancelled);
        assert_eq!(DriverState::MaxStepsReached.to_string(), "max steps reached");
    }
}
