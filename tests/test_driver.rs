//! End-to-end tests of the optimization driver against in-process providers.

use approx::assert_relative_eq;
use mecp::checkpoint::{Checkpoint, OptimizerState};
use mecp::config::Config;
use mecp::driver::{DriverState, OptimizationDriver, Outcome};
use mecp::error::MecpError;
use mecp::geometry::Geometry;
use mecp::naming::FileNaming;
use mecp::provider::{
    CancellationToken, EnergyGradientProvider, ProviderError, ProviderRequest, StateLabel,
    StateResult,
};
use nalgebra::DVector;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ALPHA: f64 = 0.05;

/// Two linear surfaces crossing at x = 0 along the first coordinate:
/// E_A = E0 + α x, E_B = E0 - α x. The parallel gradient vanishes, so the
/// effective gradient is 560 α² x along x.
#[derive(Default)]
struct LinearCrossing {
    calls: AtomicUsize,
}

impl EnergyGradientProvider for LinearCrossing {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let x = request.geometry.coords[0];
        let sign = match request.label {
            StateLabel::A => 1.0,
            StateLabel::B => -1.0,
        };
        let mut gradient = DVector::zeros(request.geometry.dof());
        gradient[0] = sign * ALPHA;
        Ok(StateResult {
            energy: -100.0 + sign * ALPHA * x,
            gradient,
        })
    }
}

/// A crossing seam with curvature in two directions, used where the
/// trajectory needs several BFGS updates.
struct CurvedCrossing;

impl EnergyGradientProvider for CurvedCrossing {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        let c = &request.geometry.coords;
        let (x, y, z) = (c[0], c[1], c[5] - 1.0);
        let n = request.geometry.dof();
        let mut gradient = DVector::zeros(n);
        let energy = match request.label {
            StateLabel::A => {
                gradient[0] = 0.04 + 0.2 * x;
                gradient[1] = 0.3 * y;
                gradient[5] = 0.5 * z;
                -50.0 + 0.04 * x + 0.1 * x * x + 0.15 * y * y + 0.25 * z * z
            }
            StateLabel::B => {
                gradient[0] = -0.03 + 0.1 * x;
                gradient[1] = 0.2 * y;
                gradient[5] = 0.6 * z;
                -50.01 - 0.03 * x + 0.05 * x * x + 0.1 * y * y + 0.3 * z * z
            }
        };
        Ok(StateResult { energy, gradient })
    }
}

/// Fails state B at a chosen step.
struct FailingAt {
    step: usize,
}

impl EnergyGradientProvider for FailingAt {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        if request.step == self.step && request.label == StateLabel::B {
            return Err(ProviderError::ConvergenceFailure);
        }
        LinearCrossing::default().evaluate(request, cancel)
    }
}

/// Both states share one gradient.
struct Degenerate;

impl EnergyGradientProvider for Degenerate {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        Ok(StateResult {
            energy: -1.0,
            gradient: DVector::from_element(request.geometry.dof(), 0.01),
        })
    }
}

/// Cancels the shared token during the provider call of a given step.
struct CancelAt {
    step: usize,
    token: CancellationToken,
    seen: Mutex<Vec<(usize, StateLabel)>>,
}

impl EnergyGradientProvider for CancelAt {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        self.seen.lock().unwrap().push((request.step, request.label));
        if request.step == self.step {
            self.token.cancel();
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        LinearCrossing::default().evaluate(request, cancel)
    }
}

fn start_geometry() -> Geometry {
    Geometry::new(vec![6, 8], vec![0.05, 0.0, 0.0, 0.0, 0.0, 1.13]).unwrap()
}

fn curved_start() -> Geometry {
    Geometry::new(vec![6, 8], vec![0.3, 0.05, 0.0, 0.0, 0.0, 1.08]).unwrap()
}

fn config(max_steps: usize) -> Config {
    let mut config = Config::default();
    config.job = "test".into();
    config.max_steps = max_steps;
    config
}

#[test]
fn test_linear_crossing_converges_in_three_iterations() {
    let dir = TempDir::new().unwrap();
    let provider = LinearCrossing::default();
    let naming = FileNaming::new("test", dir.path());
    let mut driver =
        OptimizationDriver::new(config(10), &provider, naming.clone(), CancellationToken::new());

    let summary = driver.run(start_geometry()).unwrap();

    assert!(matches!(summary.outcome, Outcome::Converged));
    assert_eq!(driver.state(), DriverState::Converged);
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.state.step, 2);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 6);

    // Step 0 is -0.7 g = -0.049 Å, step 1 lands on the crossing.
    let x = summary.final_geometry.coords[0];
    assert!(x.abs() < 1e-6, "final x = {}", x);
    for i in 1..6 {
        assert_eq!(summary.final_geometry.coords[i], start_geometry().coords[i]);
    }
    // After one update the curvature along x is 1 / 1.4.
    assert_relative_eq!(
        summary.state.inverse_hessian[(0, 0)],
        1.0 / 1.4,
        epsilon = 1e-9
    );

    let energies = summary.last_energies.unwrap();
    assert!(energies.delta().abs() < 5e-5);

    assert!(naming.final_mecp_xyz().exists());
    let log = fs::read_to_string(naming.run_log()).unwrap();
    assert!(log.contains("Geometry at beginning of step 2:"));
    assert!(log.contains("converged at step 2"));
    let trajectory = fs::read_to_string(naming.trajectory()).unwrap();
    assert_eq!(trajectory.matches("step ").count(), 3);
}

#[test]
fn test_first_step_is_cold_start() {
    let dir = TempDir::new().unwrap();
    let provider = LinearCrossing::default();
    let mut driver = OptimizationDriver::new(
        config(1),
        &provider,
        FileNaming::new("test", dir.path()),
        CancellationToken::new(),
    );

    let summary = driver.run(start_geometry()).unwrap();

    assert!(matches!(summary.outcome, Outcome::MaxStepsReached));
    assert_eq!(summary.outcome.exit_code(), 1);
    assert_eq!(summary.iterations, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    // effective gradient 560 α² x = 0.07, step -0.7 * 0.07
    assert_relative_eq!(summary.state.current.coords[0], 0.05 - 0.049, epsilon = 1e-12);
    assert_eq!(summary.state.previous, start_geometry());
    assert_relative_eq!(summary.state.previous_gradient[0], 0.07, epsilon = 1e-12);
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    let straight_dir = TempDir::new().unwrap();
    let straight_naming = FileNaming::new("test", straight_dir.path());
    let mut straight = OptimizationDriver::new(
        config(6),
        &CurvedCrossing,
        straight_naming.clone(),
        CancellationToken::new(),
    );
    let reference = straight.run(curved_start()).unwrap();

    let dir = TempDir::new().unwrap();
    let naming = FileNaming::new("test", dir.path());
    let mut first = OptimizationDriver::new(
        config(2),
        &CurvedCrossing,
        naming.clone(),
        CancellationToken::new(),
    );
    let partial = first.run(curved_start()).unwrap();
    assert!(matches!(partial.outcome, Outcome::MaxStepsReached));

    let (state, stored) = Checkpoint::load(&naming.checkpoint()).unwrap();
    assert_eq!(state, partial.state);
    assert_eq!(state.step, 2);

    let mut resumed_config = stored;
    resumed_config.max_steps = 4;
    let mut second =
        OptimizationDriver::new(resumed_config, &CurvedCrossing, naming.clone(), CancellationToken::new());
    let resumed = second.resume(state).unwrap();

    assert_eq!(resumed.state.step, reference.state.step);
    assert_eq!(resumed.final_geometry, reference.final_geometry);
    assert_eq!(resumed.state.inverse_hessian, reference.state.inverse_hessian);
    assert_eq!(resumed.outcome.exit_code(), reference.outcome.exit_code());

    // Same frames, energies and order across both invocations.
    let straight_frames = fs::read_to_string(straight_naming.trajectory()).unwrap();
    let resumed_frames = fs::read_to_string(naming.trajectory()).unwrap();
    assert_eq!(resumed_frames, straight_frames);
    assert_eq!(
        resumed_frames.matches("step ").count(),
        reference.iterations
    );

    let log = fs::read_to_string(naming.run_log()).unwrap();
    assert!(log.contains("resumed at step 2"));
}

#[test]
fn test_resume_with_smaller_step_length() {
    let dir = TempDir::new().unwrap();
    let naming = FileNaming::new("test", dir.path());
    let mut first = OptimizationDriver::new(
        config(2),
        &CurvedCrossing,
        naming.clone(),
        CancellationToken::new(),
    );
    first.run(curved_start()).unwrap();

    let (state, mut stored) = Checkpoint::load(&naming.checkpoint()).unwrap();
    // The last stored step was cut back to the 0.1 Å cap.
    let last_step = (&state.current.coords - &state.previous.coords).amax();
    assert_relative_eq!(last_step, 0.1, epsilon = 1e-12);
    assert_eq!(state.last_step_length, 0.1);

    stored.max_step_length = 0.05;
    stored.max_steps = 1;
    let mut resumed = OptimizationDriver::new(stored, &CurvedCrossing, naming, CancellationToken::new());
    let summary = resumed.resume(state).unwrap();

    assert!(matches!(summary.outcome, Outcome::MaxStepsReached));
    assert_eq!(summary.state.step, 3);
    assert_eq!(summary.state.last_step_length, 0.05);
    let next_step = (&summary.state.current.coords - &summary.state.previous.coords).amax();
    assert!(next_step <= 0.05 + 1e-12, "step after resume = {}", next_step);
}

#[test]
fn test_resume_rejects_inconsistent_checkpoint() {
    let dir = TempDir::new().unwrap();
    let naming = FileNaming::new("test", dir.path());
    let mut driver = OptimizationDriver::new(
        config(2),
        &CurvedCrossing,
        naming.clone(),
        CancellationToken::new(),
    );
    driver.run(curved_start()).unwrap();

    let (mut state, stored): (OptimizerState, Config) =
        Checkpoint::load(&naming.checkpoint()).unwrap();
    state.current.coords[1] += 1e-4;

    let mut resumed = OptimizationDriver::new(stored, &CurvedCrossing, naming, CancellationToken::new());
    assert!(matches!(
        resumed.resume(state),
        Err(MecpError::CheckpointCorruption(_))
    ));
}

#[test]
fn test_parallel_evaluation_matches_sequential() {
    let seq_dir = TempDir::new().unwrap();
    let mut seq = OptimizationDriver::new(
        config(5),
        &CurvedCrossing,
        FileNaming::new("test", seq_dir.path()),
        CancellationToken::new(),
    );
    let sequential = seq.run(curved_start()).unwrap();

    let par_dir = TempDir::new().unwrap();
    let mut par_config = config(5);
    par_config.provider.parallel = true;
    let mut par = OptimizationDriver::new(
        par_config,
        &CurvedCrossing,
        FileNaming::new("test", par_dir.path()),
        CancellationToken::new(),
    );
    let parallel = par.run(curved_start()).unwrap();

    assert_eq!(parallel.final_geometry, sequential.final_geometry);
    assert_eq!(parallel.iterations, sequential.iterations);
}

/// State A fails at once; state B runs until it is cancelled.
struct FailFastA;

impl EnergyGradientProvider for FailFastA {
    fn evaluate(
        &self,
        request: &ProviderRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StateResult, ProviderError> {
        if request.label == StateLabel::A {
            return Err(ProviderError::ConvergenceFailure);
        }
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(10) {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            thread::sleep(Duration::from_millis(5));
        }
        LinearCrossing::default().evaluate(request, cancel)
    }
}

#[test]
fn test_parallel_failure_stops_sibling() {
    let dir = TempDir::new().unwrap();
    let mut config = config(5);
    config.provider.parallel = true;
    let token = CancellationToken::new();
    let mut driver = OptimizationDriver::new(
        config,
        &FailFastA,
        FileNaming::new("test", dir.path()),
        token.clone(),
    );

    let started = Instant::now();
    let summary = driver.run(start_geometry()).unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!token.is_cancelled());
    match &summary.outcome {
        Outcome::Failed(MecpError::ProviderFailure { label, source, .. }) => {
            assert_eq!(*label, StateLabel::A);
            assert!(matches!(source, ProviderError::ConvergenceFailure));
        }
        other => panic!("expected state A failure, got {:?}", other),
    }
}

#[test]
fn test_degenerate_gradients_fail() {
    let dir = TempDir::new().unwrap();
    let mut driver = OptimizationDriver::new(
        config(5),
        &Degenerate,
        FileNaming::new("test", dir.path()),
        CancellationToken::new(),
    );
    let summary = driver.run(start_geometry()).unwrap();
    assert!(matches!(
        summary.outcome,
        Outcome::Failed(MecpError::DegenerateGradient)
    ));
    assert_eq!(summary.outcome.exit_code(), 2);
    assert_eq!(driver.state(), DriverState::Failed);
    assert_eq!(summary.iterations, 0);
}

#[test]
fn test_provider_failure_keeps_last_checkpoint() {
    let dir = TempDir::new().unwrap();
    let naming = FileNaming::new("test", dir.path());
    let mut driver = OptimizationDriver::new(
        config(10),
        &FailingAt { step: 1 },
        naming.clone(),
        CancellationToken::new(),
    );
    let summary = driver.run(start_geometry()).unwrap();

    match &summary.outcome {
        Outcome::Failed(MecpError::ProviderFailure {
            step, label, source, ..
        }) => {
            assert_eq!(*step, 1);
            assert_eq!(*label, StateLabel::B);
            assert!(matches!(source, ProviderError::ConvergenceFailure));
        }
        other => panic!("expected provider failure, got {:?}", other),
    }
    let (state, _) = Checkpoint::load(&naming.checkpoint()).unwrap();
    assert_eq!(state.step, 1);
    assert_eq!(state, summary.state);
}

#[test]
fn test_cancellation_persists_state() {
    let dir = TempDir::new().unwrap();
    let naming = FileNaming::new("test", dir.path());
    let token = CancellationToken::new();
    let provider = CancelAt {
        step: 1,
        token: token.clone(),
        seen: Mutex::new(Vec::new()),
    };
    let mut driver = OptimizationDriver::new(config(10), &provider, naming.clone(), token);

    let summary = driver.run(start_geometry()).unwrap();

    assert!(matches!(summary.outcome, Outcome::Cancelled));
    assert_eq!(summary.outcome.exit_code(), 130);
    assert_eq!(driver.state(), DriverState::Cancelled);
    assert_eq!(summary.iterations, 1);
    // State B of step 1 is never requested once the token fired.
    assert_eq!(
        *provider.seen.lock().unwrap(),
        vec![(0, StateLabel::A), (0, StateLabel::B), (1, StateLabel::A)]
    );

    let (state, _) = Checkpoint::load(&naming.checkpoint()).unwrap();
    assert_eq!(state.step, 1);
    assert_eq!(state, summary.state);
}

#[test]
fn test_cancelled_before_start() {
    let dir = TempDir::new().unwrap();
    let provider = LinearCrossing::default();
    let token = CancellationToken::new();
    token.cancel();
    let mut driver =
        OptimizationDriver::new(config(10), &provider, FileNaming::new("test", dir.path()), token);

    let summary = driver.run(start_geometry()).unwrap();
    assert!(matches!(summary.outcome, Outcome::Cancelled));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.state.step, 0);
}
