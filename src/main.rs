//! mecp command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Fresh search from an XYZ geometry
//! mecp run ethylene.xyz --method "B3LYP/6-31G*" --mult-a 1 --mult-b 3
//!
//! # Ground state against a TD-DFT excited state
//! mecp run ethylene.xyz --mult-b 1 --method-b "TD(nstates=3,root=1)/6-31G*" --energy-parser-b td
//!
//! # Continue from the checkpoint of a previous invocation
//! mecp resume ethylene_checkpoint.json --max-steps 20
//!
//! # Write a commented settings file
//! mecp template mecp.cfg
//! ```
//!
//! Exit codes: 0 converged, 1 maximum steps reached, 2 failed (including
//! configuration errors), 130 cancelled (Ctrl-C / SIGTERM).

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use mecp::checkpoint::Checkpoint;
use mecp::config::Config;
use mecp::driver::{OptimizationDriver, Outcome, RunSummary};
use mecp::error::MecpError;
use mecp::geometry::Geometry;
use mecp::naming::FileNaming;
use mecp::provider::{CancellationToken, GaussianProvider, StateLabel};
use mecp::settings::{SettingsManager, SETTINGS_FILE_NAME};
use std::path::{Path, PathBuf};
use std::process;

const EXIT_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "mecp", version, about = "Minimum energy crossing point optimizer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new search from an XYZ geometry
    Run {
        /// Starting geometry (XYZ, element symbols or atomic numbers)
        geometry: PathBuf,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Continue a search from a checkpoint
    Resume {
        /// Checkpoint written by a previous run
        checkpoint: PathBuf,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Write a commented settings template
    Template {
        /// Output path
        #[arg(default_value = SETTINGS_FILE_NAME)]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunOptions {
    /// Settings file taking precedence over all others
    #[arg(long, value_name = "INI")]
    config: Option<PathBuf>,
    /// Job name (defaults to the geometry file stem)
    #[arg(long)]
    job: Option<String>,
    /// Iterations for this invocation
    #[arg(long)]
    max_steps: Option<usize>,
    /// Largest change of any coordinate per step (Å)
    #[arg(long)]
    max_step_length: Option<f64>,
    /// Maximum effective gradient threshold (Hartree/Å)
    #[arg(long)]
    max_grad: Option<f64>,
    /// RMS effective gradient threshold (Hartree/Å)
    #[arg(long)]
    rms_grad: Option<f64>,
    /// Maximum displacement threshold (Å)
    #[arg(long)]
    max_chg: Option<f64>,
    /// RMS displacement threshold (Å)
    #[arg(long)]
    rms_chg: Option<f64>,
    /// Energy gap threshold (Hartree)
    #[arg(long)]
    energy_diff: Option<f64>,
    /// Provider executable
    #[arg(long)]
    program: Option<String>,
    /// Method and basis set
    #[arg(long)]
    method: Option<String>,
    /// Method and basis set of state B, if different
    #[arg(long)]
    method_b: Option<String>,
    /// Extra route keywords
    #[arg(long, allow_hyphen_values = true)]
    extra_route: Option<String>,
    /// Extra route keywords of state B, if different
    #[arg(long, allow_hyphen_values = true)]
    extra_route_b: Option<String>,
    /// Molecular charge
    #[arg(long, allow_hyphen_values = true)]
    charge: Option<i32>,
    /// Multiplicity of state A
    #[arg(long)]
    mult_a: Option<u32>,
    /// Multiplicity of state B
    #[arg(long)]
    mult_b: Option<u32>,
    /// Energy parser: dft, mp2, cis or td
    #[arg(long)]
    energy_parser: Option<String>,
    /// Energy parser of state B, if different
    #[arg(long)]
    energy_parser_b: Option<String>,
    /// Seconds per provider call
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Evaluate both states concurrently
    #[arg(long)]
    parallel: bool,
}

impl RunOptions {
    /// Applies command-line overrides on top of `config`.
    fn apply(&self, config: &mut Config) {
        if let Some(job) = &self.job {
            config.job = job.clone();
        }
        if let Some(v) = self.max_steps {
            config.max_steps = v;
        }
        if let Some(v) = self.max_step_length {
            config.max_step_length = v;
        }
        let t = &mut config.thresholds;
        for (flag, slot) in [
            (self.max_grad, &mut t.max_grad),
            (self.rms_grad, &mut t.rms_grad),
            (self.max_chg, &mut t.max_chg),
            (self.rms_chg, &mut t.rms_chg),
            (self.energy_diff, &mut t.energy_diff),
        ] {
            if let Some(v) = flag {
                *slot = v;
            }
        }
        let p = &mut config.provider;
        if let Some(v) = &self.program {
            p.program = v.clone();
        }
        if let Some(v) = &self.method {
            p.method = v.clone();
        }
        if let Some(v) = &self.method_b {
            p.method_b = Some(v.clone());
        }
        if let Some(v) = &self.extra_route {
            p.extra_route = v.clone();
        }
        if let Some(v) = &self.extra_route_b {
            p.extra_route_b = Some(v.clone());
        }
        if let Some(v) = self.charge {
            p.charge = v;
        }
        if let Some(v) = self.mult_a {
            p.mult_a = v;
        }
        if let Some(v) = self.mult_b {
            p.mult_b = v;
        }
        if let Some(v) = &self.energy_parser {
            p.energy_parser = v.to_lowercase();
        }
        if let Some(v) = &self.energy_parser_b {
            p.energy_parser_b = Some(v.to_lowercase());
        }
        if let Some(v) = self.timeout_secs {
            p.timeout_secs = if v == 0 { None } else { Some(v) };
        }
        if self.parallel {
            p.parallel = true;
        }
    }
}

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Template { path } => {
            init_logging(log::LevelFilter::Info);
            match SettingsManager::create_template(&path) {
                Ok(()) => {
                    println!("Settings template written to {}", path.display());
                    0
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    EXIT_FAILED
                }
            }
        }
        Commands::Run { geometry, options } => start(&options, |config| {
            run_fresh(&geometry, &options, config)
        }),
        Commands::Resume {
            checkpoint,
            options,
        } => start(&options, |config| resume(&checkpoint, &options, config)),
    };

    process::exit(code);
}

/// Loads settings, initializes logging and runs `body`, mapping the result to
/// an exit code.
fn start<F>(options: &RunOptions, body: F) -> i32
where
    F: FnOnce(Config) -> Result<RunSummary, MecpError>,
{
    let manager = match SettingsManager::load(options.config.as_deref()) {
        Ok(manager) => manager,
        Err(e) => {
            init_logging(log::LevelFilter::Info);
            error!("Failed to load settings: {}", e);
            return EXIT_FAILED;
        }
    };
    init_logging(manager.settings().logging.level_filter());
    info!("Configuration loaded from: {}", manager.config_source());

    let settings = manager.into_settings();
    match body(settings.config) {
        Ok(summary) => {
            print_summary(&summary);
            summary.outcome.exit_code()
        }
        Err(e) => {
            error!("{}", e);
            EXIT_FAILED
        }
    }
}

fn cancellation_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Could not install signal handler: {}", e);
    }
    token
}

fn run_fresh(path: &Path, options: &RunOptions, mut config: Config) -> Result<RunSummary, MecpError> {
    let geometry = Geometry::from_xyz_file(path)?;
    let mut naming = FileNaming::from_input(path);
    config.job = naming.basename().to_string();
    options.apply(&mut config);
    if config.job != naming.basename() {
        naming = FileNaming::new(&config.job, naming.dir());
    }

    info!("Read {} atoms from {}", geometry.num_atoms(), path.display());
    execute(config, naming, |driver| driver.run(geometry))
}

fn resume(path: &Path, options: &RunOptions, _settings: Config) -> Result<RunSummary, MecpError> {
    // The stored configuration wins over settings files; only explicit flags change it.
    let (state, mut config) = Checkpoint::load(path)?;
    options.apply(&mut config);
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let naming = FileNaming::new(&config.job, dir);

    info!("Loaded checkpoint {} at step {}", path.display(), state.step);
    execute(config, naming, |driver| driver.resume(state))
}

fn execute<F>(config: Config, naming: FileNaming, body: F) -> Result<RunSummary, MecpError>
where
    F: FnOnce(&mut OptimizationDriver<'_, GaussianProvider>) -> Result<RunSummary, MecpError>,
{
    config.validate()?;
    let provider = GaussianProvider::new(
        config.provider.gaussian_settings(&config.job),
        Box::new(config.provider.energy_parser(StateLabel::A)?),
    )
    .with_energy_parser_b(Box::new(config.provider.energy_parser(StateLabel::B)?));
    let mut driver = OptimizationDriver::new(config, &provider, naming, cancellation_token());
    body(&mut driver)
}

fn print_summary(summary: &RunSummary) {
    if let Some(report) = &summary.last_report {
        println!("{}", report);
    }
    match &summary.outcome {
        Outcome::Converged => {
            println!("\nMECP converged at step {}:", summary.state.step);
            print!("{}", summary.final_geometry);
        }
        Outcome::MaxStepsReached => {
            println!(
                "\nNot converged after {} iterations. Last geometry:",
                summary.iterations
            );
            print!("{}", summary.final_geometry);
        }
        Outcome::Failed(e) => println!("\nRun failed: {}", e),
        Outcome::Cancelled => println!("\nRun cancelled at step {}", summary.state.step),
    }
    if let Some(e) = &summary.last_energies {
        println!(
            "E(A) = {:.10}  E(B) = {:.10}  dE = {:.3e}",
            e.a,
            e.b,
            e.delta()
        );
    }
}
