//! Job-level configuration for an MECP run.
//!
//! [`Config`] gathers every parameter of a run: convergence thresholds, step
//! control, effective-gradient factors and the provider setup. It is built
//! from built-in defaults, then INI settings files (see
//! [`settings`](crate::settings)), then command-line flags, and is stored in
//! every checkpoint so a resumed run uses the same parameters.

use crate::convergence::Thresholds;
use crate::effective_gradient::GradientFactors;
use crate::energy_parser::BuiltinEnergyParser;
use crate::error::{MecpError, Result};
use crate::hessian_update::DEFAULT_MAX_STEP_LENGTH;
use crate::provider::{GaussianSettings, StateLabel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the inverse Hessian is written to the run log after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HessianDisplay {
    /// Not written
    #[default]
    None,
    /// Lower triangle with numeric values
    Full,
    /// Lower triangle with sign/magnitude symbols
    Sign,
}

impl FromStr for HessianDisplay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "no" | "false" | "" => Ok(HessianDisplay::None),
            "full" | "yes" | "true" => Ok(HessianDisplay::Full),
            "sign" => Ok(HessianDisplay::Sign),
            other => Err(format!(
                "invalid show_hessian '{}' (expected none, full or sign)",
                other
            )),
        }
    }
}

impl fmt::Display for HessianDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HessianDisplay::None => "none",
            HessianDisplay::Full => "full",
            HessianDisplay::Sign => "sign",
        };
        f.write_str(name)
    }
}

/// External program settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Executable, e.g. `g16`
    pub program: String,
    /// Method and basis, e.g. `B3LYP/6-31G*`
    pub method: String,
    /// Method for state B when it differs from state A, e.g. `TD(nstates=3)/6-31G*`
    pub method_b: Option<String>,
    /// Molecular charge, shared by both states
    pub charge: i32,
    /// Spin multiplicity of state A
    pub mult_a: u32,
    /// Spin multiplicity of state B
    pub mult_b: u32,
    /// Processors per calculation
    pub nprocs: u32,
    /// Memory per calculation, e.g. `4GB`
    pub mem: String,
    /// Extra route keywords
    pub extra_route: String,
    /// Extra route keywords for state B, replacing `extra_route`
    pub extra_route_b: Option<String>,
    /// Text appended after the geometry
    pub footer: String,
    /// Built-in energy parser name (`dft`, `mp2`, `cis`, `td`)
    pub energy_parser: String,
    /// Energy parser for state B, replacing `energy_parser`
    pub energy_parser_b: Option<String>,
    /// Wall-clock limit per evaluation in seconds
    pub timeout_secs: Option<u64>,
    /// Evaluate A and B concurrently
    pub parallel: bool,
    /// Read the previous wavefunction from step 1 on
    pub read_later: bool,
    /// Directory for provider input/output files
    pub work_dir: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            program: "g16".to_string(),
            method: "B3LYP/6-31G*".to_string(),
            method_b: None,
            charge: 0,
            mult_a: 1,
            mult_b: 3,
            nprocs: 4,
            mem: "4GB".to_string(),
            extra_route: String::new(),
            extra_route_b: None,
            footer: String::new(),
            energy_parser: BuiltinEnergyParser::default().name().to_string(),
            energy_parser_b: None,
            timeout_secs: None,
            parallel: false,
            read_later: false,
            work_dir: PathBuf::from("JOBS"),
        }
    }
}

impl ProviderConfig {
    /// Multiplicity of `label`.
    pub fn multiplicity(&self, label: StateLabel) -> u32 {
        match label {
            StateLabel::A => self.mult_a,
            StateLabel::B => self.mult_b,
        }
    }

    /// Method string of `label`.
    pub fn method(&self, label: StateLabel) -> &str {
        match (label, &self.method_b) {
            (StateLabel::B, Some(method)) => method,
            _ => &self.method,
        }
    }

    /// Extra route keywords of `label`.
    pub fn extra_route(&self, label: StateLabel) -> &str {
        match (label, &self.extra_route_b) {
            (StateLabel::B, Some(route)) => route,
            _ => &self.extra_route,
        }
    }

    /// Built-in energy parser selected for `label`.
    pub fn energy_parser(&self, label: StateLabel) -> Result<BuiltinEnergyParser> {
        let name = match (label, &self.energy_parser_b) {
            (StateLabel::B, Some(name)) => name,
            _ => &self.energy_parser,
        };
        name.parse().map_err(MecpError::Config)
    }

    /// Provider timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Settings for the Gaussian adapter of job `job`.
    pub fn gaussian_settings(&self, job: &str) -> GaussianSettings {
        GaussianSettings {
            program: self.program.clone(),
            work_dir: self.work_dir.clone(),
            job: job.to_string(),
            charge: self.charge,
            nprocs: self.nprocs,
            mem: self.mem.clone(),
            footer: self.footer.clone(),
            read_later: self.read_later,
            timeout: self.timeout(),
        }
    }
}

/// Complete configuration of an MECP run.
///
/// # Examples
///
/// ```
/// use mecp::config::Config;
///
/// let mut config = Config::default();
/// config.provider.method = "B3LYP/def2SVP".to_string();
/// config.provider.mult_a = 2;
/// config.provider.mult_b = 4;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Job name, prefix of every output file
    pub job: String,
    /// Maximum iterations per invocation
    pub max_steps: usize,
    /// Largest allowed change of any coordinate per step, Å
    pub max_step_length: f64,
    /// Convergence thresholds
    pub thresholds: Thresholds,
    /// Effective-gradient weights
    pub factors: GradientFactors,
    /// External program settings
    pub provider: ProviderConfig,
    /// Inverse-Hessian dump in the run log
    pub show_hessian: HessianDisplay,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job: "mecp".to_string(),
            max_steps: 50,
            max_step_length: DEFAULT_MAX_STEP_LENGTH,
            thresholds: Thresholds::default(),
            factors: GradientFactors::default(),
            provider: ProviderConfig::default(),
            show_hessian: HessianDisplay::None,
        }
    }
}

impl Config {
    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// [`MecpError::Config`] describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        if self.job.trim().is_empty() {
            return Err(MecpError::Config("job name must not be empty".into()));
        }
        if self.job.contains(['/', '\\']) {
            return Err(MecpError::Config(format!(
                "job name '{}' must not contain path separators",
                self.job
            )));
        }
        if self.max_steps == 0 {
            return Err(MecpError::Config("max_steps must be at least 1".into()));
        }
        if !self.max_step_length.is_finite() || self.max_step_length <= 0.0 {
            return Err(MecpError::Config(format!(
                "max_step_length must be positive, got {}",
                self.max_step_length
            )));
        }
        self.thresholds.validate().map_err(MecpError::Config)?;
        if !self.factors.perpendicular.is_finite() || !self.factors.parallel.is_finite() {
            return Err(MecpError::Config("gradient factors must be finite".into()));
        }
        if self.provider.mult_a == 0 || self.provider.mult_b == 0 {
            return Err(MecpError::Config("multiplicities must be at least 1".into()));
        }
        for label in [StateLabel::A, StateLabel::B] {
            if self.provider.method(label).trim().is_empty() {
                return Err(MecpError::Config(format!(
                    "method of state {} must not be empty",
                    label
                )));
            }
            self.provider.energy_parser(label)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.max_step_length, 0.1);
        assert_eq!(config.provider.multiplicity(StateLabel::B), 3);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.max_steps = 0;
        assert!(matches!(config.validate(), Err(MecpError::Config(_))));

        let mut config = Config::default();
        config.provider.energy_parser = "casscf".into();
        assert!(matches!(config.validate(), Err(MecpError::Config(_))));

        let mut config = Config::default();
        config.provider.energy_parser_b = Some("casscf".into());
        assert!(matches!(config.validate(), Err(MecpError::Config(_))));

        let mut config = Config::default();
        config.provider.method_b = Some("  ".into());
        assert!(matches!(config.validate(), Err(MecpError::Config(_))));

        let mut config = Config::default();
        config.job = "runs/job".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.thresholds.max_grad = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_b_overrides_fall_back_to_a() {
        let mut provider = ProviderConfig::default();
        provider.extra_route = "scf=xqc".into();
        assert_eq!(provider.method(StateLabel::B), "B3LYP/6-31G*");
        assert_eq!(provider.extra_route(StateLabel::B), "scf=xqc");
        assert_eq!(provider.energy_parser(StateLabel::B).unwrap(), BuiltinEnergyParser::Dft);

        provider.method_b = Some("TD(nstates=3,root=1)/6-31G*".into());
        provider.extra_route_b = Some(String::new());
        provider.energy_parser_b = Some("td".into());
        assert_eq!(provider.method(StateLabel::A), "B3LYP/6-31G*");
        assert_eq!(provider.method(StateLabel::B), "TD(nstates=3,root=1)/6-31G*");
        assert_eq!(provider.extra_route(StateLabel::A), "scf=xqc");
        assert_eq!(provider.extra_route(StateLabel::B), "");
        assert_eq!(provider.energy_parser(StateLabel::A).unwrap(), BuiltinEnergyParser::Dft);
        assert_eq!(provider.energy_parser(StateLabel::B).unwrap(), BuiltinEnergyParser::Td);
    }

    #[test]
    fn test_hessian_display_parse() {
        assert_eq!("sign".parse::<HessianDisplay>(), Ok(HessianDisplay::Sign));
        assert_eq!("FULL".parse::<HessianDisplay>(), Ok(HessianDisplay::Full));
        assert_eq!("none".parse::<HessianDisplay>(), Ok(HessianDisplay::None));
        assert!("diag".parse::<HessianDisplay>().is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_everything() {
        let mut config = Config::default();
        config.provider.timeout_secs = Some(3600);
        config.show_hessian = HessianDisplay::Sign;
        config.provider.method_b = Some("CIS(root=2)/6-31G*".into());
        config.provider.energy_parser_b = Some("cis".into());
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_gaussian_settings() {
        let mut config = Config::default();
        config.provider.timeout_secs = Some(10);
        let settings = config.provider.gaussian_settings("ethylene");
        assert_eq!(settings.job, "ethylene");
        assert_eq!(settings.timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.program, "g16");
    }
}
