//! Settings files for mecp.
//!
//! Settings are read from INI files with the following precedence (highest
//! first):
//!
//! 1. An explicit file given with `--config`
//! 2. Local configuration (`./mecp.cfg`)
//! 3. User configuration (`~/.config/mecp/mecp.cfg`)
//! 4. System configuration (`/etc/mecp/mecp.cfg`)
//! 5. Built-in defaults
//!
//! Files are applied from lowest to highest precedence and each one only
//! overrides the keys it actually sets.
//!
//! # Configuration File Format
//!
//! ```ini
//! [convergence]
//! max_grad = 7.d-4
//! rms_grad = 5.d-4
//! max_chg = 4.d-3
//! rms_chg = 2.5d-3
//! energy_diff = 5.d-5
//!
//! [optimizer]
//! max_steps = 50
//! max_step_length = 0.1
//! fac_pp = 140
//! fac_p = 1
//! show_hessian = none
//!
//! [provider]
//! program = g16
//! method = B3LYP/6-31G*
//! mult_a = 1
//! mult_b = 3
//!
//! [logging]
//! level = info
//! ```

use crate::config::{Config, HessianDisplay};
use crate::energy_parser::{parse_fortran_f64, BuiltinEnergyParser};
use configparser::ini::Ini;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of settings files at every level.
pub const SETTINGS_FILE_NAME: &str = "mecp.cfg";

/// Errors that can occur while loading settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading a settings file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid value for a known key
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Log level filter (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// The level as a `log` filter; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        log::LevelFilter::from_str(self.level.trim()).unwrap_or(log::LevelFilter::Info)
    }
}

/// Everything the settings files can set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Run configuration defaults
    pub config: Config,
    /// Logging configuration
    pub logging: LoggingSettings,
}

type Section = HashMap<String, Option<String>>;

/// Loads and holds settings.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads settings with the standard precedence, plus `explicit` on top.
    ///
    /// Unreadable standard files are skipped with a warning. An explicit file
    /// that cannot be loaded is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        paths.extend(Self::get_system_config_path());
        paths.extend(Self::get_user_config_path());
        paths.push(PathBuf::from(SETTINGS_FILE_NAME));

        let (mut settings, mut source) = Self::load_from_files(&paths);

        if let Some(path) = explicit {
            let ini = Self::load_ini(path)?;
            Self::apply(&mut settings, &ini)?;
            source = format!("explicit config ({})", path.display());
        }

        debug!("Settings resolved from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Built-in defaults only.
    pub fn defaults() -> Self {
        Self {
            settings: Settings::default(),
            config_source: "built-in defaults".to_string(),
        }
    }

    /// Returns the source of the highest-precedence file that was applied.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Consumes the manager, returning the settings.
    pub fn into_settings(self) -> Settings {
        self.settings
    }

    /// Applies existing files in `paths`, lowest precedence first.
    pub fn load_from_files(paths: &[PathBuf]) -> (Settings, String) {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load_ini(path).and_then(|ini| Self::apply(&mut settings, &ini)) {
                Ok(()) => {
                    config_source = path.display().to_string();
                    debug!("Loaded configuration from: {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }

        (settings, config_source)
    }

    fn load_ini(path: &Path) -> Result<Ini, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_ini(content)
    }

    fn parse_ini(content: String) -> Result<Ini, ConfigError> {
        let mut ini = Ini::new();
        ini.read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        Ok(ini)
    }

    /// Applies the keys set in `ini` on top of `settings`.
    ///
    /// Keys are validated before anything is written, so a bad file leaves
    /// `settings` untouched.
    fn apply(settings: &mut Settings, ini: &Ini) -> Result<(), ConfigError> {
        let mut updated = settings.clone();
        let map = ini.get_map_ref();

        if let Some(section) = map.get("convergence") {
            Self::parse_convergence(section, &mut updated.config)?;
        }
        if let Some(section) = map.get("optimizer") {
            Self::parse_optimizer(section, &mut updated.config)?;
        }
        if let Some(section) = map.get("provider") {
            Self::parse_provider(section, &mut updated.config)?;
        }
        if let Some(section) = map.get("logging") {
            if let Some(level) = get(section, "level") {
                updated.logging.level = level.to_string();
            }
        }

        *settings = updated;
        Ok(())
    }

    fn parse_convergence(section: &Section, config: &mut Config) -> Result<(), ConfigError> {
        let t = &mut config.thresholds;
        for (key, slot) in [
            ("max_grad", &mut t.max_grad),
            ("rms_grad", &mut t.rms_grad),
            ("max_chg", &mut t.max_chg),
            ("rms_chg", &mut t.rms_chg),
            ("energy_diff", &mut t.energy_diff),
        ] {
            if let Some(value) = get(section, key) {
                *slot = parse_double(key, value)?;
            }
        }
        Ok(())
    }

    fn parse_optimizer(section: &Section, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(value) = get(section, "max_steps") {
            config.max_steps = parse_value("max_steps", value)?;
        }
        if let Some(value) = get(section, "max_step_length") {
            config.max_step_length = parse_double("max_step_length", value)?;
        }
        if let Some(value) = get(section, "fac_pp") {
            config.factors.perpendicular = parse_double("fac_pp", value)?;
        }
        if let Some(value) = get(section, "fac_p") {
            config.factors.parallel = parse_double("fac_p", value)?;
        }
        if let Some(value) = get(section, "show_hessian") {
            config.show_hessian = HessianDisplay::from_str(value).map_err(ConfigError::InvalidValue)?;
        }
        Ok(())
    }

    fn parse_provider(section: &Section, config: &mut Config) -> Result<(), ConfigError> {
        let p = &mut config.provider;
        for (key, slot) in [
            ("program", &mut p.program),
            ("method", &mut p.method),
            ("mem", &mut p.mem),
            ("extra_route", &mut p.extra_route),
        ] {
            if let Some(value) = get(section, key) {
                *slot = value.to_string();
            }
        }
        if let Some(value) = get(section, "footer") {
            p.footer = fs::read_to_string(value).map_err(|e| {
                ConfigError::InvalidValue(format!("cannot read footer file '{}': {}", value, e))
            })?;
        }
        if let Some(value) = get(section, "energy_parser") {
            BuiltinEnergyParser::from_str(value).map_err(ConfigError::InvalidValue)?;
            p.energy_parser = value.to_lowercase();
        }
        if let Some(value) = get(section, "energy_parser_b") {
            BuiltinEnergyParser::from_str(value).map_err(ConfigError::InvalidValue)?;
            p.energy_parser_b = Some(value.to_lowercase());
        }
        if let Some(value) = get(section, "method_b") {
            p.method_b = Some(value.to_string());
        }
        if let Some(value) = get(section, "extra_route_b") {
            p.extra_route_b = Some(value.to_string());
        }
        if let Some(value) = get(section, "charge") {
            p.charge = parse_value("charge", value)?;
        }
        if let Some(value) = get(section, "mult_a") {
            p.mult_a = parse_value("mult_a", value)?;
        }
        if let Some(value) = get(section, "mult_b") {
            p.mult_b = parse_value("mult_b", value)?;
        }
        if let Some(value) = get(section, "nprocs") {
            p.nprocs = parse_value("nprocs", value)?;
        }
        if let Some(value) = get(section, "timeout_secs") {
            let secs: u64 = parse_value("timeout_secs", value)?;
            p.timeout_secs = if secs == 0 { None } else { Some(secs) };
        }
        if let Some(value) = get(section, "parallel") {
            p.parallel = parse_bool("parallel", value)?;
        }
        if let Some(value) = get(section, "read_later") {
            p.read_later = parse_bool("read_later", value)?;
        }
        if let Some(value) = get(section, "work_dir") {
            p.work_dir = PathBuf::from(value);
        }
        Ok(())
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/mecp").join(SETTINGS_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("mecp").join(SETTINGS_FILE_NAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("mecp")
                    .join(SETTINGS_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("mecp").join(SETTINGS_FILE_NAME))
        }
    }

    /// Writes a commented settings template listing every key.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let d = Config::default();
        format!(
            r#"# mecp settings file
#
# Precedence (highest first): --config file, ./{file}, ~/.config/mecp/{file},
# /etc/mecp/{file}, built-in defaults. Command-line flags override all files.
# Floating-point values may use Fortran exponents (5.d-4).

[convergence]
# Maximum effective gradient component (Hartree/Angstrom)
max_grad = {max_grad}
# RMS effective gradient (Hartree/Angstrom)
rms_grad = {rms_grad}
# Maximum coordinate change (Angstrom)
max_chg = {max_chg}
# RMS coordinate change (Angstrom)
rms_chg = {rms_chg}
# Energy gap |E_A - E_B| (Hartree)
energy_diff = {energy_diff}

[optimizer]
# Iterations per invocation
max_steps = {max_steps}
# Largest change of any coordinate per step (Angstrom)
max_step_length = {max_step_length}
# Weight of (E_A - E_B) * (g_A - g_B) in the effective gradient (1/Hartree)
fac_pp = {fac_pp}
# Weight of the parallel gradient
fac_p = {fac_p}
# Inverse Hessian in the run log: none, full or sign
show_hessian = {show_hessian}

[provider]
program = {program}
method = {method}
charge = {charge}
mult_a = {mult_a}
mult_b = {mult_b}
nprocs = {nprocs}
mem = {mem}
# Extra route keywords, e.g. scf=xqc
extra_route =
# File whose contents are appended after the geometry (basis sets, ECPs)
# footer = footer.txt
# Energy line to read: dft, mp2, cis or td
energy_parser = {energy_parser}
# State B overrides, e.g. a TD-DFT excited state against a ground state
# method_b = TD(nstates=3,root=1)/6-31G*
# extra_route_b =
# energy_parser_b = td
# Seconds per calculation, 0 for no limit
timeout_secs = 0
# Run both states at the same time
parallel = {parallel}
# Add guess=read from step 1 on
read_later = {read_later}
work_dir = {work_dir}

[logging]
# error, warn, info, debug or trace
level = info
"#,
            file = SETTINGS_FILE_NAME,
            max_grad = d.thresholds.max_grad,
            rms_grad = d.thresholds.rms_grad,
            max_chg = d.thresholds.max_chg,
            rms_chg = d.thresholds.rms_chg,
            energy_diff = d.thresholds.energy_diff,
            max_steps = d.max_steps,
            max_step_length = d.max_step_length,
            fac_pp = d.factors.perpendicular,
            fac_p = d.factors.parallel,
            show_hessian = d.show_hessian,
            program = d.provider.program,
            method = d.provider.method,
            charge = d.provider.charge,
            mult_a = d.provider.mult_a,
            mult_b = d.provider.mult_b,
            nprocs = d.provider.nprocs,
            mem = d.provider.mem,
            energy_parser = d.provider.energy_parser,
            parallel = d.provider.parallel,
            read_later = d.provider.read_later,
            work_dir = d.provider.work_dir.display(),
        )
    }
}

fn get<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .and_then(|v| v.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_double(key: &str, value: &str) -> Result<f64, ConfigError> {
    parse_fortran_f64(value).ok_or_else(|| {
        ConfigError::InvalidValue(format!(
            "{} = '{}' is not a valid number (like 5.d-4 or 0.0005)",
            key, value
        ))
    })
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!("Invalid {}: {}", key, value))),
    }
}
