//! Energy extraction from provider output.
//!
//! Which line of a Gaussian log holds "the" energy depends on the method:
//! SCF for DFT/HF, `EUMP2` for MP2, `E(CIS)` / `E(TD-HF/TD-KS)` for excited
//! states. Each variant is an [`EnergyParser`]. Every parser scans the whole
//! log and the last matching line wins, so the final energy of a multi-step
//! job is reported.
//!
//! Custom parsers come in two flavors:
//!
//! - [`RegexEnergyParser`]: a pattern with one capture group plus a unit factor
//! - any closure `Fn(&str) -> Option<f64>`

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Extracts a total energy (Hartree) from provider output.
pub trait EnergyParser: Send + Sync {
    /// Returns the last energy found in `log`, or `None` if there is none.
    fn parse(&self, log: &str) -> Option<f64>;
}

impl<F> EnergyParser for F
where
    F: Fn(&str) -> Option<f64> + Send + Sync,
{
    fn parse(&self, log: &str) -> Option<f64> {
        self(log)
    }
}

/// Parses a float that may use a Fortran `D` exponent (`-0.1234D+01`).
pub fn parse_fortran_f64(token: &str) -> Option<f64> {
    let normalized = token.trim().replace(['D', 'd'], "e");
    normalized.parse().ok()
}

/// Gaussian energy lines understood out of the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuiltinEnergyParser {
    /// `SCF Done:  E(UB3LYP) =  -76.4088  ...`, 5th field
    #[default]
    Dft,
    /// `E2 = -0.2D+00 EUMP2 = -0.76D+02`, 6th field
    Mp2,
    /// `Total Energy, E(CIS) = ...`, 5th field
    Cis,
    /// `Total Energy, E(TD-HF/TD-KS) = ...`, 5th field
    Td,
}

impl BuiltinEnergyParser {
    /// Name used in settings files and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinEnergyParser::Dft => "dft",
            BuiltinEnergyParser::Mp2 => "mp2",
            BuiltinEnergyParser::Cis => "cis",
            BuiltinEnergyParser::Td => "td",
        }
    }

    fn parse_line(&self, fields: &[&str]) -> Option<f64> {
        match self {
            BuiltinEnergyParser::Dft => {
                if fields.len() > 4 && fields[0] == "SCF" && fields[1] == "Done:" {
                    return parse_fortran_f64(fields[4]);
                }
            }
            BuiltinEnergyParser::Mp2 => {
                if fields.len() > 5 && fields[0] == "E2" && fields[3] == "EUMP2" {
                    return parse_fortran_f64(fields[5]);
                }
            }
            BuiltinEnergyParser::Cis => {
                if fields.len() > 4 && fields[2] == "E(CIS)" {
                    return parse_fortran_f64(fields[4]);
                }
            }
            BuiltinEnergyParser::Td => {
                if fields.len() > 4 && fields[2] == "E(TD-HF/TD-KS)" {
                    return parse_fortran_f64(fields[4]);
                }
            }
        }
        None
    }
}

impl EnergyParser for BuiltinEnergyParser {
    fn parse(&self, log: &str) -> Option<f64> {
        let mut energy = None;
        for line in log.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(value) = self.parse_line(&fields) {
                energy = Some(value);
            }
        }
        energy
    }
}

impl FromStr for BuiltinEnergyParser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dft" | "scf" | "hf" => Ok(BuiltinEnergyParser::Dft),
            "mp2" => Ok(BuiltinEnergyParser::Mp2),
            "cis" => Ok(BuiltinEnergyParser::Cis),
            "td" | "tddft" | "td-dft" => Ok(BuiltinEnergyParser::Td),
            other => Err(format!(
                "unknown energy parser '{}' (expected dft, mp2, cis or td)",
                other
            )),
        }
    }
}

impl fmt::Display for BuiltinEnergyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

lazy_static! {
    static ref FORTRAN_FLOAT: Regex =
        Regex::new(r"^[-+]?(?:\d+\.?\d*|\.\d+)(?:[eEdD][-+]?\d+)?$").unwrap();
}

/// Regex-driven parser for programs without a built-in.
///
/// The first capture group of `pattern` must hold the number; it is multiplied
/// by `unit_factor` to obtain Hartree.
#[derive(Debug, Clone)]
pub struct RegexEnergyParser {
    pattern: Regex,
    unit_factor: f64,
}

impl RegexEnergyParser {
    /// Compiles `pattern`.
    pub fn new(pattern: &str, unit_factor: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            unit_factor,
        })
    }
}

impl EnergyParser for RegexEnergyParser {
    fn parse(&self, log: &str) -> Option<f64> {
        self.pattern
            .captures_iter(log)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|token| FORTRAN_FLOAT.is_match(token))
            .filter_map(parse_fortran_f64)
            .last()
            .map(|value| value * self.unit_factor)
    }
}
