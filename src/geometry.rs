//! Core geometry and per-state data structures.
//!
//! This module provides the fundamental data types for an MECP search:
//!
//! - [`Geometry`]: ordered atoms (atomic numbers) with Cartesian coordinates
//! - [`EnergyPair`] / [`GradientPair`]: the two states' results at one geometry
//!
//! All coordinates are in Ångström and gradients in Hartree/Ångström. Raw
//! quantum-chemistry forces (Hartree/Bohr, force sign convention) are turned
//! into gradients with [`forces_to_gradient`].

use crate::error::{MecpError, Result};
use nalgebra::DVector;
use std::fmt;
use std::fs;
use std::path::Path;

/// Bohr radius in Ångström, as used by the reference MECP programs.
pub const BOHR_TO_ANGSTROM: f64 = 0.529177;

/// Element symbols indexed by atomic number minus one (H..Og).
const ELEMENT_SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Returns the element symbol for an atomic number in `1..=118`.
pub fn element_symbol(atomic_number: u8) -> Option<&'static str> {
    match atomic_number {
        1..=118 => Some(ELEMENT_SYMBOLS[atomic_number as usize - 1]),
        _ => None,
    }
}

/// Parses an element given either as a symbol (case-insensitive) or as an
/// atomic number.
pub fn parse_element(token: &str) -> Option<u8> {
    if let Ok(number) = token.parse::<u8>() {
        return element_symbol(number).map(|_| number);
    }
    ELEMENT_SYMBOLS
        .iter()
        .position(|s| s.eq_ignore_ascii_case(token))
        .map(|idx| (idx + 1) as u8)
}

/// Converts provider forces in Hartree/Bohr into a gradient in Hartree/Ångström.
///
/// ```text
/// g = -F / 0.529177
/// ```
pub fn forces_to_gradient(forces: &DVector<f64>) -> DVector<f64> {
    -forces / BOHR_TO_ANGSTROM
}

/// Represents a molecular geometry with atomic numbers and Cartesian coordinates.
///
/// Coordinates are stored flat as `[x1, y1, z1, x2, y2, z2, ...]` in a
/// `DVector<f64>` so that the optimizer works directly on the 3N-dimensional
/// state vector. The atom list never changes during an optimization; each
/// step produces a new `Geometry` through [`Geometry::with_coords`].
///
/// # Examples
///
/// ```
/// use mecp::geometry::Geometry;
///
/// let water = Geometry::new(
///     vec![8, 1, 1],
///     vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
/// )
/// .unwrap();
/// assert_eq!(water.num_atoms(), 3);
/// assert_eq!(water.symbol(0), "O");
/// assert_eq!(water.get_atom_coords(1), [0.757, 0.586, 0.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Atomic number of each atom, in input order
    pub atomic_numbers: Vec<u8>,
    /// Flattened Cartesian coordinates in Ångström
    pub coords: DVector<f64>,
}

impl Geometry {
    /// Creates a geometry from atomic numbers and a flat coordinate list.
    ///
    /// # Errors
    ///
    /// - [`MecpError::InvalidGeometry`] for an empty atom list or an atomic
    ///   number outside `1..=118`
    /// - [`MecpError::DimensionMismatch`] if `coords.len() != 3 * atoms`
    pub fn new(atomic_numbers: Vec<u8>, coords: Vec<f64>) -> Result<Self> {
        if atomic_numbers.is_empty() {
            return Err(MecpError::InvalidGeometry("geometry has no atoms".into()));
        }
        if let Some(bad) = atomic_numbers.iter().find(|&&z| element_symbol(z).is_none()) {
            return Err(MecpError::InvalidGeometry(format!(
                "atomic number {} is outside 1..=118",
                bad
            )));
        }
        if coords.len() != atomic_numbers.len() * 3 {
            return Err(MecpError::DimensionMismatch {
                expected: atomic_numbers.len() * 3,
                found: coords.len(),
            });
        }
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(MecpError::InvalidGeometry("non-finite coordinate".into()));
        }
        Ok(Self {
            atomic_numbers,
            coords: DVector::from_vec(coords),
        })
    }

    /// Number of atoms.
    pub fn num_atoms(&self) -> usize {
        self.atomic_numbers.len()
    }

    /// Degrees of freedom, `3 * num_atoms`.
    pub fn dof(&self) -> usize {
        self.coords.len()
    }

    /// Element symbol of atom `atom_idx`.
    pub fn symbol(&self, atom_idx: usize) -> &'static str {
        element_symbol(self.atomic_numbers[atom_idx]).unwrap_or("X")
    }

    /// Cartesian coordinates `[x, y, z]` of atom `atom_idx` in Ångström.
    pub fn get_atom_coords(&self, atom_idx: usize) -> [f64; 3] {
        let i = atom_idx * 3;
        [self.coords[i], self.coords[i + 1], self.coords[i + 2]]
    }

    /// Returns a new geometry with the same atoms at new positions.
    pub fn with_coords(&self, coords: DVector<f64>) -> Result<Self> {
        if coords.len() != self.dof() {
            return Err(MecpError::DimensionMismatch {
                expected: self.dof(),
                found: coords.len(),
            });
        }
        Ok(Self {
            atomic_numbers: self.atomic_numbers.clone(),
            coords,
        })
    }

    /// Parses a geometry from XYZ text.
    ///
    /// Both the standard XYZ layout (atom count, comment line, atom lines)
    /// and bare `element x y z` lines are accepted. Elements may be symbols or
    /// atomic numbers; blank lines and lines starting with `!` or `#` are
    /// skipped.
    pub fn from_xyz_str(content: &str) -> Result<Self> {
        let mut lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('!') && !l.starts_with('#'))
            .collect();

        let declared = match lines.first() {
            Some(first) if first.split_whitespace().count() == 1 => {
                let count = first.parse::<usize>().map_err(|_| {
                    MecpError::InvalidGeometry(format!("invalid atom count line '{}'", first))
                })?;
                lines.remove(0);
                // Comment line is optional when blank (already filtered).
                if lines.len() > count {
                    lines.remove(0);
                }
                Some(count)
            }
            _ => None,
        };

        let mut atomic_numbers = Vec::new();
        let mut coords = Vec::new();
        for (lineno, line) in lines.iter().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(MecpError::InvalidGeometry(format!(
                    "atom line {} has fewer than four fields: '{}'",
                    lineno + 1,
                    line
                )));
            }
            let z = parse_element(fields[0]).ok_or_else(|| {
                MecpError::InvalidGeometry(format!("unknown element '{}'", fields[0]))
            })?;
            atomic_numbers.push(z);
            for field in &fields[1..4] {
                let value = field.replace(['d', 'D'], "e").parse::<f64>().map_err(|_| {
                    MecpError::InvalidGeometry(format!("invalid coordinate '{}'", field))
                })?;
                coords.push(value);
            }
        }

        if let Some(count) = declared {
            if count != atomic_numbers.len() {
                return Err(MecpError::InvalidGeometry(format!(
                    "header declares {} atoms but {} were read",
                    count,
                    atomic_numbers.len()
                )));
            }
        }

        Self::new(atomic_numbers, coords)
    }

    /// Reads a geometry file (see [`Geometry::from_xyz_str`]).
    pub fn from_xyz_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_xyz_str(&content)
    }

    /// Renders the geometry as XYZ text with an optional comment line.
    pub fn to_xyz_string(&self, comment: &str) -> String {
        let mut content = format!("{}\n{}\n", self.num_atoms(), comment);
        for i in 0..self.num_atoms() {
            let c = self.get_atom_coords(i);
            content.push_str(&format!(
                "{:<2}  {:>14.8}  {:>14.8}  {:>14.8}\n",
                self.symbol(i),
                c[0],
                c[1],
                c[2]
            ));
        }
        content
    }

    /// Writes the geometry to an XYZ file.
    pub fn write_xyz(&self, path: &Path, comment: &str) -> std::io::Result<()> {
        fs::write(path, self.to_xyz_string(comment))
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.num_atoms() {
            let c = self.get_atom_coords(i);
            writeln!(
                f,
                "{:>3} {:<2} {:>15.7} {:>15.7} {:>15.7}",
                self.atomic_numbers[i],
                self.symbol(i),
                c[0],
                c[1],
                c[2]
            )?;
        }
        Ok(())
    }
}

/// Potential energies of states A and B at one geometry, in Hartree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyPair {
    /// Energy of state A
    pub a: f64,
    /// Energy of state B
    pub b: f64,
}

impl EnergyPair {
    /// Signed difference `E_A - E_B`.
    pub fn delta(&self) -> f64 {
        self.a - self.b
    }
}

/// Gradients of states A and B at one geometry, in Hartree/Ångström.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientPair {
    /// Gradient of state A
    pub a: DVector<f64>,
    /// Gradient of state B
    pub b: DVector<f64>,
}
