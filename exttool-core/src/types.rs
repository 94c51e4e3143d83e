// MIT License
// Copyright 2023--present exttool developers

//! Core data types for energy/gradient requests.
//!
//! ## Units
//!
//! Everything in this module uses the host program's conventions:
//!
//! | Quantity | Unit |
//! |----------|------|
//! | positions, point-charge positions | Å |
//! | energy | Hartree |
//! | gradient | Hartree/Bohr |
//!
//! Conversion to a model's native units happens only inside
//! [`Calculator`](crate::potential::Calculator).
//!
//! ## Ownership
//!
//! A [`CalculationRequest`] and its [`Geometry`] are owned by the runner or
//! client that parsed them. On the server side a [`CalculationInput`] is
//! decoded per request and dropped after its response is sent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::elements;
use crate::status::BridgeError;

/// Hartree in eV (CODATA 2018).
pub const HARTREE_IN_EV: f64 = 27.211_386_25;
/// Bohr radius in Å (CODATA 2018).
pub const BOHR_IN_ANGSTROM: f64 = 0.529_177_210_903;

/// One atom of a geometry: element symbol and Cartesian position in Å.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    pub position: [f64; 3],
}

impl Atom {
    pub fn new(symbol: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            symbol: symbol.into(),
            position: [x, y, z],
        }
    }
}

/// Ordered list of atoms. The order is preserved end-to-end: gradient
/// components come back in the same atom order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub atoms: Vec<Atom>,
}

impl Geometry {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Positions flattened atom-major as `[x1, y1, z1, x2, ...]`, in Å.
    pub fn positions(&self) -> Vec<f64> {
        self.atoms.iter().flat_map(|a| a.position).collect()
    }

    /// Atomic numbers in atom order.
    pub fn atomic_numbers(&self) -> Result<Vec<u32>, BridgeError> {
        self.atoms
            .iter()
            .map(|a| {
                elements::atomic_number(&a.symbol).ok_or_else(|| {
                    BridgeError::malformed(format!("unknown element symbol '{}'", a.symbol))
                })
            })
            .collect()
    }

    /// Number of electrons for a given net charge.
    pub fn electron_count(&self, charge: i32) -> Result<i64, BridgeError> {
        let nuclear: i64 = self.atomic_numbers()?.iter().map(|&z| i64::from(z)).sum();
        Ok(nuclear - i64::from(charge))
    }
}

/// An external point charge (charge in e, position in Å).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointCharge {
    pub charge: f64,
    pub position: [f64; 3],
}

/// A request as described by the host program's descriptor file.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRequest {
    /// Geometry file, resolved against the descriptor's directory.
    pub geometry_path: PathBuf,
    pub charge: i32,
    pub multiplicity: u32,
    pub ncores: usize,
    pub gradient: bool,
    pub point_charge_path: Option<PathBuf>,
}

impl CalculationRequest {
    /// Basename shared by the geometry and result files (`foo_EXT` for
    /// `foo_EXT.xyz`).
    pub fn basename(&self) -> String {
        self.geometry_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Where the host program expects the `.engrad` file.
    pub fn result_path(&self) -> PathBuf {
        let dir = self.geometry_path.parent().unwrap_or(Path::new("."));
        dir.join(format!("{}.engrad", self.basename()))
    }
}

/// Self-contained form of a request, with the geometry inline. This is what
/// travels over the wire and what the backend adapter consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationInput {
    pub geometry: Geometry,
    pub charge: i32,
    pub multiplicity: u32,
    pub ncores: usize,
    pub gradient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_charges: Option<Vec<PointCharge>>,
}

impl CalculationInput {
    /// Check the invariants the parser guarantees for local requests. The
    /// server runs this on every decoded request, since the peer is not
    /// necessarily our own client.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.geometry.is_empty() {
            return Err(BridgeError::malformed("geometry contains no atoms"));
        }
        if self.multiplicity < 1 {
            return Err(BridgeError::malformed("multiplicity must be at least 1"));
        }
        if self.ncores < 1 {
            return Err(BridgeError::malformed("core count must be at least 1"));
        }
        if let Some(atom) = self
            .geometry
            .atoms
            .iter()
            .find(|a| a.position.iter().any(|c| !c.is_finite()))
        {
            return Err(BridgeError::malformed(format!(
                "non-finite coordinate for atom {}",
                atom.symbol
            )));
        }
        check_spin_parity(&self.geometry, self.charge, self.multiplicity)
    }
}

/// Electron count and multiplicity must agree: `n_e − (mult − 1)` has to be
/// a non-negative even number.
pub fn check_spin_parity(
    geometry: &Geometry,
    charge: i32,
    multiplicity: u32,
) -> Result<(), BridgeError> {
    let electrons = geometry.electron_count(charge)?;
    if electrons < 0 {
        return Err(BridgeError::malformed(format!(
            "charge {charge} leaves a negative electron count ({electrons})"
        )));
    }
    let unpaired = i64::from(multiplicity) - 1;
    if unpaired > electrons || (electrons - unpaired) % 2 != 0 {
        return Err(BridgeError::malformed(format!(
            "multiplicity {multiplicity} is inconsistent with {electrons} electrons (charge {charge})"
        )));
    }
    Ok(())
}

/// Energy (Hartree) and optional gradient (Hartree/Bohr, atom-major).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub energy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient: Option<Vec<f64>>,
}

impl CalculationResult {
    /// Verify the result is consistent with `n_atoms` and the gradient flag.
    pub fn check(&self, n_atoms: usize, want_gradient: bool) -> Result<(), BridgeError> {
        if !self.energy.is_finite() {
            return Err(BridgeError::Protocol(format!(
                "non-finite energy {}",
                self.energy
            )));
        }
        match (&self.gradient, want_gradient) {
            (Some(g), true) if g.len() != 3 * n_atoms => Err(BridgeError::Protocol(format!(
                "gradient size mismatch: expected {}, got {}",
                3 * n_atoms,
                g.len()
            ))),
            (None, true) => Err(BridgeError::Protocol("gradient missing".into())),
            _ => Ok(()),
        }
    }
}
