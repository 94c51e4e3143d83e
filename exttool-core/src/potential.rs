// MIT License
// Copyright 2023--present exttool developers

//! Model capabilities and the adapter that feeds them.
//!
//! This module defines [`Potential`], the single interface every model
//! capability implements, and [`Calculator`], the adapter that sits between
//! host-program conventions and a model's native representation.
//!
//! **How it Works**
//!
//! 1. A backend (see [`crate::backends`]) loads a model and boxes it as a
//!    `dyn Potential`.
//! 2. [`Calculator::compute`] maps element symbols to atomic numbers,
//!    converts Å positions into the model's [`NativeUnits`], and calls
//!    [`Potential::compute`].
//! 3. The returned energy and gradient are validated and converted back to
//!    Hartree and Hartree/Bohr.
//!
//! **Concurrency Contract**
//!
//! - `compute` takes `&mut self`: a model may keep mutable cached state, and
//!   whoever owns the [`Calculator`] is its only mutator.
//! - A model that can safely run several evaluations at once says so by
//!   returning a replica from [`Potential::replicate`]. Replicas share no
//!   mutable state with the original and are never counted as reloads.

use crate::elements;
use crate::status::{BackendError, BridgeError};
use crate::types::{
    CalculationInput, CalculationResult, PointCharge, BOHR_IN_ANGSTROM, HARTREE_IN_EV,
};

/// Length unit a model expects positions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Angstrom,
    Bohr,
}

/// Energy unit a model reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyUnit {
    ElectronVolt,
    Hartree,
}

/// Native units of a model. Gradients are reported in `energy / length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeUnits {
    pub length: LengthUnit,
    pub energy: EnergyUnit,
}

impl NativeUnits {
    /// eV and Å, the usual convention of learned potentials.
    pub const EV_ANGSTROM: Self = Self {
        length: LengthUnit::Angstrom,
        energy: EnergyUnit::ElectronVolt,
    };
    /// Atomic units.
    pub const HARTREE_BOHR: Self = Self {
        length: LengthUnit::Bohr,
        energy: EnergyUnit::Hartree,
    };

    /// Native length units in one Å.
    pub fn per_angstrom(self) -> f64 {
        match self.length {
            LengthUnit::Angstrom => 1.0,
            LengthUnit::Bohr => 1.0 / BOHR_IN_ANGSTROM,
        }
    }

    /// Native length units in one Bohr.
    pub fn per_bohr(self) -> f64 {
        self.per_angstrom() * BOHR_IN_ANGSTROM
    }

    /// Hartree in one native energy unit.
    pub fn hartree_per_unit(self) -> f64 {
        match self.energy {
            EnergyUnit::ElectronVolt => 1.0 / HARTREE_IN_EV,
            EnergyUnit::Hartree => 1.0,
        }
    }
}

/// Input handed to a model, already in its native units.
#[derive(Debug, Clone)]
pub struct ModelInput<'a> {
    /// Positions, atom-major `[x1, y1, z1, x2, ...]`.
    pub positions: &'a [f64],
    pub atomic_numbers: &'a [u32],
    pub charge: i32,
    pub multiplicity: u32,
    pub want_gradient: bool,
    /// Cores the caller grants this evaluation.
    pub threads: usize,
    /// External point charges, positions in native length units.
    pub point_charges: &'a [PointCharge],
}

impl ModelInput<'_> {
    pub fn n_atoms(&self) -> usize {
        self.atomic_numbers.len()
    }
}

/// Raw model output in native units.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub energy: f64,
    /// dE/dx, atom-major. May be `None` when no gradient was asked for.
    pub gradient: Option<Vec<f64>>,
}

/// A loaded model capability.
pub trait Potential: Send {
    /// Short identifier used in logs and status reports.
    fn name(&self) -> &str;

    fn units(&self) -> NativeUnits;

    /// Whether [`ModelInput::point_charges`] is honored. Requests with point
    /// charges are rejected for models that return `false`.
    fn supports_point_charges(&self) -> bool {
        false
    }

    fn compute(&mut self, input: &ModelInput<'_>) -> Result<ModelOutput, BackendError>;

    /// An independent instance that may run concurrently with `self`.
    ///
    /// The default (`None`) declares the model unsafe for parallel
    /// invocation, so all calls are serialized.
    fn replicate(&self) -> Option<Box<dyn Potential>> {
        None
    }
}

/// Adapter between host-program conventions and a [`Potential`].
pub struct Calculator {
    potential: Box<dyn Potential>,
}

impl std::fmt::Debug for Calculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calculator")
            .field("potential", &self.potential.name())
            .finish()
    }
}

impl Calculator {
    pub fn new(potential: Box<dyn Potential>) -> Self {
        Self { potential }
    }

    pub fn name(&self) -> &str {
        self.potential.name()
    }

    /// A calculator around a replica of the model, if the model allows it.
    pub fn replicate(&self) -> Option<Self> {
        self.potential.replicate().map(Self::new)
    }

    /// Evaluate energy (Hartree) and, if requested, gradient (Hartree/Bohr).
    pub fn compute(&mut self, input: &CalculationInput) -> Result<CalculationResult, BridgeError> {
        let atomic_numbers = input.geometry.atomic_numbers()?;
        let n_atoms = atomic_numbers.len();
        let units = self.potential.units();
        let to_native = units.per_angstrom();

        let point_charges: Vec<PointCharge> = input
            .point_charges
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|pc| PointCharge {
                charge: pc.charge,
                position: pc.position.map(|c| c * to_native),
            })
            .collect();
        if !point_charges.is_empty() && !self.potential.supports_point_charges() {
            return Err(BackendError::Unsupported(format!(
                "backend {} does not support point charges",
                self.name()
            ))
            .into());
        }

        let positions: Vec<f64> = input
            .geometry
            .positions()
            .into_iter()
            .map(|x| x * to_native)
            .collect();

        let output = self.potential.compute(&ModelInput {
            positions: &positions,
            atomic_numbers: &atomic_numbers,
            charge: input.charge,
            multiplicity: input.multiplicity,
            want_gradient: input.gradient,
            threads: input.ncores,
            point_charges: &point_charges,
        })?;

        if !output.energy.is_finite() {
            return Err(BackendError::InvalidOutput(format!(
                "non-finite energy {}",
                output.energy
            ))
            .into());
        }
        let gradient = if input.gradient {
            let native = output.gradient.ok_or_else(|| {
                BackendError::InvalidOutput("gradient requested but not returned".into())
            })?;
            if native.len() != 3 * n_atoms {
                return Err(BackendError::InvalidOutput(format!(
                    "gradient size mismatch: expected {}, got {}",
                    3 * n_atoms,
                    native.len()
                ))
                .into());
            }
            if native.iter().any(|g| !g.is_finite()) {
                return Err(BackendError::InvalidOutput("non-finite gradient".into()).into());
            }
            let factor = units.hartree_per_unit() * units.per_bohr();
            Some(native.into_iter().map(|g| g * factor).collect())
        } else {
            None
        };

        Ok(CalculationResult {
            energy: output.energy * units.hartree_per_unit(),
            gradient,
        })
    }
}

/// Symbol for an atomic number, for error messages.
pub(crate) fn symbol_of(z: u32) -> String {
    elements::symbol(z)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Z={z}"))
}
