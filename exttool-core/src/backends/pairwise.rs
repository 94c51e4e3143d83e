// MIT License
// Copyright 2023--present exttool developers

//! Parameterized pair potential evaluated in-process.
//!
//! A model is a JSON document with one or more named *heads*. Each head fixes
//! a functional form and per-element parameters; pair parameters come from
//! combination rules:
//!
//! | Quantity | Rule |
//! |----------|------|
//! | well depth `D` | `sqrt(D_i * D_j)` |
//! | equilibrium distance `r_e` | `r_i + r_j` |
//! | Morse stiffness `a` | `(a_i + a_j) / 2` |
//! | dispersion `C6` | `sqrt(C6_i * C6_j)` |
//!
//! Energies are in eV and lengths in Å. The short-range term is shifted to
//! zero at the head's cutoff.
//!
//! ```json
//! {
//!   "name": "hcno-morse",
//!   "default_head": "default",
//!   "heads": {
//!     "default": {
//!       "form": "morse",
//!       "cutoff": 6.0,
//!       "elements": {
//!         "H": { "depth": 4.7446, "radius": 0.3707, "stiffness": 1.9426 }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BackendConfig, Damping, DispersionConfig, Precision};
use crate::elements;
use crate::potential::{symbol_of, ModelInput, ModelOutput, NativeUnits, Potential};
use crate::status::BackendError;
use crate::types::BOHR_IN_ANGSTROM;

/// Model name selecting the built-in parameter set.
pub const BUILTIN_MODEL: &str = "builtin";

/// Fermi steepness of the zero-damping function.
const ZERO_DAMPING_STEEPNESS: f64 = 20.0;
/// Becke-Johnson parameters (a2 in Bohr).
const BJ_A1: f64 = 0.4289;
const BJ_A2_BOHR: f64 = 4.4407;
/// Closer than this (Å) two atoms are considered to coincide.
const MIN_DISTANCE: f64 = 1e-6;

/// Short-range functional form of a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Form {
    Morse,
    LennardJones,
}

/// Per-element parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementParams {
    /// Well depth (eV).
    pub depth: f64,
    /// Covalent radius (Å); pair minima sit at `r_i + r_j`.
    pub radius: f64,
    /// Morse stiffness (1/Å). Unused by Lennard-Jones heads.
    #[serde(default = "default_stiffness")]
    pub stiffness: f64,
    /// Dispersion coefficient (eV·Å⁶).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c6: Option<f64>,
    /// Van der Waals radius (Å) used by the damping function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdw_radius: Option<f64>,
}

fn default_stiffness() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadParams {
    pub form: Form,
    /// Short-range cutoff (Å).
    pub cutoff: f64,
    pub elements: BTreeMap<String, ElementParams>,
}

/// On-disk model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_head: Option<String>,
    pub heads: BTreeMap<String, HeadParams>,
}

impl ModelFile {
    /// The parameter set used when no model file is given. Covers H, C, N, O
    /// with a Morse head (`default`) and a Lennard-Jones head (`lj`).
    pub fn builtin() -> Self {
        let elements: BTreeMap<String, ElementParams> = [
            ("H", 4.7446, 0.3707, 1.9426, 1.451, 1.001),
            ("C", 3.6, 0.77, 1.9, 18.14, 1.452),
            ("N", 3.2, 0.71, 2.1, 12.75, 1.397),
            ("O", 4.4, 0.60, 2.2, 7.255, 1.342),
        ]
        .into_iter()
        .map(|(symbol, depth, radius, stiffness, c6, vdw)| {
            (
                symbol.to_string(),
                ElementParams {
                    depth,
                    radius,
                    stiffness,
                    c6: Some(c6),
                    vdw_radius: Some(vdw),
                },
            )
        })
        .collect();
        let head = |form| HeadParams {
            form,
            cutoff: 6.0,
            elements: elements.clone(),
        };
        Self {
            name: BUILTIN_MODEL.to_string(),
            default_head: Some("default".to_string()),
            heads: BTreeMap::from([
                ("default".to_string(), head(Form::Morse)),
                ("lj".to_string(), head(Form::LennardJones)),
            ]),
        }
    }

    pub fn read(path: &Path) -> Result<Self, BackendError> {
        let model_load = |reason: String| BackendError::ModelLoad {
            model: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| model_load(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| model_load(e.to_string()))
    }

    /// Pick a head: the requested one, else the file's default, else the
    /// only head there is.
    fn select_head(&self, requested: Option<&str>) -> Result<(&str, &HeadParams), BackendError> {
        let name = match requested.or(self.default_head.as_deref()) {
            Some(name) => name,
            None if self.heads.len() == 1 => self.heads.keys().next().map_or("", String::as_str),
            None => {
                return Err(BackendError::Config(format!(
                    "model {} has several heads ({}); select one",
                    self.name,
                    self.head_names()
                )))
            }
        };
        self.heads
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| {
                BackendError::Config(format!(
                    "model {} has no head '{name}' (available: {})",
                    self.name,
                    self.head_names()
                ))
            })
    }

    fn head_names(&self) -> String {
        self.heads.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Dispersion settings resolved to Å.
#[derive(Debug, Clone, PartialEq)]
struct Dispersion {
    damping: Damping,
    s6: f64,
    cutoff: f64,
}

impl Dispersion {
    fn resolve(config: &DispersionConfig) -> Result<Self, BackendError> {
        Ok(Self {
            damping: config.damping,
            s6: s6_for(&config.functional)?,
            cutoff: config.cutoff_bohr * BOHR_IN_ANGSTROM,
        })
    }

    /// Energy and dE/dr of one pair.
    fn pair(&self, r: f64, c6: f64, r0: f64) -> (f64, f64) {
        let scale = self.s6 * c6;
        match self.damping {
            Damping::Zero => {
                let f = 1.0 / (1.0 + (-ZERO_DAMPING_STEEPNESS * (r / r0 - 1.0)).exp());
                let df = ZERO_DAMPING_STEEPNESS / r0 * f * (1.0 - f);
                let r6 = r.powi(6);
                let e = -scale * f / r6;
                let de = -scale * (df / r6 - 6.0 * f / (r6 * r));
                (e, de)
            }
            Damping::Bj => {
                let cut = BJ_A1 * r0 + BJ_A2_BOHR * BOHR_IN_ANGSTROM;
                let denom = r.powi(6) + cut.powi(6);
                let e = -scale / denom;
                let de = scale * 6.0 * r.powi(5) / (denom * denom);
                (e, de)
            }
        }
    }
}

/// Global s6 scaling of the dispersion energy per functional.
fn s6_for(functional: &str) -> Result<f64, BackendError> {
    Ok(match functional.to_ascii_lowercase().as_str() {
        "pbe" => 0.75,
        "pbe0" => 0.6,
        "b3lyp" => 1.05,
        "tpss" => 1.0,
        "b97d" | "b97-d" => 1.25,
        "blyp" => 1.2,
        "bp86" => 1.05,
        other => {
            return Err(BackendError::Config(format!(
                "no dispersion scaling known for functional '{other}'"
            )))
        }
    })
}

/// A loaded pair potential head.
#[derive(Debug, Clone)]
pub struct PairPotential {
    name: String,
    form: Form,
    cutoff: f64,
    params: BTreeMap<u32, ElementParams>,
    dispersion: Option<Dispersion>,
    precision: Precision,
}

impl PairPotential {
    pub fn load(config: &BackendConfig) -> Result<Self, BackendError> {
        super::require_cpu(config.device)?;
        let model = match config.model.as_deref() {
            None | Some(BUILTIN_MODEL) => ModelFile::builtin(),
            Some(path) => ModelFile::read(Path::new(path))?,
        };
        let (head_name, head) = model.select_head(config.head.as_deref())?;
        Self::from_head(&model.name, head_name, head, config)
    }

    fn from_head(
        model: &str,
        head_name: &str,
        head: &HeadParams,
        config: &BackendConfig,
    ) -> Result<Self, BackendError> {
        let model_load = |reason: String| BackendError::ModelLoad {
            model: model.to_string(),
            reason,
        };
        if !(head.cutoff > 0.0 && head.cutoff.is_finite()) {
            return Err(model_load(format!(
                "head {head_name}: cutoff must be positive, got {}",
                head.cutoff
            )));
        }
        let mut params = BTreeMap::new();
        for (symbol, p) in &head.elements {
            let z = elements::atomic_number(symbol)
                .ok_or_else(|| model_load(format!("unknown element '{symbol}'")))?;
            if !(p.depth >= 0.0 && p.radius > 0.0 && p.stiffness > 0.0) {
                return Err(model_load(format!("invalid parameters for {symbol}")));
            }
            params.insert(z, p.clone());
        }
        let dispersion = config.dispersion.as_ref().map(Dispersion::resolve).transpose()?;
        if dispersion.is_some() {
            let missing: Vec<&str> = head
                .elements
                .iter()
                .filter(|(_, p)| p.c6.is_none() || p.vdw_radius.is_none())
                .map(|(symbol, _)| symbol.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(BackendError::Config(format!(
                    "dispersion needs c6 and vdw_radius for every element of head \
                     {head_name}; missing for {}",
                    missing.join(", ")
                )));
            }
        }
        debug!(
            model,
            head = head_name,
            elements = params.len(),
            dispersion = dispersion.is_some(),
            "pairwise head resolved"
        );
        Ok(Self {
            name: format!("{model}:{head_name}"),
            form: head.form,
            cutoff: head.cutoff,
            params,
            dispersion,
            precision: config.effective_precision(),
        })
    }

    /// Short-range energy and dE/dr, shifted to zero at the cutoff.
    fn short_range(&self, r: f64, pi: &ElementParams, pj: &ElementParams) -> (f64, f64) {
        let depth = (pi.depth * pj.depth).sqrt();
        let re = pi.radius + pj.radius;
        match self.form {
            Form::Morse => {
                let a = 0.5 * (pi.stiffness + pj.stiffness);
                let morse = |r: f64| {
                    let e = (-a * (r - re)).exp();
                    (
                        depth * ((1.0 - e).powi(2) - 1.0),
                        2.0 * depth * a * e * (1.0 - e),
                    )
                };
                let (e, de) = morse(r);
                (e - morse(self.cutoff).0, de)
            }
            Form::LennardJones => {
                let sigma = re / 2f64.powf(1.0 / 6.0);
                let lj = |r: f64| {
                    let sr6 = (sigma / r).powi(6);
                    (
                        4.0 * depth * (sr6 * sr6 - sr6),
                        -24.0 * depth * (2.0 * sr6 * sr6 - sr6) / r,
                    )
                };
                let (e, de) = lj(r);
                (e - lj(self.cutoff).0, de)
            }
        }
    }

    fn evaluate(
        &self,
        positions: &[f64],
        numbers: &[u32],
        want_gradient: bool,
    ) -> Result<ModelOutput, BackendError> {
        let params = numbers
            .iter()
            .map(|z| {
                self.params.get(z).ok_or_else(|| BackendError::UnsupportedElement {
                    backend: self.name.clone(),
                    symbol: symbol_of(*z),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let n = numbers.len();
        let mut energy = 0.0;
        let mut gradient = vec![0.0; 3 * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = [
                    positions[3 * i] - positions[3 * j],
                    positions[3 * i + 1] - positions[3 * j + 1],
                    positions[3 * i + 2] - positions[3 * j + 2],
                ];
                let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                if r < MIN_DISTANCE {
                    return Err(BackendError::Execution(format!(
                        "atoms {} and {} coincide",
                        i + 1,
                        j + 1
                    )));
                }
                let (pi, pj) = (params[i], params[j]);
                let mut de_dr = 0.0;
                if r < self.cutoff {
                    let (e, de) = self.short_range(r, pi, pj);
                    energy += e;
                    de_dr += de;
                }
                if let Some(disp) = &self.dispersion {
                    if let (Some(ci), Some(cj), Some(vi), Some(vj)) =
                        (pi.c6, pj.c6, pi.vdw_radius, pj.vdw_radius)
                    {
                        if r < disp.cutoff {
                            let (e, de) = disp.pair(r, (ci * cj).sqrt(), vi + vj);
                            energy += e;
                            de_dr += de;
                        }
                    }
                }
                for k in 0..3 {
                    let g = de_dr * d[k] / r;
                    gradient[3 * i + k] += g;
                    gradient[3 * j + k] -= g;
                }
            }
        }
        Ok(ModelOutput {
            energy,
            gradient: want_gradient.then_some(gradient),
        })
    }
}

fn round_f32(x: f64) -> f64 {
    f64::from(x as f32)
}

impl Potential for PairPotential {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self) -> NativeUnits {
        NativeUnits::EV_ANGSTROM
    }

    fn compute(&mut self, input: &ModelInput<'_>) -> Result<ModelOutput, BackendError> {
        match self.precision {
            Precision::Float64 => {
                self.evaluate(input.positions, input.atomic_numbers, input.want_gradient)
            }
            Precision::Float32 => {
                let positions: Vec<f64> = input.positions.iter().copied().map(round_f32).collect();
                let out = self.evaluate(&positions, input.atomic_numbers, input.want_gradient)?;
                Ok(ModelOutput {
                    energy: round_f32(out.energy),
                    gradient: out
                        .gradient
                        .map(|g| g.into_iter().map(round_f32).collect()),
                })
            }
        }
    }

    fn replicate(&self) -> Option<Box<dyn Potential>> {
        Some(Box::new(self.clone()))
    }
}
