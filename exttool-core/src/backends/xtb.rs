// MIT License
// Copyright 2023--present exttool developers

//! Driver for an external `xtb` executable.
//!
//! Every evaluation runs in its own temporary directory, so concurrent
//! replicas never share files. The geometry is written as `<ns>.xyz`, the
//! program is run as
//!
//! ```text
//! xtb <ns>.xyz -c <charge> -P <threads> --namespace <ns> [-u <nue>] [--grad] [method] [extra...]
//! ```
//!
//! and the results are read from its standard output (`TOTAL ENERGY`) and
//! from `<ns>.gradient` (`$grad` block).

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::elements;
use crate::potential::{symbol_of, ModelInput, ModelOutput, NativeUnits, Potential};
use crate::status::BackendError;
use crate::types::BOHR_IN_ANGSTROM;

/// Names looked up on `PATH` when no executable is configured.
pub const PROGRAM_NAMES: [&str; 2] = ["xtb", "otools_xtb"];
/// Namespace passed to xtb; fixes the names of the files it writes.
const NAMESPACE: &str = "exttool";
/// Lines of program output quoted in an execution error.
const OUTPUT_TAIL: usize = 20;

/// Tight-binding method flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Gfn2,
    Gfn1,
    Gfn0,
    GfnFf,
}

impl Method {
    fn parse(name: &str) -> Result<Self, BackendError> {
        match name.to_ascii_lowercase().replace('-', "").as_str() {
            "gfn2" | "gfn2xtb" => Ok(Self::Gfn2),
            "gfn1" | "gfn1xtb" => Ok(Self::Gfn1),
            "gfn0" | "gfn0xtb" => Ok(Self::Gfn0),
            "gfnff" => Ok(Self::GfnFf),
            _ => Err(BackendError::ModelLoad {
                model: name.to_string(),
                reason: "expected one of gfn2, gfn1, gfn0, gfnff".into(),
            }),
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            Self::Gfn2 => &["--gfn", "2"],
            Self::Gfn1 => &["--gfn", "1"],
            Self::Gfn0 => &["--gfn", "0"],
            Self::GfnFf => &["--gfnff"],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gfn2 => "gfn2",
            Self::Gfn1 => "gfn1",
            Self::Gfn0 => "gfn0",
            Self::GfnFf => "gfnff",
        }
    }
}

#[derive(Debug, Clone)]
pub struct XtbPotential {
    executable: PathBuf,
    method: Method,
    extra_args: Vec<String>,
    name: String,
}

impl XtbPotential {
    pub fn load(config: &BackendConfig) -> Result<Self, BackendError> {
        super::require_cpu(config.device)?;
        let method = config
            .model
            .as_deref()
            .map(Method::parse)
            .transpose()?
            .unwrap_or(Method::Gfn2);
        let executable = match &config.executable {
            Some(path) => check_executable(path)?,
            None => locate().ok_or_else(|| BackendError::ModelLoad {
                model: "xtb".into(),
                reason: format!(
                    "no executable found on PATH (looked for {})",
                    PROGRAM_NAMES.join(", ")
                ),
            })?,
        };
        debug!(executable = %executable.display(), method = method.name(), "using xtb");
        Ok(Self {
            executable,
            method,
            extra_args: config.extra_args.clone(),
            name: format!("xtb:{}", method.name()),
        })
    }

    fn command_args(&self, input: &ModelInput<'_>) -> Vec<String> {
        let mut args = vec![
            format!("{NAMESPACE}.xyz"),
            "-c".to_string(),
            input.charge.to_string(),
            "-P".to_string(),
            input.threads.max(1).to_string(),
            "--namespace".to_string(),
            NAMESPACE.to_string(),
        ];
        let unpaired = input.multiplicity.saturating_sub(1);
        if unpaired > 0 {
            args.push("-u".to_string());
            args.push(unpaired.to_string());
        }
        if input.want_gradient {
            args.push("--grad".to_string());
        }
        args.extend(self.method.args().iter().map(|s| s.to_string()));
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Potential for XtbPotential {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self) -> NativeUnits {
        NativeUnits::HARTREE_BOHR
    }

    fn compute(&mut self, input: &ModelInput<'_>) -> Result<ModelOutput, BackendError> {
        let execution = |e: std::io::Error| BackendError::Execution(e.to_string());
        let workdir = tempfile::Builder::new()
            .prefix("exttool-xtb-")
            .tempdir()
            .map_err(execution)?;

        let xyz = render_xyz(input)?;
        fs::write(workdir.path().join(format!("{NAMESPACE}.xyz")), xyz).map_err(execution)?;

        let args = self.command_args(input);
        debug!(dir = %workdir.path().display(), ?args, "running xtb");
        let output = Command::new(&self.executable)
            .args(&args)
            .current_dir(workdir.path())
            .env("OMP_NUM_THREADS", input.threads.max(1).to_string())
            .output()
            .map_err(|e| {
                BackendError::Execution(format!(
                    "failed to start {}: {e}",
                    self.executable.display()
                ))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "xtb failed");
            return Err(BackendError::Execution(format!(
                "xtb exited with {}:\n{}{}",
                output.status,
                tail(&stdout, OUTPUT_TAIL),
                tail(&stderr, OUTPUT_TAIL)
            )));
        }

        debug!("xtb output:\n{}", stdout.trim_end());
        let energy = parse_energy(&stdout)?;
        let gradient = if input.want_gradient {
            let path = workdir.path().join(format!("{NAMESPACE}.gradient"));
            let text = fs::read_to_string(&path).map_err(|e| {
                BackendError::InvalidOutput(format!("cannot read {}: {e}", path.display()))
            })?;
            Some(parse_gradient(&text, input.n_atoms())?)
        } else {
            None
        };
        Ok(ModelOutput { energy, gradient })
    }

    fn replicate(&self) -> Option<Box<dyn Potential>> {
        Some(Box::new(self.clone()))
    }
}

/// XYZ text in Å from native (Bohr) positions.
fn render_xyz(input: &ModelInput<'_>) -> Result<String, BackendError> {
    let mut out = format!("{}\n\n", input.n_atoms());
    for (z, xyz) in input.atomic_numbers.iter().zip(input.positions.chunks_exact(3)) {
        let symbol = elements::symbol(*z).ok_or_else(|| BackendError::UnsupportedElement {
            backend: "xtb".into(),
            symbol: symbol_of(*z),
        })?;
        let _ = writeln!(
            out,
            "{symbol:<2} {:20.12} {:20.12} {:20.12}",
            xyz[0] * BOHR_IN_ANGSTROM,
            xyz[1] * BOHR_IN_ANGSTROM,
            xyz[2] * BOHR_IN_ANGSTROM
        );
    }
    Ok(out)
}

/// Energy from the `| TOTAL ENERGY  -5.07054 Eh |` summary line.
pub fn parse_energy(stdout: &str) -> Result<f64, BackendError> {
    let line = stdout
        .lines()
        .find(|l| l.contains("TOTAL ENERGY"))
        .ok_or_else(|| BackendError::InvalidOutput("TOTAL ENERGY not found in xtb output".into()))?;
    line.split_whitespace()
        .skip_while(|t| *t != "ENERGY")
        .nth(1)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| {
            BackendError::InvalidOutput(format!("cannot read energy from '{}'", line.trim()))
        })
}

/// Gradient from a Turbomole-style `$grad` block: `n_atoms` coordinate
/// lines (4 fields) and `n_atoms` gradient lines (3 fields).
pub fn parse_gradient(text: &str, n_atoms: usize) -> Result<Vec<f64>, BackendError> {
    let invalid = |msg: String| BackendError::InvalidOutput(msg);
    let mut lines = text
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("$grad"));
    if lines.next().is_none() {
        return Err(invalid("no $grad block in gradient file".into()));
    }
    let mut atoms = 0;
    let mut gradient = Vec::with_capacity(3 * n_atoms);
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.len() {
            4 => atoms += 1,
            3 => {
                for f in fields {
                    let value = f
                        .replace(['D', 'd'], "E")
                        .parse::<f64>()
                        .map_err(|_| invalid(format!("bad gradient value '{f}'")))?;
                    gradient.push(value);
                }
            }
            _ if line.trim_start().starts_with("$end") => break,
            _ => {}
        }
    }
    if atoms != n_atoms {
        return Err(invalid(format!(
            "gradient file lists {atoms} atoms, expected {n_atoms}"
        )));
    }
    if gradient.len() != 3 * n_atoms {
        return Err(invalid(format!(
            "gradient file has {} entries, expected {}",
            gradient.len(),
            3 * n_atoms
        )));
    }
    Ok(gradient)
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| format!("{l}\n")).collect()
}

fn check_executable(path: &Path) -> Result<PathBuf, BackendError> {
    if is_executable(path) {
        Ok(path.to_path_buf())
    } else {
        Err(BackendError::ModelLoad {
            model: "xtb".into(),
            reason: format!("{} is not an executable file", path.display()),
        })
    }
}

/// The executable [`XtbPotential::load`] would pick without `--exe`.
pub fn locate() -> Option<PathBuf> {
    find_on_path(&PROGRAM_NAMES)
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
