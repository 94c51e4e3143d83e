// MIT License
// Copyright 2023--present exttool developers

//! Command-line options shared by the binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use exttool_core::config::{
    BackendConfig, BackendFamily, Damping, Device, DispersionConfig, Endpoint, Precision,
    BIND_ENV, DEFAULT_ENDPOINT,
};
use exttool_core::FormatVariant;

/// Model selection and tuning.
#[derive(Debug, Clone, Args)]
pub struct BackendArgs {
    /// Model family
    #[arg(short, long, default_value = "pairwise", env = "EXTTOOL_BACKEND")]
    pub backend: BackendFamily,

    /// Model to load: a parameter file (pairwise) or a method name such as
    /// gfn2 (xtb)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Numeric precision (float32 or float64)
    #[arg(long)]
    pub precision: Option<Precision>,

    /// Execution device: auto, cpu, cuda or cuda:N
    #[arg(long, default_value = "auto")]
    pub device: Device,

    /// Add a pairwise dispersion correction
    #[arg(long)]
    pub dispersion: bool,

    /// Dispersion damping (zero or bj)
    #[arg(long, default_value = "bj", requires = "dispersion")]
    pub damping: Damping,

    /// Functional whose dispersion scaling is used
    #[arg(long = "dispersion-xc", default_value = "pbe", requires = "dispersion")]
    pub dispersion_xc: String,

    /// Dispersion cutoff in Bohr
    #[arg(long, default_value_t = 40.0, requires = "dispersion")]
    pub dispersion_cutoff: f64,

    /// Named head of a multi-head model
    #[arg(long)]
    pub head: Option<String>,

    /// Path to the external program (xtb)
    #[arg(short, long = "exe")]
    pub executable: Option<PathBuf>,

    /// Extra arguments passed to the external program, after `--`
    #[arg(last = true)]
    pub extra_args: Vec<String>,

    /// List the model families and exit
    #[arg(long)]
    pub list_backends: bool,
}

impl BackendArgs {
    pub fn to_config(&self) -> BackendConfig {
        BackendConfig {
            family: self.backend,
            model: self.model.clone(),
            precision: self.precision,
            device: self.device,
            dispersion: self.dispersion.then(|| DispersionConfig {
                damping: self.damping,
                functional: self.dispersion_xc.clone(),
                cutoff_bohr: self.dispersion_cutoff,
            }),
            head: self.head.clone(),
            executable: self.executable.clone(),
            extra_args: self.extra_args.clone(),
        }
    }
}

/// Server endpoint, overridable through the environment.
#[derive(Debug, Clone, Args)]
pub struct EndpointArgs {
    /// Server address as host:port
    #[arg(long, default_value = DEFAULT_ENDPOINT, env = BIND_ENV)]
    pub bind: Endpoint,
}

#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    /// Layout of the .engrad file (strict or relaxed)
    #[arg(short, long, default_value = "strict")]
    pub format: FormatVariant,
}

#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// More log output on stderr (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Seconds on the command line, as a [`Duration`].
pub fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a number of seconds"))?;
    if secs.is_finite() && secs >= 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(format!("'{s}' is not a valid duration"))
    }
}
