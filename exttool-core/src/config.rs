// MIT License
// Copyright 2023--present exttool developers

//! Configuration objects for backends, the server and the client.
//!
//! These are plain structs; the binaries fill them from command-line flags
//! and environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::BackendError;

/// Default server endpoint.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8888";
/// Environment variable overriding the endpoint for server and client.
pub const BIND_ENV: &str = "EXTTOOL_BIND";

/// Model families this crate can drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    /// Parameterized pair potential evaluated in-process.
    #[default]
    Pairwise,
    /// External `xtb` executable.
    Xtb,
}

impl BackendFamily {
    pub const ALL: [Self; 2] = [Self::Pairwise, Self::Xtb];

    pub const fn summary(self) -> &'static str {
        match self {
            Self::Pairwise => "in-process pair potential, built-in parameters for H, C, N, O",
            Self::Xtb => "GFN-xTB methods through an external xtb executable",
        }
    }

    /// Options (beyond the family itself) this family understands.
    pub const fn recognized_options(self) -> &'static [&'static str] {
        match self {
            Self::Pairwise => &["model", "precision", "device", "dispersion", "head"],
            Self::Xtb => &["model", "device", "executable", "extra_args"],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pairwise => "pairwise",
            Self::Xtb => "xtb",
        }
    }
}

impl FromStr for BackendFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pairwise" | "pair" => Ok(Self::Pairwise),
            "xtb" => Ok(Self::Xtb),
            other => Err(format!("unknown backend '{other}' (expected pairwise or xtb)")),
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Floating-point precision the model evaluates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Float64,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" | "single" => Ok(Self::Float32),
            "float64" | "f64" | "double" => Ok(Self::Float64),
            other => Err(format!(
                "unknown precision '{other}' (expected float32 or float64)"
            )),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        })
    }
}

/// Execution device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Let the backend pick; every backend here resolves this to the CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(Option<u32>),
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "" | "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(None)),
            other => match other.strip_prefix("cuda:") {
                Some(idx) => idx
                    .parse()
                    .map(|i| Self::Cuda(Some(i)))
                    .map_err(|_| format!("invalid CUDA device index '{idx}'")),
                None => Err(format!(
                    "unknown device '{other}' (expected auto, cpu, cuda or cuda:N)"
                )),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(None) => f.write_str("cuda"),
            Self::Cuda(Some(i)) => write!(f, "cuda:{i}"),
        }
    }
}

/// Damping function for the dispersion correction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Damping {
    /// Fermi-type "zero" damping.
    Zero,
    /// Becke-Johnson rational damping.
    #[default]
    Bj,
}

impl FromStr for Damping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "bj" => Ok(Self::Bj),
            other => Err(format!("unknown damping '{other}' (expected zero or bj)")),
        }
    }
}

/// Pairwise C6 dispersion correction added on top of the model energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispersionConfig {
    pub damping: Damping,
    /// Functional whose s6 scaling is used.
    pub functional: String,
    /// Pair cutoff in Bohr.
    pub cutoff_bohr: f64,
}

impl Default for DispersionConfig {
    fn default() -> Self {
        Self {
            damping: Damping::Bj,
            functional: "pbe".to_string(),
            cutoff_bohr: 40.0,
        }
    }
}

/// Everything needed to load one model capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub family: BackendFamily,
    /// Model selection: a parameter file for `pairwise`, a method name
    /// (`gfn2`, `gfn1`, `gfn0`, `gfnff`) for `xtb`.
    pub model: Option<String>,
    pub precision: Option<Precision>,
    pub device: Device,
    pub dispersion: Option<DispersionConfig>,
    /// Named parameter head inside a multi-head model.
    pub head: Option<String>,
    /// Path to the external executable.
    pub executable: Option<PathBuf>,
    /// Extra arguments passed verbatim to the external executable.
    pub extra_args: Vec<String>,
}

impl BackendConfig {
    pub fn new(family: BackendFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    /// Options set in this config, by name.
    pub fn set_options(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.model.is_some() {
            set.push("model");
        }
        if self.precision.is_some() {
            set.push("precision");
        }
        if self.device != Device::Auto {
            set.push("device");
        }
        if self.dispersion.is_some() {
            set.push("dispersion");
        }
        if self.head.is_some() {
            set.push("head");
        }
        if self.executable.is_some() {
            set.push("executable");
        }
        if !self.extra_args.is_empty() {
            set.push("extra_args");
        }
        set
    }

    /// Reject options the selected family does not recognize.
    pub fn validate(&self) -> Result<(), BackendError> {
        let recognized = self.family.recognized_options();
        if let Some(option) = self
            .set_options()
            .into_iter()
            .find(|o| !recognized.contains(o))
        {
            return Err(BackendError::Config(format!(
                "option '{option}' is not recognized by the {} backend",
                self.family
            )));
        }
        if let Some(disp) = &self.dispersion {
            if !(disp.cutoff_bohr > 0.0 && disp.cutoff_bohr.is_finite()) {
                return Err(BackendError::Config(format!(
                    "dispersion cutoff must be positive, got {}",
                    disp.cutoff_bohr
                )));
            }
        }
        Ok(())
    }

    /// Precision with the family default applied.
    pub fn effective_precision(&self) -> Precision {
        self.precision.unwrap_or(Precision::Float64)
    }
}

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("127.0.0.1", 8888)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid endpoint '{s}' (expected host:port)"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("invalid endpoint '{s}': empty host"));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid endpoint '{s}': bad port '{port}'"))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Calculation server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    /// Worker budget in cores; bounds concurrently admitted requests.
    pub workers: usize,
    /// How long in-flight requests may run after a termination signal.
    pub grace: Duration,
    /// Largest accepted message, in bytes.
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            workers: 1,
            grace: Duration::from_secs(30),
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

/// Calculation client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// `None` waits for the calculation however long it takes.
    pub response_timeout: Option<Duration>,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: None,
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}
