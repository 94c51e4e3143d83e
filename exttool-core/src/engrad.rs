// MIT License
// Copyright 2023--present exttool developers

//! The `.engrad` result file read back by the host program.
//!
//! Three blocks in fixed order: atom count, total energy (Eh), gradient
//! (Eh/Bohr, one value per line, `A1X, A1Y, A1Z, A2X, ...`). Two layouts
//! exist in the wild:
//!
//! - [`FormatVariant::Strict`]: older hosts skip exactly three lines before
//!   every block, so each block is preceded by `#`, a label, `#`.
//! - [`FormatVariant::Relaxed`]: newer hosts treat `#` as a comment marker
//!   anywhere; we write one label line per block.
//!
//! Files are always written through a temporary file in the destination
//! directory that is renamed into place, so a reader sees either the previous
//! complete file or the new complete file.

use std::fmt;
use std::fs;
use std::io::Write;
use std::iter::Peekable;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::strip_comment;
use crate::status::BridgeError;
use crate::types::CalculationResult;

const NATOMS_LABEL: &str = "# Number of atoms";
const ENERGY_LABEL: &str = "# Total energy [Eh]";
const GRADIENT_LABEL: &str = "# Gradient [Eh/Bohr] A1X, A1Y, A1Z, A2X, ...";

/// Layout of the comment lines around the data blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatVariant {
    #[default]
    Strict,
    Relaxed,
}

impl FromStr for FormatVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "relaxed" => Ok(Self::Relaxed),
            other => Err(format!(
                "unknown result format '{other}' (expected strict or relaxed)"
            )),
        }
    }
}

impl fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::Relaxed => "relaxed",
        })
    }
}

/// Render the file content without touching the filesystem.
pub fn render(
    result: &CalculationResult,
    natoms: usize,
    variant: FormatVariant,
) -> Result<String, BridgeError> {
    if !result.energy.is_finite() {
        return Err(BridgeError::Internal(format!(
            "refusing to write non-finite energy {}",
            result.energy
        )));
    }
    if let Some(gradient) = &result.gradient {
        if gradient.len() != 3 * natoms {
            return Err(BridgeError::Internal(format!(
                "gradient has {} components for {natoms} atoms",
                gradient.len()
            )));
        }
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(BridgeError::Internal(
                "refusing to write a non-finite gradient".into(),
            ));
        }
    }

    let mut out = String::new();
    push_label(&mut out, NATOMS_LABEL, variant);
    out.push_str(&format!("{natoms}\n"));
    push_label(&mut out, ENERGY_LABEL, variant);
    out.push_str(&scientific(result.energy, false));
    out.push('\n');
    if let Some(gradient) = &result.gradient {
        push_label(&mut out, GRADIENT_LABEL, variant);
        for g in gradient {
            out.push_str(&scientific(*g, true));
            out.push('\n');
        }
    }
    Ok(out)
}

fn push_label(out: &mut String, label: &str, variant: FormatVariant) {
    match variant {
        FormatVariant::Strict => {
            out.push_str("#\n");
            out.push_str(label);
            out.push_str("\n#\n");
        }
        FormatVariant::Relaxed => {
            out.push_str(label);
            out.push('\n');
        }
    }
}

/// `%.12e`-style formatting: 13 significant digits and a signed,
/// two-digit exponent (`-1.234567890123e-05`). With `pad_sign`, non-negative
/// values get a leading space so columns line up.
fn scientific(value: f64, pad_sign: bool) -> String {
    let raw = format!("{value:.12e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let pad = if pad_sign && !mantissa.starts_with('-') {
        " "
    } else {
        ""
    };
    format!("{pad}{mantissa}e{sign}{:02}", exponent.abs())
}

/// Atomically write `result` to `path`.
pub fn write_result(
    path: &Path,
    result: &CalculationResult,
    natoms: usize,
    variant: FormatVariant,
) -> Result<(), BridgeError> {
    let content = render(result, natoms, variant)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".engrad-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| BridgeError::io(dir, e))?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| BridgeError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| BridgeError::io(path, e.error))?;
    debug!(%variant, "wrote {}", path.display());
    Ok(())
}

/// Remove a result file left over from an earlier step, so a failed request
/// never leaves the host reading stale numbers.
pub fn remove_stale(path: &Path) -> Result<(), BridgeError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::io(path, e)),
    }
}

/// Parsed content of an `.engrad` file.
#[derive(Debug, Clone, PartialEq)]
pub struct EngradFile {
    pub natoms: usize,
    pub energy: f64,
    pub gradient: Option<Vec<f64>>,
}

impl EngradFile {
    pub fn read(path: &Path, variant: FormatVariant) -> Result<Self, BridgeError> {
        let text = fs::read_to_string(path).map_err(|e| BridgeError::io(path, e))?;
        Self::parse(&text, variant)
    }

    pub fn parse(text: &str, variant: FormatVariant) -> Result<Self, BridgeError> {
        match variant {
            FormatVariant::Strict => parse_strict(text),
            FormatVariant::Relaxed => parse_relaxed(text),
        }
    }

    pub fn into_result(self) -> CalculationResult {
        CalculationResult {
            energy: self.energy,
            gradient: self.gradient,
        }
    }
}

fn parse_strict(text: &str) -> Result<EngradFile, BridgeError> {
    let mut lines = text.lines().peekable();

    let natoms_line = strict_block(&mut lines, "atom count", 1)?
        .ok_or_else(|| BridgeError::malformed("empty result file"))?;
    let natoms: usize = parse_value(natoms_line[0])?;
    let energy_line = strict_block(&mut lines, "energy", 1)?
        .ok_or_else(|| BridgeError::malformed("missing energy block"))?;
    let energy: f64 = parse_value(energy_line[0])?;
    let gradient = strict_block(&mut lines, "gradient", gradient_len(natoms)?)?
        .map(|values| values.into_iter().map(parse_value).collect::<Result<Vec<f64>, _>>())
        .transpose()?;
    if lines.any(|l| !l.trim().is_empty()) {
        return Err(BridgeError::malformed("trailing content after gradient block"));
    }
    Ok(EngradFile {
        natoms,
        energy,
        gradient,
    })
}

/// Three comment lines followed by `count` value lines; `None` at end of input.
fn strict_block<'a, I>(
    lines: &mut Peekable<I>,
    name: &str,
    count: usize,
) -> Result<Option<Vec<&'a str>>, BridgeError>
where
    I: Iterator<Item = &'a str>,
{
    if lines.peek().is_none() {
        return Ok(None);
    }
    for _ in 0..3 {
        match lines.next() {
            Some(l) if l.trim_start().starts_with('#') => {}
            _ => {
                return Err(BridgeError::malformed(format!(
                    "{name} block must be preceded by exactly three comment lines"
                )))
            }
        }
    }
    let values: Vec<&str> = lines.by_ref().take(count).collect();
    if values.len() != count || values.iter().any(|v| v.trim_start().starts_with('#')) {
        return Err(BridgeError::malformed(format!(
            "{name} block must hold {count} value line(s)"
        )));
    }
    Ok(Some(values))
}

fn parse_relaxed(text: &str) -> Result<EngradFile, BridgeError> {
    let mut tokens = text.lines().flat_map(|l| strip_comment(l).split_whitespace());
    let natoms: usize = parse_value(
        tokens
            .next()
            .ok_or_else(|| BridgeError::malformed("empty result file"))?,
    )?;
    let energy: f64 = parse_value(
        tokens
            .next()
            .ok_or_else(|| BridgeError::malformed("missing energy block"))?,
    )?;
    let expected = gradient_len(natoms)?;
    let rest = tokens.map(parse_value).collect::<Result<Vec<f64>, _>>()?;
    let gradient = match rest.len() {
        0 => None,
        n if n == expected => Some(rest),
        n => {
            return Err(BridgeError::malformed(format!(
                "gradient has {n} values for {natoms} atoms"
            )))
        }
    };
    Ok(EngradFile {
        natoms,
        energy,
        gradient,
    })
}

fn gradient_len(natoms: usize) -> Result<usize, BridgeError> {
    natoms
        .checked_mul(3)
        .ok_or_else(|| BridgeError::malformed(format!("implausible atom count {natoms}")))
}

fn parse_value<T: FromStr>(raw: &str) -> Result<T, BridgeError> {
    raw.trim()
        .parse()
        .map_err(|_| BridgeError::malformed(format!("invalid value '{}'", raw.trim())))
}
