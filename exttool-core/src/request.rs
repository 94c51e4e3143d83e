// MIT License
// Copyright 2023--present exttool developers

//! Parsing of the host program's request descriptor and the files it names.
//!
//! The descriptor (`<base>.extinp.tmp`) holds one value per line, each
//! optionally followed by a `#` comment:
//!
//! ```text
//! h2_EXT.xyz   # xyz filename
//! 0            # charge
//! 1            # multiplicity
//! 4            # NCores
//! 1            # do gradient
//! h2_EXT.pc    # point charge filename (optional)
//! ```
//!
//! File names are resolved against the descriptor's own directory, not the
//! process working directory, so the same descriptor parses identically in
//! the standalone runner and the client.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::elements;
use crate::status::BridgeError;
use crate::types::{
    check_spin_parity, Atom, CalculationInput, CalculationRequest, Geometry, PointCharge,
};

/// Marker that starts a comment in every input format the host writes.
pub const COMMENT_MARKER: char = '#';

/// A fully parsed request: descriptor fields plus the geometry and point
/// charges they reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub request: CalculationRequest,
    pub geometry: Geometry,
    pub point_charges: Option<Vec<PointCharge>>,
}

impl Job {
    pub fn result_path(&self) -> PathBuf {
        self.request.result_path()
    }

    pub fn input(&self) -> CalculationInput {
        CalculationInput {
            geometry: self.geometry.clone(),
            charge: self.request.charge,
            multiplicity: self.request.multiplicity,
            ncores: self.request.ncores,
            gradient: self.request.gradient,
            point_charges: self.point_charges.clone(),
        }
    }
}

/// Parse `descriptor` and everything it references.
pub fn parse_request(descriptor: &Path) -> Result<Job, BridgeError> {
    let request = read_descriptor(descriptor)?;
    load_job(request)
}

/// Read the files named by an already-parsed descriptor and check the
/// charge/multiplicity against the geometry.
pub fn load_job(request: CalculationRequest) -> Result<Job, BridgeError> {
    let geometry = read_geometry(&request.geometry_path)?;
    check_spin_parity(&geometry, request.charge, request.multiplicity)?;
    let point_charges = request
        .point_charge_path
        .as_deref()
        .map(read_point_charges)
        .transpose()?;
    debug!(
        atoms = geometry.len(),
        charge = request.charge,
        multiplicity = request.multiplicity,
        gradient = request.gradient,
        "parsed request {}",
        request.geometry_path.display()
    );
    Ok(Job {
        request,
        geometry,
        point_charges,
    })
}

pub fn read_descriptor(path: &Path) -> Result<CalculationRequest, BridgeError> {
    let text = read_input_file(path, "request descriptor")?;
    let base_dir = path.parent().unwrap_or(Path::new(""));
    parse_descriptor(&text, base_dir)
}

/// Parse descriptor text; relative file names are joined onto `base_dir`.
pub fn parse_descriptor(text: &str, base_dir: &Path) -> Result<CalculationRequest, BridgeError> {
    let mut values = text
        .lines()
        .map(strip_comment)
        .filter(|v| !v.is_empty())
        .map(|v| v.split_whitespace().next().unwrap_or_default());

    let mut next = |field: &str| {
        values
            .next()
            .ok_or_else(|| BridgeError::malformed(format!("descriptor is missing the {field}")))
    };

    let xyz_name = next("geometry file name")?;
    if !has_extension(xyz_name, "xyz") {
        return Err(BridgeError::malformed(format!(
            "geometry file '{xyz_name}' must have the .xyz suffix"
        )));
    }
    let charge: i32 = parse_field(next("charge")?, "charge")?;
    let multiplicity: u32 = parse_field(next("multiplicity")?, "multiplicity")?;
    if multiplicity < 1 {
        return Err(BridgeError::malformed("multiplicity must be at least 1"));
    }
    let ncores: usize = parse_field(next("core count")?, "core count")?;
    if ncores < 1 {
        return Err(BridgeError::malformed("core count must be at least 1"));
    }
    let gradient = match next("gradient flag")? {
        "0" => false,
        "1" => true,
        other => {
            return Err(BridgeError::malformed(format!(
                "gradient flag must be 0 or 1, got '{other}'"
            )))
        }
    };
    let point_charge_path = values.next().map(|name| base_dir.join(name));

    Ok(CalculationRequest {
        geometry_path: base_dir.join(xyz_name),
        charge,
        multiplicity,
        ncores,
        gradient,
        point_charge_path,
    })
}

pub fn read_geometry(path: &Path) -> Result<Geometry, BridgeError> {
    let text = read_input_file(path, "geometry file")?;
    parse_xyz(&text).map_err(|e| annotate(e, path))
}

/// Parse XYZ text: atom count, comment line, then exactly that many
/// `Element X Y Z` lines (Å).
pub fn parse_xyz(text: &str) -> Result<Geometry, BridgeError> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| BridgeError::malformed("empty geometry file"))?;
    let natoms: usize = parse_field(header.split_whitespace().next().unwrap_or(""), "atom count")?;
    if natoms == 0 {
        return Err(BridgeError::malformed("geometry declares zero atoms"));
    }
    // comment line
    lines.next();

    let body = trim_trailing_blank(lines.collect());
    if body.len() != natoms {
        return Err(BridgeError::malformed(format!(
            "atom count {natoms} disagrees with {} coordinate lines",
            body.len()
        )));
    }

    let atoms = body
        .iter()
        .enumerate()
        .map(|(i, line)| parse_atom_line(line, i + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Geometry::new(atoms))
}

fn parse_atom_line(line: &str, index: usize) -> Result<Atom, BridgeError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(BridgeError::malformed(format!(
            "atom {index}: expected 'Element X Y Z', got '{}'",
            line.trim()
        )));
    }
    let symbol = elements::normalize(fields[0]).ok_or_else(|| {
        BridgeError::malformed(format!("atom {index}: unknown element '{}'", fields[0]))
    })?;
    let mut position = [0.0; 3];
    for (slot, raw) in position.iter_mut().zip(&fields[1..4]) {
        *slot = parse_coordinate(raw, index)?;
    }
    Ok(Atom {
        symbol: symbol.to_string(),
        position,
    })
}

pub fn read_point_charges(path: &Path) -> Result<Vec<PointCharge>, BridgeError> {
    let text = read_input_file(path, "point-charge file")?;
    parse_point_charges(&text).map_err(|e| annotate(e, path))
}

/// Parse an ORCA point-charge file: a count followed by `q x y z` lines.
pub fn parse_point_charges(text: &str) -> Result<Vec<PointCharge>, BridgeError> {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| BridgeError::malformed("empty point-charge file"))?;
    let count: usize = parse_field(
        header.split_whitespace().next().unwrap_or(""),
        "point-charge count",
    )?;
    let body = trim_trailing_blank(lines.collect());
    if body.len() != count {
        return Err(BridgeError::malformed(format!(
            "point-charge count {count} disagrees with {} lines",
            body.len()
        )));
    }
    body.iter()
        .enumerate()
        .map(|(i, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(BridgeError::malformed(format!(
                    "point charge {}: expected 'q X Y Z'",
                    i + 1
                )));
            }
            let charge = parse_coordinate(fields[0], i + 1)?;
            let mut position = [0.0; 3];
            for (slot, raw) in position.iter_mut().zip(&fields[1..4]) {
                *slot = parse_coordinate(raw, i + 1)?;
            }
            Ok(PointCharge { charge, position })
        })
        .collect()
}

/// Text before the first comment marker, trimmed.
pub fn strip_comment(line: &str) -> &str {
    line.split(COMMENT_MARKER).next().unwrap_or("").trim()
}

fn trim_trailing_blank(mut lines: Vec<&str>) -> Vec<&str> {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines
}

fn has_extension(name: &str, ext: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn parse_field<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T, BridgeError> {
    raw.parse()
        .map_err(|_| BridgeError::malformed(format!("invalid {field} '{raw}'")))
}

fn parse_coordinate(raw: &str, index: usize) -> Result<f64, BridgeError> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(BridgeError::malformed(format!(
            "line {index}: invalid number '{raw}'"
        ))),
    }
}

fn read_input_file(path: &Path, what: &str) -> Result<String, BridgeError> {
    fs::read_to_string(path).map_err(|e| {
        BridgeError::malformed(format!("cannot read {what} {}: {e}", path.display()))
    })
}

fn annotate(error: BridgeError, path: &Path) -> BridgeError {
    match error {
        BridgeError::MalformedRequest(msg) => {
            BridgeError::malformed(format!("{}: {msg}", path.display()))
        }
        other => other,
    }
}
