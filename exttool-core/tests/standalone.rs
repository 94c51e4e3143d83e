// MIT License
// Copyright 2023--present exttool developers

//! End-to-end runs of the standalone flow against files on disk.

use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use exttool_core::engrad::EngradFile;
use exttool_core::runner::run_standalone;
use exttool_core::{BackendConfig, BridgeError, FormatVariant, Status};

const WATER: &str = "\
3
water, comment line is ignored
O   0.000000   0.000000   0.117300
H   0.000000   0.757200  -0.469200
H   0.000000  -0.757200  -0.469200
";

struct Job {
    _dir: tempfile::TempDir,
    descriptor: PathBuf,
    result: PathBuf,
}

fn job(xyz: &str, descriptor: &str) -> Job {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("water_EXT.xyz"), xyz).unwrap();
    let path = dir.path().join("water_EXT.extinp.tmp");
    fs::write(&path, descriptor).unwrap();
    Job {
        result: dir.path().join("water_EXT.engrad"),
        descriptor: path,
        _dir: dir,
    }
}

fn run(descriptor: &Path, variant: FormatVariant) -> Result<PathBuf, BridgeError> {
    run_standalone(descriptor, &BackendConfig::default(), variant)
}

#[test]
fn energy_and_gradient_in_strict_layout() {
    let job = job(
        WATER,
        "water_EXT.xyz # xyz filename\n0 # charge\n1 # multiplicity\n2 # NCores\n1 # do gradient\n",
    );
    let written = run(&job.descriptor, FormatVariant::Strict).unwrap();
    assert_eq!(written, job.result);

    let text = fs::read_to_string(&written).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3 + 1 + 3 + 1 + 3 + 9);
    assert_eq!(&lines[0..4], &["#", "# Number of atoms", "#", "3"]);
    assert_eq!(&lines[4..7], &["#", "# Total energy [Eh]", "#"]);
    assert!(lines[9].starts_with("# Gradient [Eh/Bohr]"));

    let parsed = EngradFile::parse(&text, FormatVariant::Strict).unwrap();
    let gradient = parsed.gradient.unwrap();
    assert_eq!(gradient.len(), 9);
    let net: f64 = gradient.iter().step_by(3).sum();
    assert!(net.abs() < 1e-10);
}

#[test]
fn hydrogen_molecule_gradient_is_antisymmetric_along_the_bond() {
    let job = job(
        "2\nH2\nH 0.0 0.0 0.0\nH 0.0 0.0 0.9\n",
        "water_EXT.xyz\n0\n1\n1\n1\n",
    );
    let written = run(&job.descriptor, FormatVariant::Strict).unwrap();
    let text = fs::read_to_string(written).unwrap();
    let parsed = EngradFile::parse(&text, FormatVariant::Strict).unwrap();
    assert_eq!(parsed.natoms, 2);
    assert!(parsed.energy.is_finite() && parsed.energy < 0.0);

    let g = parsed.gradient.unwrap();
    assert_eq!(g.len(), 6);
    for i in [0, 1, 3, 4] {
        assert_abs_diff_eq!(g[i], 0.0, epsilon = 1e-12);
    }
    assert!(g[2].abs() > 1e-6);
    assert_abs_diff_eq!(g[2], -g[5], epsilon = 1e-12);
    // stretched past the minimum: the atoms are pulled together
    assert!(g[2] < 0.0);
}

#[test]
fn energy_only_relaxed_layout() {
    let job = job(WATER, "water_EXT.xyz\n0\n1\n1\n0\n");
    let written = run(&job.descriptor, FormatVariant::Relaxed).unwrap();
    let text = fs::read_to_string(written).unwrap();
    assert!(!text.contains("Gradient"));
    let parsed = EngradFile::parse(&text, FormatVariant::Relaxed).unwrap();
    assert_eq!(parsed.natoms, 3);
    assert!(parsed.gradient.is_none());
}

#[test]
fn repeated_runs_are_byte_identical() {
    let job = job(WATER, "water_EXT.xyz\n0\n1\n1\n1\n");
    run(&job.descriptor, FormatVariant::Strict).unwrap();
    let first = fs::read(&job.result).unwrap();
    run(&job.descriptor, FormatVariant::Strict).unwrap();
    assert_eq!(fs::read(&job.result).unwrap(), first);
}

#[test]
fn atom_count_mismatch_is_malformed_and_leaves_no_result() {
    let truncated = WATER.replace("H   0.000000  -0.757200  -0.469200\n", "");
    let job = job(&truncated, "water_EXT.xyz\n0\n1\n1\n1\n");
    fs::write(&job.result, "stale result from the previous step").unwrap();
    let err = run(&job.descriptor, FormatVariant::Strict).unwrap_err();
    assert_eq!(err.status(), Status::MalformedRequest);
    assert!(!job.result.exists());
}

#[test]
fn odd_electron_singlet_is_rejected() {
    let job = job(WATER, "water_EXT.xyz\n1\n1\n1\n1\n");
    let err = run(&job.descriptor, FormatVariant::Strict).unwrap_err();
    assert_eq!(err.status(), Status::MalformedRequest);
}

#[test]
fn unsupported_element_is_backend_error() {
    let xyz = "2\n\nH 0 0 0\nSi 0 0 1.5\n";
    let job = job(xyz, "water_EXT.xyz\n0\n2\n1\n1\n");
    let err = run(&job.descriptor, FormatVariant::Strict).unwrap_err();
    assert_eq!(err.status(), Status::BackendError);
    assert!(err.to_string().contains("Si"));
    assert!(!job.result.exists());
}

#[test]
fn point_charges_are_refused_by_pairwise() {
    let job = job(WATER, "water_EXT.xyz\n0\n1\n1\n1\ncharges.pc\n");
    let dir = job.descriptor.parent().unwrap();
    fs::write(dir.join("charges.pc"), "1\n-0.8 3.0 0.0 0.0\n").unwrap();
    let err = run(&job.descriptor, FormatVariant::Strict).unwrap_err();
    assert_eq!(err.status(), Status::BackendError);
    assert!(err.to_string().contains("point charges"));
}

#[test]
fn missing_descriptor_is_malformed() {
    let err = run(Path::new("/nonexistent/job.extinp.tmp"), FormatVariant::Strict).unwrap_err();
    assert_eq!(err.status(), Status::MalformedRequest);
}
