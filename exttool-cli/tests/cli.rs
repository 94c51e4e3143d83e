// MIT License
// Copyright 2023--present exttool developers

//! Exit codes and files produced by the installed binaries.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const WATER: &str = "\
3

O   0.000000   0.000000   0.117300
H   0.000000   0.757200  -0.469200
H   0.000000  -0.757200  -0.469200
";

fn command(exe: &str) -> Command {
    let mut cmd = Command::new(exe);
    cmd.env_remove("EXTTOOL_BIND")
        .env_remove("EXTTOOL_BACKEND")
        .env_remove("RUST_LOG");
    cmd
}

fn exttool() -> Command {
    command(env!("CARGO_BIN_EXE_exttool"))
}

fn client() -> Command {
    command(env!("CARGO_BIN_EXE_exttool-client"))
}

fn server() -> Command {
    command(env!("CARGO_BIN_EXE_exttool-server"))
}

fn write_job(dir: &Path, descriptor: &str) -> PathBuf {
    fs::write(dir.join("water_EXT.xyz"), WATER).unwrap();
    let path = dir.join("water_EXT.extinp.tmp");
    fs::write(&path, descriptor).unwrap();
    path
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn code(output: &Output) -> Option<i32> {
    output.status.code()
}

#[test]
fn standalone_writes_result() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = write_job(dir.path(), "water_EXT.xyz\n0\n1\n1\n1\n");
    let output = exttool().arg(&descriptor).output().unwrap();
    assert_eq!(code(&output), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let text = fs::read_to_string(dir.path().join("water_EXT.engrad")).unwrap();
    assert!(text.contains("# Gradient"));
}

#[test]
fn malformed_request_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = write_job(dir.path(), "water_EXT.xyz\n0\n2\n1\n1\n");
    let output = exttool().arg(&descriptor).output().unwrap();
    assert_eq!(code(&output), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("exttool: error:"));
    assert!(!dir.path().join("water_EXT.engrad").exists());
}

#[test]
fn usage_errors_exit_sixty_four() {
    let output = exttool().output().unwrap();
    assert_eq!(code(&output), Some(64));
    let output = exttool().args(["job", "--precision", "float16"]).output().unwrap();
    assert_eq!(code(&output), Some(64));
    let output = client().output().unwrap();
    assert_eq!(code(&output), Some(64));
}

#[test]
fn help_exits_zero() {
    for mut cmd in [exttool(), client(), server()] {
        let output = cmd.arg("--help").output().unwrap();
        assert_eq!(code(&output), Some(0));
        assert!(!output.stdout.is_empty());
    }
}

#[test]
fn backend_families_are_listed() {
    for mut cmd in [exttool(), server()] {
        let output = cmd.arg("--list-backends").output().unwrap();
        assert_eq!(code(&output), Some(0));
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert!(stdout.lines().any(|l| l.starts_with("pairwise ")), "{stdout}");
        assert!(stdout.lines().any(|l| l.starts_with("xtb ")), "{stdout}");
    }
}

#[test]
fn client_without_server_exits_three() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = write_job(dir.path(), "water_EXT.xyz\n0\n1\n1\n1\n");
    let bind = format!("127.0.0.1:{}", free_port());
    let output = client()
        .arg(&descriptor)
        .args(["--bind", &bind, "--connect-timeout", "2"])
        .output()
        .unwrap();
    assert_eq!(code(&output), Some(3));
    assert!(!dir.path().join("water_EXT.engrad").exists());
}

#[test]
fn occupied_port_exits_four() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let bind = taken.local_addr().unwrap().to_string();
    let output = server().args(["--bind", &bind]).output().unwrap();
    assert_eq!(code(&output), Some(4));
}

struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn server_and_client_round_trip() {
    let bind = format!("127.0.0.1:{}", free_port());
    let _server = ServerProcess(
        server()
            .args(["--bind", &bind, "-n", "2"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    );

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        let output = client().args(["--status", "--bind", &bind]).output().unwrap();
        if code(&output) == Some(0) {
            break output;
        }
        assert!(Instant::now() < deadline, "server never came up");
        thread::sleep(Duration::from_millis(100));
    };
    let report: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(report["workers"], 2);

    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let descriptor = "water_EXT.xyz\n0\n1\n2\n1\n";
    let remote_job = write_job(remote.path(), descriptor);
    let local_job = write_job(local.path(), descriptor);

    let output = client().arg(&remote_job).args(["--bind", &bind]).output().unwrap();
    assert_eq!(code(&output), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let output = exttool().arg(&local_job).output().unwrap();
    assert_eq!(code(&output), Some(0));

    assert_eq!(
        fs::read(remote.path().join("water_EXT.engrad")).unwrap(),
        fs::read(local.path().join("water_EXT.engrad")).unwrap()
    );
}
