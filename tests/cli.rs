//! CLI smoke tests against the simulated backends.

use assert_cmd::Command;
use predicates::prelude::*;

fn precall() -> Command {
    let mut cmd = Command::cargo_bin("precall").unwrap();
    cmd.env_remove("PRECALL_CONFIG").env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_cli_help() {
    precall()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pre-call network and media diagnostics"));
}

#[test]
fn test_cli_version() {
    precall()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("precall"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["connectivity", "quality", "reachability", "all", "devices"] {
        precall().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_unknown_mode_rejected() {
    precall()
        .args(["--simulate", "connectivity", "--mode", "pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown traversal mode"));
}

#[test]
fn test_simulated_reachability_json() {
    precall()
        .args(["--simulate", "--json", "reachability"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\": \"reachability\""))
        .stdout(predicate::str::contains("\"result\": \"passed\""));
}

#[test]
fn test_simulated_connectivity_table() {
    precall()
        .args(["--simulate", "connectivity", "--mode", "relay"])
        .assert()
        .success()
        .stdout(predicate::str::contains("connectivity"))
        .stdout(predicate::str::contains("connected=[relay]"));
}

#[test]
fn test_simulated_quality_audio_only() {
    precall()
        .args(["--simulate", "quality", "--audio-only", "--duration", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No video track found"));
}

#[test]
fn test_devices_from_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("devices.json");
    std::fs::write(
        &path,
        r#"{
  "camera": {"devices": [{"deviceId": "cam-1", "label": "Built-in", "selected": true}], "state": "granted"},
  "mic": {"devices": [], "state": "blocked", "hasError": true},
  "speakers": []
}"#,
    )
    .unwrap();

    precall()
        .args(["--json", "devices", "--snapshot"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\": \"camera\""))
        .stdout(predicate::str::contains("cam-1"));
}

#[test]
fn test_broken_config_path_is_logged() {
    precall()
        .env("RUST_LOG", "warn")
        .args(["--simulate", "--config", "/nonexistent/precall.toml", "reachability"])
        .assert()
        .success()
        .stderr(predicate::str::contains("config file could not be loaded"));
}
