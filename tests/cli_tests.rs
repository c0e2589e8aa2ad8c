#![allow(deprecated)]
//! Integration tests for the comb-forensics CLI

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;

use common::{comb_rows, null_rows, Release};

fn forensics_cmd(release: &Release) -> Command {
    let mut cmd = Command::cargo_bin("comb-forensics").expect("binary not found");
    cmd.arg("--ledger-dir")
        .arg(release.ledger_dir())
        .env_remove("COMB_FORENSICS_STRICT")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn test_null_run_exits_zero_and_is_recorded() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &null_rows());
    let manifest = release.write_manifest();
    let config = release.write_config("prereg.json", &release.config_json(&["a.txt"], true));

    let output = forensics_cmd(&release)
        .arg("--json")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let record = stdout_json(&output);
    assert_eq!(record["verdict"], "NULL");
    let run_id = record["run_id"].as_str().unwrap();
    assert!(release
        .ledger_dir()
        .join("runs")
        .join(format!("{}.json", run_id))
        .is_file());

    forensics_cmd(&release)
        .args(["ledger", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(run_id).and(predicate::str::contains("NULL")));
}

#[test]
fn test_hash_mismatch_exits_nonzero_without_p_value() {
    let release = Release::new();
    let obs = release.spectrum("a.txt", "ell Dl sigma", &comb_rows(40.0, 12.0));
    let manifest = release.write_manifest();
    fs::write(&obs, "# replaced\n2 1.0 1.0\n").unwrap();
    let config = release.write_config("prereg.json", &release.config_json(&["a.txt"], true));

    let output = forensics_cmd(&release)
        .arg("--json")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("p_value"));

    let record = stdout_json(&output);
    assert_eq!(record["verdict"], "FAIL");
    assert_eq!(record["failure"]["stage"], "manifest");
    assert_eq!(record["failure"]["kind"], "integrity_error");

    // FAIL runs go into the ledger like any other.
    forensics_cmd(&release)
        .args(["ledger", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 runs"));
}

#[test]
fn test_unreadable_config_is_recorded_as_fail() {
    let release = Release::new();
    let config = release.root().join("prereg.json");
    fs::write(&config, "{ not json").unwrap();

    forensics_cmd(&release)
        .arg("run")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAIL"));

    let index = fs::read_to_string(release.ledger_dir().join("ledger.jsonl")).unwrap();
    assert_eq!(index.lines().count(), 1);
}

#[test]
fn test_flag_built_run_with_overrides() {
    let release = Release::new();
    let obs = release.spectrum("a.txt", "ell Dl sigma", &comb_rows(40.0, 12.0));

    let output = forensics_cmd(&release)
        .arg("--json")
        .arg("run")
        .arg("--obs")
        .arg(&obs)
        .arg("--model")
        .arg(release.data().join("model.txt"))
        .args(["--period", "40", "--period", "70"])
        .args(["--mc-samples", "99", "--seed", "3", "--ell-min", "30"])
        .arg("--no-strict")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let record = stdout_json(&output);
    assert_eq!(record["provenance"]["strict"], false);
    assert_eq!(record["provenance"]["mc_samples"], 99);
    assert_eq!(record["datasets"][0]["statistic"]["best_period"], 40.0);
}

#[test]
fn test_config_override_is_listed() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &null_rows());
    let manifest = release.write_manifest();
    let config_json = release.config_json(&["a.txt"], true);
    let config = release.write_config("prereg.json", &config_json);

    let output = forensics_cmd(&release)
        .arg("--json")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--manifest")
        .arg(&manifest)
        .args(["--mc-samples", "49"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let record = stdout_json(&output);
    assert_eq!(record["provenance"]["overrides"][0], "mc_samples=49");
    assert!(record["warnings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w["kind"] == "config_override"));

    let hash = forensics_cmd(&release)
        .args(["config", "hash"])
        .arg(&config)
        .output()
        .unwrap();
    let authored = String::from_utf8_lossy(&hash.stdout).trim().to_string();
    assert_eq!(authored.len(), 64);
    assert_ne!(record["provenance"]["config_hash"], authored.as_str());
}

#[test]
fn test_manifest_generate_then_verify() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &null_rows());
    let manifest = release.data().join("release.json");

    forensics_cmd(&release)
        .args(["manifest", "generate"])
        .arg(release.data())
        .arg("--output")
        .arg(&manifest)
        .assert()
        .success();

    let parsed: Value = serde_json::from_slice(&fs::read(&manifest).unwrap()).unwrap();
    assert_eq!(parsed["hash_algorithm"], "SHA-256");
    assert_eq!(parsed["files"].as_array().unwrap().len(), 2);

    forensics_cmd(&release)
        .arg("verify")
        .arg("--manifest")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 files verified"));

    fs::write(release.data().join("a.txt"), "<html>gateway timeout</html>").unwrap();
    forensics_cmd(&release)
        .arg("verify")
        .arg("--manifest")
        .arg(&manifest)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("download_failure_error"));
}

#[test]
fn test_config_validate_rejects_bad_periods() {
    let release = Release::new();
    let mut config = release.config_json(&["a.txt"], true);
    config["candidate_periods"] = serde_json::json!([1.0]);
    let path = release.write_config("bad.json", &config);

    forensics_cmd(&release)
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("INVALID"));
}

#[test]
fn test_inspect_reports_resolved_units() {
    let release = Release::new();
    let obs = release.spectrum("a.txt", "multipole value error", &null_rows());

    let output = forensics_cmd(&release)
        .arg("--json")
        .arg("inspect")
        .arg(&obs)
        .arg("--reference")
        .arg(release.data().join("model.txt"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_json(&output);
    assert_eq!(report["initial"]["method"], "magnitude_heuristic");
    assert_eq!(report["resolved"]["units"], "Dl");
    assert_eq!(report["resolved"]["method"], "chi2_precheck");
}

#[test]
fn test_ledger_show_unknown_run_is_an_error() {
    let release = Release::new();
    forensics_cmd(&release)
        .args(["ledger", "show", "no-such-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no-such-run"));
}
