//! CLI smoke tests for stratum.
//!
//! These tests verify that every subcommand parses its arguments and
//! returns appropriate exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Get a Command for the stratum binary with an isolated store.
fn stratum_cmd(temp: &TempDir) -> Command {
  let mut cmd = cargo_bin_cmd!("stratum");
  cmd.env("STRATUM_STORE", temp.path().join("store"));
  cmd.env("STRATUM_IMAGES", temp.path().join("images"));
  cmd
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("stratum"));
}

#[test]
fn subcommand_help_works() {
  let temp = TempDir::new().unwrap();
  for cmd in &["build", "inspect", "export", "tags", "gc", "info"] {
    stratum_cmd(&temp)
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

#[test]
fn conflicting_ref_flags_are_rejected() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .args(["build", "--strict-refs", "--lenient-refs"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn invalid_timeout_is_rejected() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .args(["build", "--timeout", "soon"])
    .assert()
    .failure();
}

// =============================================================================
// info
// =============================================================================

#[test]
fn info_reports_store_location() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .arg("info")
    .assert()
    .success()
    .stdout(predicate::str::contains("Store"))
    .stdout(predicate::str::contains("Layers: 0"));
}

#[test]
fn info_json_output() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .args(["info", "--output", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"layers\": 0"));
}

#[test]
#[serial]
fn store_flag_overrides_environment() {
  let temp = TempDir::new().unwrap();
  let flagged = temp.path().join("flagged");

  stratum_cmd(&temp)
    .arg("--store")
    .arg(&flagged)
    .arg("info")
    .assert()
    .success();

  assert!(flagged.join("layers").is_dir());
  assert!(!temp.path().join("store").exists());
}

// =============================================================================
// build
// =============================================================================

#[test]
fn build_nonexistent_recipe_fails() {
  let temp = TempDir::new().unwrap();
  stratum_cmd(&temp)
    .args(["build", "/nonexistent/path/Stratumfile"])
    .assert()
    .failure();
}

#[test]
fn build_with_malformed_build_arg_fails() {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("Stratumfile"), "FROM scratch\n").unwrap();

  stratum_cmd(&temp)
    .arg("build")
    .arg(temp.path().join("Stratumfile"))
    .args(["--build-arg", "NOVALUE"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("NAME=VALUE"));
}

#[test]
fn build_scratch_only_recipe() {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("Stratumfile"), "FROM scratch\nENV A=1\n").unwrap();

  stratum_cmd(&temp)
    .arg("build")
    .arg(temp.path().join("Stratumfile"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Built image"));
}

#[test]
fn invalid_tag_is_rejected_before_building() {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("Stratumfile"), "FROM scratch\n").unwrap();

  stratum_cmd(&temp)
    .arg("build")
    .arg(temp.path().join("Stratumfile"))
    .args(["--tag", "bad/tag"])
    .assert()
    .failure();

  assert!(!temp.path().join("store/manifests").exists());
}
