#![cfg(unix)]

use std::fs::File;

use predicates::prelude::*;

use super::common::TestEnv;

fn tagged(fixture: &str, name: &str) -> TestEnv {
  let env = TestEnv::from_fixture(fixture);
  env.build_cmd().args(["--tag", name]).assert().success();
  env
}

#[test]
fn inspect_env_prints_key_value_lines() {
  let env = tagged("timezone.stratum", "tz");

  env
    .stratum_cmd()
    .args(["inspect", "tz", "--env"])
    .assert()
    .success()
    .stdout("TZ=UTC\n");
}

#[test]
fn inspect_shows_manifest_summary() {
  let env = tagged("timezone.stratum", "tz");

  env
    .stratum_cmd()
    .args(["inspect", "tz"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Base: toolbox"))
    .stdout(predicate::str::contains("purpose=timezone"));
}

#[test]
fn inspect_unknown_image_fails() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .args(["inspect", "missing"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("missing"));
}

#[test]
fn tags_lists_tagged_images() {
  let env = tagged("timezone.stratum", "tz");

  env
    .stratum_cmd()
    .arg("tags")
    .assert()
    .success()
    .stdout(predicate::str::contains("tz"));
}

#[test]
fn export_writes_image_filesystem() {
  let env = tagged("timezone.stratum", "tz");
  let archive = env.temp.path().join("out/tz.tar.gz");

  env
    .stratum_cmd()
    .args(["export", "tz"])
    .arg(&archive)
    .assert()
    .success()
    .stdout(predicate::str::contains("Exported"));

  let unpacked = env.temp.path().join("unpacked");
  tar::Archive::new(flate2::read::GzDecoder::new(File::open(&archive).unwrap()))
    .unpack(&unpacked)
    .unwrap();
  assert_eq!(std::fs::read_to_string(unpacked.join("etc/timezone")).unwrap(), "UTC\n");
}
