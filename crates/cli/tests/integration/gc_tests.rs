use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn gc_with_empty_store_succeeds() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_dry_run_shows_what_would_be_removed() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("gc")
    .arg("--dry-run")
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}

#[test]
fn gc_json_output_is_valid() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("gc")
    .args(["-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("layers_deleted"))
    .stdout(predicate::str::contains("manifests_deleted"))
    .stdout(predicate::str::contains("deleted_paths"));
}

#[test]
#[cfg(unix)]
fn gc_keeps_tagged_images_and_drops_the_rest() {
  let env = TestEnv::from_fixture("timezone.stratum");
  env.build_cmd().args(["--tag", "keep"]).assert().success();
  let kept = env.layer_count();

  env
    .build_cmd()
    .args(["--build-arg", "TZ=Europe/Paris"])
    .assert()
    .success();
  assert!(env.layer_count() > kept);

  env.stratum_cmd().arg("gc").assert().success();

  assert_eq!(env.layer_count(), kept);
  env
    .stratum_cmd()
    .args(["inspect", "keep", "--env"])
    .assert()
    .success()
    .stdout("TZ=UTC\n");
}
