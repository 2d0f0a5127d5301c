#![cfg(unix)]

use predicates::prelude::*;
use serde_json::Value;

use super::common::TestEnv;

/// Run a JSON-mode build and return the parsed summary.
fn build_json(env: &TestEnv, extra: &[&str]) -> Value {
  let output = env.build_cmd().args(["-o", "json"]).args(extra).output().unwrap();
  assert!(
    output.status.success(),
    "build failed: {}",
    String::from_utf8_lossy(&output.stderr)
  );
  serde_json::from_slice(&output.stdout).unwrap()
}

fn rootfs_file(env: &TestEnv, summary: &Value, rel: &str) -> String {
  let rootfs = summary["manifest"]["rootfs"].as_str().unwrap();
  let path = env.store_path().join("layers").join(rootfs).join("rootfs").join(rel);
  std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}

fn layer_ids(summary: &Value) -> Vec<String> {
  summary["steps"]
    .as_array()
    .unwrap()
    .iter()
    .map(|s| s["layer"].as_str().unwrap().to_string())
    .collect()
}

#[test]
fn build_uses_arg_default() {
  let env = TestEnv::from_fixture("timezone.stratum");

  let summary = build_json(&env, &[]);

  assert_eq!(rootfs_file(&env, &summary, "etc/timezone"), "UTC\n");
  assert_eq!(summary["manifest"]["env"]["TZ"], "UTC");
  assert_eq!(summary["manifest"]["labels"]["purpose"], "timezone");
}

#[test]
fn build_arg_override_reaches_run() {
  let env = TestEnv::from_fixture("timezone.stratum");

  let summary = build_json(&env, &["--build-arg", "TZ=America/New_York"]);

  assert_eq!(rootfs_file(&env, &summary, "etc/timezone"), "America/New_York\n");
}

#[test]
fn rebuild_is_fully_cached_and_deterministic() {
  let env = TestEnv::from_fixture("timezone.stratum");

  let first = build_json(&env, &[]);
  let second = build_json(&env, &[]);

  assert_eq!(layer_ids(&first), layer_ids(&second));
  assert_eq!(first["manifest_id"], second["manifest_id"]);
  assert!(second["steps"].as_array().unwrap().iter().all(|s| s["cached"] == true));
}

#[test]
fn text_output_reports_built_image() {
  let env = TestEnv::from_fixture("timezone.stratum");

  env
    .build_cmd()
    .args(["--tag", "tz"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Built image"))
    .stdout(predicate::str::contains("Tag: tz"));
}

#[test]
fn failing_run_reports_step_and_exit_code() {
  let env = TestEnv::from_fixture("failing.stratum");

  env
    .build_cmd()
    .assert()
    .code(3)
    .stderr(predicate::str::contains("step 2 failed"))
    .stderr(predicate::str::contains("stage one is broken"));

  let manifests = env.store_path().join("manifests");
  assert_eq!(std::fs::read_dir(manifests).map(|d| d.count()).unwrap_or(0), 0);
}

#[test]
fn failing_run_json_names_the_step() {
  let env = TestEnv::from_fixture("failing.stratum");

  let output = env.build_cmd().args(["-o", "json"]).output().unwrap();
  assert_eq!(output.status.code(), Some(3));

  let failure: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(failure["step"], 2);
  assert_eq!(failure["line"], 3);
  assert_eq!(failure["exit_code"], 3);
  assert!(failure["output"].as_str().unwrap().contains("stage one is broken"));
}

#[test]
fn undeclared_build_arg_is_rejected_unless_ignored() {
  let env = TestEnv::from_fixture("timezone.stratum");

  env
    .build_cmd()
    .args(["--build-arg", "LANG=C"])
    .assert()
    .code(65)
    .stderr(predicate::str::contains("LANG"));

  env
    .build_cmd()
    .args(["--build-arg", "LANG=C", "--ignore-unused-args"])
    .assert()
    .success();
}

#[test]
fn unresolved_reference_follows_ref_policy() {
  let env = TestEnv::from_recipe("FROM scratch\nENV GREETING=${MISSING}\n");

  env
    .build_cmd()
    .assert()
    .code(65)
    .stderr(predicate::str::contains("MISSING"));

  env.build_cmd().arg("--lenient-refs").assert().success();
}

#[test]
fn recipe_without_from_is_a_data_error() {
  let env = TestEnv::from_recipe("RUN true\n");

  env.build_cmd().assert().code(65);
}

#[test]
fn unknown_base_image_is_unavailable() {
  let env = TestEnv::from_recipe("FROM no-such-image\n");

  env
    .build_cmd()
    .assert()
    .code(69)
    .stderr(predicate::str::contains("no-such-image"));
}

#[test]
fn local_base_image_is_used() {
  let env = TestEnv::from_recipe("FROM base\nRUN read -r motd < /motd; echo \"$motd\" > seen\n");
  let base = env.base_image_with_shell("base");
  std::fs::write(base.join("motd"), "hello\n").unwrap();

  let summary = build_json(&env, &[]);

  assert_eq!(rootfs_file(&env, &summary, "seen"), "hello\n");
}

#[test]
fn run_timeout_exits_124() {
  let env = TestEnv::from_recipe("FROM toolbox\nRUN echo spinning; while :; do :; done\n");

  env
    .build_cmd()
    .args(["--timeout", "500ms"])
    .assert()
    .code(124)
    .stderr(predicate::str::contains("spinning"));
}

#[test]
fn absolute_paths_in_run_land_in_the_image() {
  let env = TestEnv::from_recipe("FROM toolbox\nRUN echo inside > /etc/marker\n");

  let summary = build_json(&env, &[]);

  assert_eq!(rootfs_file(&env, &summary, "etc/marker"), "inside\n");
}

#[test]
fn run_without_a_shell_in_the_image_exits_127() {
  let env = TestEnv::from_recipe("FROM scratch\nRUN true\n");

  env.build_cmd().assert().code(127);
}

#[test]
fn host_flag_runs_with_the_host_toolchain() {
  let env = TestEnv::from_recipe("FROM scratch\nWORKDIR /work\nRUN echo hi > out.txt\n");

  let summary = build_json(&env, &["--host"]);

  assert_eq!(rootfs_file(&env, &summary, "work/out.txt"), "hi\n");
}

#[test]
fn copy_lands_in_workdir() {
  let env = TestEnv::from_fixture("copy.stratum");
  env.write_file("app.txt", "payload");

  let summary = build_json(&env, &[]);

  assert_eq!(rootfs_file(&env, &summary, "app/app.txt"), "payload");
  assert_eq!(rootfs_file(&env, &summary, "app/copied.txt"), "payload\n");
  assert_eq!(summary["manifest"]["workdir"], "/app");
}

#[test]
fn copy_source_change_invalidates_cache_from_that_step() {
  let env = TestEnv::from_fixture("copy.stratum");
  env.write_file("app.txt", "one");
  let first = build_json(&env, &[]);

  env.write_file("app.txt", "two");
  let second = build_json(&env, &[]);

  let (a, b) = (layer_ids(&first), layer_ids(&second));
  assert_eq!(a[..2], b[..2]);
  assert_ne!(a[2], b[2]);
  assert_ne!(a[3], b[3]);
  assert_eq!(rootfs_file(&env, &second, "app/copied.txt"), "two\n");
}

#[test]
fn missing_recipe_file_fails() {
  let env = TestEnv::empty();

  env
    .stratum_cmd()
    .arg("build")
    .arg(env.temp.path().join("nope"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to read recipe"));
}
