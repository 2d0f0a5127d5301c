//! The per-step pipeline state snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_PATH;
use crate::subst::Resolver;

/// Everything a step can observe from the steps before it.
///
/// A `StepState` is never mutated in place. Each step derives a new value
/// from the previous one, so a snapshot handed to a step (and hashed into its
/// cache key) is exactly what the step saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
  /// Resolved base image reference.
  pub base: String,
  /// Build arguments in scope.
  pub args: BTreeMap<String, String>,
  /// Environment variables exported into the image.
  pub env: BTreeMap<String, String>,
  pub labels: BTreeMap<String, String>,
  /// Absolute working directory inside the image.
  pub workdir: String,
}

impl StepState {
  /// The state right after `FROM <base>`.
  pub fn root(base: impl Into<String>) -> Self {
    Self {
      base: base.into(),
      args: BTreeMap::new(),
      env: BTreeMap::new(),
      labels: BTreeMap::new(),
      workdir: "/".to_string(),
    }
  }

  pub fn with_arg(&self, name: &str, value: &str) -> Self {
    let mut next = self.clone();
    next.args.insert(name.to_string(), value.to_string());
    next
  }

  /// Later pairs win over earlier ones with the same key.
  pub fn with_env(&self, pairs: &[(String, String)]) -> Self {
    let mut next = self.clone();
    next.env.extend(pairs.iter().cloned());
    next
  }

  pub fn with_labels(&self, pairs: &[(String, String)]) -> Self {
    let mut next = self.clone();
    next.labels.extend(pairs.iter().cloned());
    next
  }

  pub fn with_workdir(&self, workdir: &str) -> Self {
    let mut next = self.clone();
    next.workdir = workdir.to_string();
    next
  }

  /// The environment a `RUN` step executes with.
  ///
  /// Build arguments are visible to commands but environment variables win
  /// on a name clash. `PATH` falls back to a conventional default.
  pub fn process_env(&self) -> BTreeMap<String, String> {
    let mut env = self.args.clone();
    env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.entry("PATH".to_string()).or_insert_with(|| DEFAULT_PATH.to_string());
    env
  }
}

impl Resolver for StepState {
  fn lookup(&self, name: &str) -> Option<&str> {
    self
      .env
      .get(name)
      .or_else(|| self.args.get(name))
      .map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pair(k: &str, v: &str) -> (String, String) {
    (k.to_string(), v.to_string())
  }

  #[test]
  fn derived_states_leave_the_original_untouched() {
    let root = StepState::root("scratch");
    let next = root.with_env(&[pair("X", "1")]);

    assert!(root.env.is_empty());
    assert_eq!(next.env["X"], "1");
  }

  #[test]
  fn later_env_values_override() {
    let state = StepState::root("scratch")
      .with_env(&[pair("X", "1")])
      .with_env(&[pair("X", "2"), pair("Y", "3")]);

    assert_eq!(state.env["X"], "2");
    assert_eq!(state.env["Y"], "3");
  }

  #[test]
  fn env_shadows_args_in_lookup_and_process_env() {
    let state = StepState::root("scratch")
      .with_arg("TZ", "UTC")
      .with_env(&[pair("TZ", "Europe/Paris")]);

    assert_eq!(state.lookup("TZ"), Some("Europe/Paris"));
    assert_eq!(state.process_env()["TZ"], "Europe/Paris");
  }

  #[test]
  fn process_env_defaults_path() {
    let state = StepState::root("scratch");
    assert_eq!(state.process_env()["PATH"], DEFAULT_PATH);

    let custom = state.with_env(&[pair("PATH", "/opt/bin")]);
    assert_eq!(custom.process_env()["PATH"], "/opt/bin");
  }
}
