//! Implementation of the `stratum build` command.
//!
//! Parses a recipe, runs it against the layer store and optionally tags the
//! resulting image. A failed build exits with the code the failing step
//! maps to, so scripts can tell a failing `RUN` from a broken recipe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use stratum_lib::execute::{
  BuildConfig, BuildError, BuildOutcome, Isolation, PipelineError, UnusedArgPolicy, build, exit_code,
};
use stratum_lib::manifest::{tag, validate_tag};
use stratum_lib::recipe::Recipe;
use stratum_lib::subst::UnresolvedPolicy;

use super::open_store;
use crate::output::{self, OutputFormat};

/// Flags of `stratum build`.
pub struct BuildArgs {
  pub file: PathBuf,
  pub build_args: Vec<String>,
  pub context: Option<PathBuf>,
  pub tag: Option<String>,
  pub lenient_refs: bool,
  pub ignore_unused_args: bool,
  pub timeout: Option<Duration>,
  pub host: bool,
  pub shell: Option<String>,
  pub no_verify: bool,
}

#[derive(Serialize)]
struct BuildSummary<'a> {
  #[serde(flatten)]
  outcome: &'a BuildOutcome,
  tag: Option<&'a str>,
}

#[derive(Serialize)]
struct FailureSummary<'a> {
  error: String,
  exit_code: u8,
  step: Option<usize>,
  line: Option<usize>,
  instruction: Option<&'a str>,
  output: Option<&'a str>,
}

/// Split `NAME=VALUE` overrides into a map. Later values win.
fn parse_build_args(raw: &[String]) -> Result<BTreeMap<String, String>> {
  let mut overrides = BTreeMap::new();
  for arg in raw {
    let Some((name, value)) = arg.split_once('=') else {
      bail!("invalid --build-arg '{}': expected NAME=VALUE", arg);
    };
    if name.is_empty() {
      bail!("invalid --build-arg '{}': empty name", arg);
    }
    overrides.insert(name.to_string(), value.to_string());
  }
  Ok(overrides)
}

fn config_from(args: &BuildArgs, context_dir: PathBuf) -> BuildConfig {
  BuildConfig {
    context_dir,
    unresolved: if args.lenient_refs {
      UnresolvedPolicy::Empty
    } else {
      UnresolvedPolicy::Error
    },
    unused_args: if args.ignore_unused_args {
      UnusedArgPolicy::Warn
    } else {
      UnusedArgPolicy::Reject
    },
    isolation: if args.host { Isolation::Host } else { Isolation::Chroot },
    shell: args.shell.clone(),
    run_timeout: args.timeout,
    verify_cache: !args.no_verify,
    ..BuildConfig::default()
  }
}

/// COPY sources resolve against `--context`, else the recipe's directory.
fn context_dir(file: &Path, context: Option<&Path>) -> PathBuf {
  match context {
    Some(dir) => dir.to_path_buf(),
    None => file
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from(".")),
  }
}

/// Execute the build command.
///
/// Returns the exit code to report: success, or the code of the error that
/// stopped the build. Problems outside the build itself (unreadable recipe,
/// malformed flags) are returned as errors.
pub fn cmd_build(args: BuildArgs, store_root: &Path, format: OutputFormat) -> Result<ExitCode> {
  let start = Instant::now();

  let src = std::fs::read_to_string(&args.file)
    .with_context(|| format!("Failed to read recipe {}", args.file.display()))?;
  let overrides = parse_build_args(&args.build_args)?;
  if let Some(name) = &args.tag {
    validate_tag(name)?;
  }

  let recipe = match Recipe::parse(&src) {
    Ok(recipe) => recipe,
    Err(e) => {
      let err = PipelineError::Build(BuildError::Parse(e));
      report_failure(&err, &args.file, format)?;
      return Ok(ExitCode::from(exit_code::DATA_ERR));
    }
  };

  let config = config_from(&args, context_dir(&args.file, args.context.as_deref()));
  let store = open_store(store_root)?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let cancel = CancellationToken::new();
  let result = rt.block_on(async {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling build");
        on_interrupt.cancel();
      }
    });
    build(&recipe, &overrides, &store, &config, &cancel).await
  });

  let outcome = match result {
    Ok(outcome) => outcome,
    Err(err) => {
      report_failure(&err, &args.file, format)?;
      return Ok(ExitCode::from(err.exit_code()));
    }
  };

  if let Some(name) = &args.tag {
    tag(&store, name, &outcome.manifest_id).with_context(|| format!("Failed to tag image as '{}'", name))?;
  }

  if format.is_json() {
    output::json(&BuildSummary {
      outcome: &outcome,
      tag: args.tag.as_deref(),
    })?;
    return Ok(ExitCode::SUCCESS);
  }

  for step in &outcome.steps {
    output::step(step);
  }
  println!();
  output::done(&format!("Built image {}", output::short_id(&outcome.manifest_id.0)));
  if let Some(name) = &args.tag {
    output::stat("Tag", name);
  }
  output::stat(
    "Steps",
    &format!("{} ({} cached)", outcome.steps.len(), outcome.cached_steps()),
  );
  output::stat("Manifest", &outcome.manifest_id.0);
  output::stat("Duration", &output::human_duration(start.elapsed()));

  Ok(ExitCode::SUCCESS)
}

fn report_failure(err: &PipelineError, file: &Path, format: OutputFormat) -> Result<()> {
  let step = err.step();

  if format.is_json() {
    return output::json(&FailureSummary {
      error: err.error().to_string(),
      exit_code: err.exit_code(),
      step: step.map(|s| s.index),
      line: step.map(|s| s.line),
      instruction: step.map(|s| s.instruction.as_str()),
      output: err.error().output(),
    });
  }

  output::failure(err, file);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn build_args_split_on_first_equals() {
    let parsed = parse_build_args(&["TZ=UTC".to_string(), "OPTS=a=b".to_string(), "EMPTY=".to_string()]).unwrap();
    assert_eq!(parsed["TZ"], "UTC");
    assert_eq!(parsed["OPTS"], "a=b");
    assert_eq!(parsed["EMPTY"], "");
  }

  #[test]
  fn malformed_build_args_are_rejected() {
    assert!(parse_build_args(&["NOVALUE".to_string()]).is_err());
    assert!(parse_build_args(&["=x".to_string()]).is_err());
  }

  #[test]
  fn context_defaults_to_recipe_directory() {
    assert_eq!(context_dir(Path::new("proj/Stratumfile"), None), PathBuf::from("proj"));
    assert_eq!(context_dir(Path::new("Stratumfile"), None), PathBuf::from("."));
    assert_eq!(
      context_dir(Path::new("proj/Stratumfile"), Some(Path::new("/ctx"))),
      PathBuf::from("/ctx")
    );
  }
}
