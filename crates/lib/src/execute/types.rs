//! Configuration, results and errors of pipeline execution.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer::{LayerId, LayerStoreError};
use crate::manifest::{ImageManifest, ManifestError, ManifestId};
use crate::platform::paths;
use crate::recipe::{ParseError, StepKind};
use crate::store_lock::StoreLockError;
use crate::subst::{SubstError, UnresolvedPolicy};
use crate::util::hash::{DirHashError, HashError};

/// What to do with build-arg overrides that no `ARG` declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnusedArgPolicy {
  /// Fail before any step runs.
  #[default]
  Reject,
  /// Log a warning and ignore them.
  Warn,
}

/// How `RUN` commands see the layer filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
  /// `chroot` into the staged rootfs before exec, so absolute paths refer
  /// to the image. Non-root builders get an unprivileged user namespace on
  /// Linux. Shell-form commands need a shell inside the image.
  #[default]
  Chroot,
  /// Run on the host with only the working directory mapped into the
  /// staged rootfs. Absolute paths in commands refer to the host.
  Host,
}

/// Bounded exponential backoff for base-image downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub multiplier: u32,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_delay: Duration::from_millis(500),
      multiplier: 2,
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based).
  pub fn backoff_delay(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
    self.initial_delay.saturating_mul(factor).min(self.max_delay)
  }
}

/// Settings for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Where named local base images live.
  pub images_dir: PathBuf,
  /// Directory `COPY` sources are resolved against.
  pub context_dir: PathBuf,
  pub unresolved: UnresolvedPolicy,
  pub unused_args: UnusedArgPolicy,
  pub isolation: Isolation,
  /// Shell for `RUN` in shell form. Defaults to `/bin/sh -c`.
  pub shell: Option<String>,
  /// Per-command limit for `RUN` steps.
  pub run_timeout: Option<Duration>,
  pub fetch_retry: RetryPolicy,
  /// Re-hash cached layers before adopting them.
  pub verify_cache: bool,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      images_dir: paths::images_dir(),
      context_dir: PathBuf::from("."),
      unresolved: UnresolvedPolicy::default(),
      unused_args: UnusedArgPolicy::default(),
      isolation: Isolation::default(),
      shell: None,
      run_timeout: None,
      fetch_retry: RetryPolicy::default(),
      verify_cache: true,
    }
  }
}

/// How a `RUN` command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
  Exited(i32),
  Signaled(i32),
  TimedOut,
  Cancelled,
}

impl fmt::Display for CommandStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CommandStatus::Exited(code) => write!(f, "exit code {}", code),
      CommandStatus::Signaled(signal) => write!(f, "signal {}", signal),
      CommandStatus::TimedOut => f.write_str("timed out"),
      CommandStatus::Cancelled => f.write_str("cancelled"),
    }
  }
}

/// Process exit codes, following `sysexits.h`.
pub mod exit_code {
  pub const DATA_ERR: u8 = 65;
  pub const UNAVAILABLE: u8 = 69;
  pub const SOFTWARE: u8 = 70;
  pub const IO_ERR: u8 = 74;
  pub const TEMP_FAIL: u8 = 75;
  pub const TIMED_OUT: u8 = 124;
  pub const INTERRUPTED: u8 = 130;
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error("undeclared build argument(s): {}", .names.join(", "))]
  UndeclaredBuildArgs { names: Vec<String> },

  #[error("reference to undeclared variable '{name}'")]
  UnresolvedArgument { name: String },

  #[error("variable substitution failed: {0}")]
  Substitution(SubstError),

  #[error("command `{cmd}` failed ({status})")]
  CommandFailed {
    cmd: String,
    status: CommandStatus,
    output: String,
  },

  #[error("{path}: {message}")]
  PathError { path: String, message: String },

  #[error("COPY source {path}: {message}")]
  CopySource { path: String, message: String },

  #[error("cached layer {layer} is corrupt: {message}")]
  CacheCorruption { layer: LayerId, message: String },

  #[error("base image '{image}' is unavailable: {message}")]
  BaseImageUnavailable { image: String, message: String },

  #[error("build cancelled")]
  Cancelled,

  #[error(transparent)]
  Store(LayerStoreError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("failed to hash content: {0}")]
  ContentHash(#[from] DirHashError),

  #[error("failed to compute cache key: {0}")]
  CacheKey(#[from] HashError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

impl BuildError {
  /// The process exit code a CLI should report for this error.
  pub fn exit_code(&self) -> u8 {
    match self {
      BuildError::CommandFailed { status, .. } => match *status {
        CommandStatus::Exited(code) => u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1),
        CommandStatus::Signaled(signal) => u8::try_from(128 + signal).unwrap_or(1),
        CommandStatus::TimedOut => exit_code::TIMED_OUT,
        CommandStatus::Cancelled => exit_code::INTERRUPTED,
      },
      BuildError::Cancelled => exit_code::INTERRUPTED,
      BuildError::Parse(_)
      | BuildError::UndeclaredBuildArgs { .. }
      | BuildError::UnresolvedArgument { .. }
      | BuildError::Substitution(_)
      | BuildError::CopySource { .. } => exit_code::DATA_ERR,
      BuildError::BaseImageUnavailable { .. } => exit_code::UNAVAILABLE,
      BuildError::Lock(_) => exit_code::TEMP_FAIL,
      BuildError::CacheKey(_) => exit_code::SOFTWARE,
      BuildError::PathError { .. }
      | BuildError::CacheCorruption { .. }
      | BuildError::Store(_)
      | BuildError::Manifest(_)
      | BuildError::ContentHash(_)
      | BuildError::Io(_) => exit_code::IO_ERR,
    }
  }

  /// Output captured from a failed command.
  pub fn output(&self) -> Option<&str> {
    match self {
      BuildError::CommandFailed { output, .. } if !output.is_empty() => Some(output),
      _ => None,
    }
  }
}

impl From<LayerStoreError> for BuildError {
  fn from(err: LayerStoreError) -> Self {
    match err {
      LayerStoreError::Corrupt { id, message } => BuildError::CacheCorruption { layer: id, message },
      other => BuildError::Store(other),
    }
  }
}

impl From<SubstError> for BuildError {
  fn from(err: SubstError) -> Self {
    match err {
      SubstError::Unresolved(name) => BuildError::UnresolvedArgument { name },
      other => BuildError::Substitution(other),
    }
  }
}

/// A step's error together with enough context to reproduce it.
#[derive(Debug, Error)]
#[error("step {index} (line {line}) failed: {instruction}")]
pub struct StepFailure {
  /// Zero-based step index.
  pub index: usize,
  pub line: usize,
  /// The instruction as written in the recipe.
  pub instruction: String,
  #[source]
  pub error: BuildError,
}

/// Why a build produced no image.
#[derive(Debug, Error)]
pub enum PipelineError {
  /// A step failed; later steps did not run.
  #[error(transparent)]
  Step(Box<StepFailure>),

  /// The build failed before or after running steps.
  #[error(transparent)]
  Build(#[from] BuildError),
}

impl PipelineError {
  pub fn error(&self) -> &BuildError {
    match self {
      PipelineError::Step(failure) => &failure.error,
      PipelineError::Build(error) => error,
    }
  }

  pub fn step(&self) -> Option<&StepFailure> {
    match self {
      PipelineError::Step(failure) => Some(failure),
      PipelineError::Build(_) => None,
    }
  }

  pub fn exit_code(&self) -> u8 {
    self.error().exit_code()
  }
}

/// What happened to one step of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
  pub index: usize,
  pub kind: StepKind,
  pub instruction: String,
  pub layer: LayerId,
  /// The layer was adopted from the store without executing the step.
  pub cached: bool,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
  pub manifest_id: ManifestId,
  pub manifest: ImageManifest,
  pub steps: Vec<StepReport>,
}

impl BuildOutcome {
  pub fn cached_steps(&self) -> usize {
    self.steps.iter().filter(|s| s.cached).count()
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
  }
}
