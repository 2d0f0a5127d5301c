use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of a build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepKind {
  From,
  Arg,
  Env,
  Run,
  Workdir,
  Label,
  Copy,
}

impl StepKind {
  pub fn as_str(self) -> &'static str {
    match self {
      StepKind::From => "FROM",
      StepKind::Arg => "ARG",
      StepKind::Env => "ENV",
      StepKind::Run => "RUN",
      StepKind::Workdir => "WORKDIR",
      StepKind::Label => "LABEL",
      StepKind::Copy => "COPY",
    }
  }

  /// Whether executing this kind may change the filesystem.
  pub fn mutates_filesystem(self) -> bool {
    matches!(self, StepKind::From | StepKind::Run | StepKind::Workdir | StepKind::Copy)
  }
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How a `RUN` command is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunCommand {
  /// `RUN <command>`: passed to the shell with `-c`.
  Shell(String),
  /// `RUN ["prog", "arg"]`: executed directly, no shell.
  Exec(Vec<String>),
}

impl fmt::Display for RunCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunCommand::Shell(cmd) => f.write_str(cmd),
      RunCommand::Exec(argv) => write!(f, "{}", argv.join(" ")),
    }
  }
}

/// A parsed instruction. Values still carry unexpanded `$VAR` references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
  From { image: String },
  Arg { name: String, default: Option<String> },
  Env { pairs: Vec<(String, String)> },
  Run { command: RunCommand },
  Workdir { path: String },
  Label { pairs: Vec<(String, String)> },
  Copy { sources: Vec<String>, dest: String },
}

impl Instruction {
  pub fn kind(&self) -> StepKind {
    match self {
      Instruction::From { .. } => StepKind::From,
      Instruction::Arg { .. } => StepKind::Arg,
      Instruction::Env { .. } => StepKind::Env,
      Instruction::Run { .. } => StepKind::Run,
      Instruction::Workdir { .. } => StepKind::Workdir,
      Instruction::Label { .. } => StepKind::Label,
      Instruction::Copy { .. } => StepKind::Copy,
    }
  }
}

/// One step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
  /// Zero-based position in the pipeline.
  pub index: usize,
  /// One-based line number where the logical instruction starts.
  pub line: usize,
  /// The logical instruction as written (continuations joined).
  pub text: String,
  pub instruction: Instruction,
}

impl Step {
  pub fn kind(&self) -> StepKind {
    self.instruction.kind()
  }
}

/// An ordered list of build steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
  pub steps: Vec<Step>,
}

impl Recipe {
  /// Names declared by `ARG` anywhere in the recipe.
  pub fn declared_args(&self) -> BTreeSet<&str> {
    self
      .steps
      .iter()
      .filter_map(|step| match &step.instruction {
        Instruction::Arg { name, .. } => Some(name.as_str()),
        _ => None,
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}
