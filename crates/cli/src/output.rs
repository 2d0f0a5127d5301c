//! Terminal rendering for `stratum`.
//!
//! Every subcommand prints either human-readable lines or, with `-o json`, a
//! single pretty-printed JSON document on stdout. Build progress and failure
//! reports are rendered here so text and JSON stay in one place.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use stratum_lib::consts::SHORT_HASH_LEN;
use stratum_lib::execute::{PipelineError, StepReport};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// Leading glyph of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
  Done,
  Failed,
  Note,
  /// A step that executed.
  Executed,
  /// A step whose layer came from the cache.
  Cached,
}

impl Mark {
  pub fn glyph(self) -> &'static str {
    match self {
      Mark::Done => "✓",
      Mark::Failed => "✗",
      Mark::Note => "•",
      Mark::Executed => "→",
      Mark::Cached => "=",
    }
  }
}

/// Layer and manifest ids shortened for display.
pub fn short_id(id: &str) -> &str {
  &id[..id.len().min(SHORT_HASH_LEN)]
}

pub fn human_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// Millisecond precision; `humantime` spells out the units.
pub fn human_duration(duration: Duration) -> String {
  let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  humantime::format_duration(Duration::from_millis(millis)).to_string()
}

pub fn done(message: &str) {
  println!(
    "{} {}",
    Mark::Done.glyph().if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn note(message: &str) {
  println!(
    "{} {}",
    Mark::Note.glyph().if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn failed(message: &str) {
  eprintln!(
    "{} {}",
    Mark::Failed.glyph().if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let text = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", text);
  Ok(())
}

/// One build step: cache marker, index, short layer id, instruction.
pub fn step(report: &StepReport) {
  let mark = if report.cached { Mark::Cached } else { Mark::Executed };
  println!(
    "  {} {:>3} {} {}",
    mark.glyph().if_supports_color(Stream::Stdout, |s| s.dimmed()),
    report.index,
    short_id(&report.layer.0).if_supports_color(Stream::Stdout, |s| s.cyan()),
    report.instruction
  );
}

/// `file:line: step N failed: INSTRUCTION`, or just the file for errors
/// raised before any step ran.
pub fn failure_headline(err: &PipelineError, file: &Path) -> String {
  match err.step() {
    Some(failure) => format!(
      "{}:{}: step {} failed: {}",
      file.display(),
      failure.line,
      failure.index,
      failure.instruction
    ),
    None => format!("{}: {}", file.display(), err),
  }
}

/// Headline, cause and captured command output on stderr.
pub fn failure(err: &PipelineError, file: &Path) {
  failed(&failure_headline(err, file));
  if err.step().is_some() {
    eprintln!("  {}", err.error());
  }
  if let Some(output) = err.error().output() {
    eprintln!("  output:");
    for line in output.lines() {
      eprintln!("    {}", line.if_supports_color(Stream::Stderr, |s| s.dimmed()));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use stratum_lib::execute::{BuildError, StepFailure};
  use stratum_lib::recipe::ParseError;

  #[test]
  fn short_id_keeps_prefix() {
    assert_eq!(short_id(&"ab".repeat(32)), "abababababab");
    assert_eq!(short_id("short"), "short");
  }

  #[test]
  fn bytes_scale_through_units() {
    assert_eq!(human_bytes(0), "0 B");
    assert_eq!(human_bytes(1536), "1.5 KB");
    assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MB");
    assert_eq!(human_bytes(1 << 40), "1.0 TB");
  }

  #[test]
  fn durations_round_to_milliseconds() {
    assert_eq!(human_duration(Duration::from_micros(1_500_700)), "1s 500ms");
    assert_eq!(human_duration(Duration::from_secs(65)), "1m 5s");
  }

  #[test]
  fn headline_names_file_line_and_step() {
    let err = PipelineError::Step(Box::new(StepFailure {
      index: 2,
      line: 3,
      instruction: "RUN false".to_string(),
      error: BuildError::Cancelled,
    }));
    assert_eq!(
      failure_headline(&err, Path::new("Stratumfile")),
      "Stratumfile:3: step 2 failed: RUN false"
    );

    let early = PipelineError::Build(BuildError::Parse(ParseError::Empty));
    assert!(failure_headline(&early, Path::new("Stratumfile")).starts_with("Stratumfile: "));
  }
}
