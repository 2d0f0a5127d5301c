//! Line-oriented recipe parsing.
//!
//! Physical lines ending in the escape character are joined into one logical
//! instruction. Blank lines and `#` comments are dropped, including inside a
//! continuation. A `# escape=<c>` directive on the first lines switches the
//! escape character to `` ` ``.

use thiserror::Error;

use super::types::{Instruction, Recipe, RunCommand, Step, StepKind};

const DEFAULT_ESCAPE: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
  #[error("recipe contains no instructions")]
  Empty,

  #[error("line {line}: recipe must begin with FROM, found {found}")]
  MissingFrom { line: usize, found: StepKind },

  #[error("line {line}: FROM is only valid as the first instruction")]
  FromNotFirst { line: usize },

  #[error("line {line}: unknown instruction '{keyword}'")]
  UnknownInstruction { line: usize, keyword: String },

  #[error("line {line}: {keyword} requires {expected}")]
  MissingArgument {
    line: usize,
    keyword: StepKind,
    expected: &'static str,
  },

  #[error("line {line}: malformed key=value pair '{token}'")]
  MalformedPair { line: usize, token: String },

  #[error("line {line}: invalid name '{name}'")]
  InvalidName { line: usize, name: String },

  #[error("line {line}: unterminated quote")]
  UnterminatedQuote { line: usize },

  #[error("line {line}: {message}")]
  Unsupported { line: usize, message: String },
}

struct LogicalLine {
  line: usize,
  text: String,
}

impl Recipe {
  /// Parse recipe source text.
  pub fn parse(src: &str) -> Result<Self, ParseError> {
    let escape = escape_directive(src)?;
    let mut steps = Vec::new();

    for logical in logical_lines(src, escape) {
      let instruction = parse_instruction(&logical)?;
      steps.push(Step {
        index: steps.len(),
        line: logical.line,
        text: logical.text,
        instruction,
      });
    }

    let first = steps.first().ok_or(ParseError::Empty)?;
    if first.kind() != StepKind::From {
      return Err(ParseError::MissingFrom {
        line: first.line,
        found: first.kind(),
      });
    }
    if let Some(step) = steps.iter().skip(1).find(|s| s.kind() == StepKind::From) {
      return Err(ParseError::FromNotFirst { line: step.line });
    }

    Ok(Recipe { steps })
  }
}

/// Reads a leading `# escape=<c>` parser directive.
fn escape_directive(src: &str) -> Result<char, ParseError> {
  for (idx, raw) in src.lines().enumerate() {
    let trimmed = raw.trim();
    let Some(comment) = trimmed.strip_prefix('#') else {
      break;
    };
    let Some((key, value)) = comment.split_once('=') else {
      break;
    };
    if !key.trim().eq_ignore_ascii_case("escape") {
      break;
    }
    return match value.trim() {
      "\\" => Ok('\\'),
      "`" => Ok('`'),
      other => Err(ParseError::Unsupported {
        line: idx + 1,
        message: format!("invalid escape character '{}'", other),
      }),
    };
  }
  Ok(DEFAULT_ESCAPE)
}

fn logical_lines(src: &str, escape: char) -> Vec<LogicalLine> {
  let mut lines = Vec::new();
  let mut current: Option<LogicalLine> = None;

  for (idx, raw) in src.lines().enumerate() {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }

    let body = raw.trim_end();
    let (content, continues) = match body.strip_suffix(escape) {
      Some(rest) => (rest, true),
      None => (body, false),
    };

    match current.as_mut() {
      Some(logical) => logical.text.push_str(content),
      None => {
        current = Some(LogicalLine {
          line: idx + 1,
          text: content.trim_start().to_string(),
        })
      }
    }

    if !continues && let Some(done) = current.take() {
      lines.push(done);
    }
  }

  // a continuation at end of input keeps what it has
  if let Some(done) = current.take() {
    lines.push(done);
  }

  lines
}

fn parse_instruction(logical: &LogicalLine) -> Result<Instruction, ParseError> {
  let line = logical.line;
  let text = logical.text.trim_end();
  let (keyword, rest) = match text.split_once(char::is_whitespace) {
    Some((keyword, rest)) => (keyword, rest.trim_start()),
    None => (text, ""),
  };

  let kind = match keyword.to_ascii_uppercase().as_str() {
    "FROM" => StepKind::From,
    "ARG" => StepKind::Arg,
    "ENV" => StepKind::Env,
    "RUN" => StepKind::Run,
    "WORKDIR" => StepKind::Workdir,
    "LABEL" => StepKind::Label,
    "COPY" => StepKind::Copy,
    _ => {
      return Err(ParseError::UnknownInstruction {
        line,
        keyword: keyword.to_string(),
      });
    }
  };

  let missing = |expected: &'static str| ParseError::MissingArgument {
    line,
    keyword: kind,
    expected,
  };

  if rest.is_empty() {
    return Err(missing(match kind {
      StepKind::From => "an image",
      StepKind::Arg => "a name",
      StepKind::Env | StepKind::Label => "at least one key=value pair",
      StepKind::Run => "a command",
      StepKind::Workdir => "a path",
      StepKind::Copy => "a source and a destination",
    }));
  }

  match kind {
    StepKind::From => {
      let words = split_words(rest, line)?;
      match words.as_slice() {
        [image] => Ok(Instruction::From { image: image.clone() }),
        [_, alias, _] if alias.eq_ignore_ascii_case("as") => Err(ParseError::Unsupported {
          line,
          message: "named build stages are not supported".to_string(),
        }),
        _ => Err(missing("exactly one image")),
      }
    }

    StepKind::Arg => {
      let words = split_words(rest, line)?;
      let [word] = words.as_slice() else {
        return Err(missing("exactly one name[=default]"));
      };
      let (name, default) = match word.split_once('=') {
        Some((name, default)) => (name, Some(default.to_string())),
        None => (word.as_str(), None),
      };
      validate_name(name, line)?;
      Ok(Instruction::Arg {
        name: name.to_string(),
        default,
      })
    }

    StepKind::Env => {
      let words = split_words(rest, line)?;
      if words.first().is_some_and(|w| !w.contains('=')) {
        // legacy `ENV KEY value with spaces`
        let (key, value) = rest.split_once(char::is_whitespace).ok_or_else(|| missing("a value"))?;
        validate_name(key, line)?;
        return Ok(Instruction::Env {
          pairs: vec![(key.to_string(), value.trim().to_string())],
        });
      }
      let pairs = parse_pairs(&words, line)?;
      for (key, _) in &pairs {
        validate_name(key, line)?;
      }
      Ok(Instruction::Env { pairs })
    }

    StepKind::Label => {
      let words = split_words(rest, line)?;
      Ok(Instruction::Label {
        pairs: parse_pairs(&words, line)?,
      })
    }

    StepKind::Run => {
      if rest.starts_with('[')
        && let Ok(argv) = serde_json::from_str::<Vec<String>>(rest)
        && !argv.is_empty()
      {
        return Ok(Instruction::Run {
          command: RunCommand::Exec(argv),
        });
      }
      Ok(Instruction::Run {
        command: RunCommand::Shell(rest.to_string()),
      })
    }

    StepKind::Workdir => {
      let words = split_words(rest, line)?;
      let path = match words.as_slice() {
        [single] => single.clone(),
        _ => rest.to_string(),
      };
      Ok(Instruction::Workdir { path })
    }

    StepKind::Copy => {
      let mut words = split_words(rest, line)?;
      if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
        return Err(ParseError::Unsupported {
          line,
          message: format!("COPY flag '{}' is not supported", flag),
        });
      }
      if words.len() < 2 {
        return Err(missing("a source and a destination"));
      }
      let dest = words.pop().unwrap_or_default();
      Ok(Instruction::Copy { sources: words, dest })
    }
  }
}

fn parse_pairs(words: &[String], line: usize) -> Result<Vec<(String, String)>, ParseError> {
  words
    .iter()
    .map(|word| match word.split_once('=') {
      Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
      _ => Err(ParseError::MalformedPair {
        line,
        token: word.clone(),
      }),
    })
    .collect()
}

fn validate_name(name: &str, line: usize) -> Result<(), ParseError> {
  let mut chars = name.chars();
  let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(ParseError::InvalidName {
      line,
      name: name.to_string(),
    })
  }
}

/// Split on unquoted whitespace, removing quotes.
///
/// `$` inside single quotes is escaped as `\$` so that variable substitution
/// leaves it literal.
fn split_words(input: &str, line: usize) -> Result<Vec<String>, ParseError> {
  let mut words = Vec::new();
  let mut word = String::new();
  let mut in_word = false;
  let mut chars = input.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '"' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') if chars.peek() == Some(&'"') => {
              word.push('"');
              chars.next();
            }
            Some(other) => word.push(other),
            None => return Err(ParseError::UnterminatedQuote { line }),
          }
        }
      }
      '\'' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('\'') => break,
            Some('$') => word.push_str("\\$"),
            Some(other) => word.push(other),
            None => return Err(ParseError::UnterminatedQuote { line }),
          }
        }
      }
      '\\' if chars.peek().is_some_and(|n| n.is_whitespace()) => {
        in_word = true;
        if let Some(ws) = chars.next() {
          word.push(ws);
        }
      }
      c if c.is_whitespace() => {
        if in_word {
          words.push(std::mem::take(&mut word));
          in_word = false;
        }
      }
      c => {
        in_word = true;
        word.push(c);
      }
    }
  }

  if in_word {
    words.push(word);
  }

  Ok(words)
}
