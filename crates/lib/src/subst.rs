//! Variable substitution for instruction payloads.
//!
//! Supported forms:
//!
//! - `$NAME` and `${NAME}` - value of an environment variable or build argument
//! - `${NAME:-word}` - `word` when `NAME` is unset or empty
//! - `${NAME:+word}` - `word` when `NAME` is set and non-empty, else empty
//! - `\$` - a literal `$`
//!
//! `word` may itself contain references. A `$` not followed by a name or `{`
//! is kept as is.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use stratum_lib::subst::{UnresolvedPolicy, substitute};
//!
//! let vars = BTreeMap::from([("TZ".to_string(), "UTC".to_string())]);
//! let out = substitute("zone=${TZ} lang=${LANG:-C}", &vars, UnresolvedPolicy::Error).unwrap();
//! assert_eq!(out, "zone=UTC lang=C");
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A `${NAME...}` modifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
  /// `:-word`
  Default(String),
  /// `:+word`
  Alternate(String),
}

/// A parsed variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
  pub name: String,
  pub modifier: Option<Modifier>,
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Var(VarRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstError {
  #[error("unclosed variable reference at position {0}")]
  Unclosed(usize),

  #[error("invalid variable name in '${{{0}}}'")]
  BadName(String),

  #[error("unsupported modifier in '${{{0}}}'")]
  UnknownModifier(String),

  #[error("reference to undeclared variable '{0}'")]
  Unresolved(String),
}

/// What to do with a reference to a name that is neither an environment
/// variable nor a declared build argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedPolicy {
  /// Fail the step with an unresolved-reference error.
  #[default]
  Error,
  /// Substitute the empty string and log a warning.
  Empty,
}

/// Looks up variable values during substitution.
pub trait Resolver {
  fn lookup(&self, name: &str) -> Option<&str>;
}

impl Resolver for BTreeMap<String, String> {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.get(name).map(String::as_str)
  }
}

fn is_name_start(c: char) -> bool {
  c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_'
}

/// Parse a string into literal and variable segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, SubstError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    match ch {
      '\\' if matches!(chars.peek(), Some((_, '$'))) => {
        chars.next();
        literal.push('$');
      }
      '$' => match chars.peek() {
        Some((_, '{')) => {
          chars.next();

          // collect up to the matching brace; modifiers may nest references
          let mut depth = 1;
          let mut body = String::new();
          for (_, c) in chars.by_ref() {
            match c {
              '{' => depth += 1,
              '}' => {
                depth -= 1;
                if depth == 0 {
                  break;
                }
              }
              _ => {}
            }
            body.push(c);
          }
          if depth != 0 {
            return Err(SubstError::Unclosed(pos));
          }

          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Var(parse_braced(&body)?));
        }
        Some(&(_, c)) if is_name_start(c) => {
          let mut name = String::new();
          while let Some(&(_, c)) = chars.peek() {
            if !is_name_char(c) {
              break;
            }
            name.push(c);
            chars.next();
          }

          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Var(VarRef { name, modifier: None }));
        }
        _ => literal.push('$'),
      },
      _ => literal.push(ch),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_braced(body: &str) -> Result<VarRef, SubstError> {
  let name_len = body.find(|c: char| !is_name_char(c)).unwrap_or(body.len());
  let (name, rest) = body.split_at(name_len);

  if !name.starts_with(is_name_start) {
    return Err(SubstError::BadName(body.to_string()));
  }

  let modifier = if rest.is_empty() {
    None
  } else if let Some(word) = rest.strip_prefix(":-") {
    Some(Modifier::Default(word.to_string()))
  } else if let Some(word) = rest.strip_prefix(":+") {
    Some(Modifier::Alternate(word.to_string()))
  } else {
    return Err(SubstError::UnknownModifier(body.to_string()));
  };

  Ok(VarRef {
    name: name.to_string(),
    modifier,
  })
}

/// Expand every reference in `input`.
pub fn substitute(input: &str, resolver: &impl Resolver, policy: UnresolvedPolicy) -> Result<String, SubstError> {
  let mut out = String::with_capacity(input.len());

  for segment in parse(input)? {
    match segment {
      Segment::Literal(text) => out.push_str(&text),
      Segment::Var(var) => {
        let value = resolver.lookup(&var.name).filter(|v| !v.is_empty());
        match (&var.modifier, value) {
          (Some(Modifier::Default(_)), Some(value)) => out.push_str(value),
          (Some(Modifier::Default(word)), None) => out.push_str(&substitute(word, resolver, policy)?),
          (Some(Modifier::Alternate(word)), Some(_)) => out.push_str(&substitute(word, resolver, policy)?),
          (Some(Modifier::Alternate(_)), None) => {}
          (None, _) => match resolver.lookup(&var.name) {
            Some(value) => out.push_str(value),
            None => match policy {
              UnresolvedPolicy::Error => return Err(SubstError::Unresolved(var.name)),
              UnresolvedPolicy::Empty => {
                warn!(name = %var.name, "undeclared variable substituted as empty string");
              }
            },
          },
        }
      }
    }
  }

  Ok(out)
}
