//! Build recipes.
//!
//! A recipe is an ordered list of instructions (`FROM`, `ARG`, `ENV`, `RUN`,
//! `WORKDIR`, `LABEL`, `COPY`), one logical line each. Parsing only checks
//! structure; variable references are expanded later, step by step, against
//! the state the pipeline has accumulated so far.

mod parse;
mod types;

pub use parse::ParseError;
pub use types::*;
