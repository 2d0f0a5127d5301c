//! Hashing utilities for content-addressed layers and verification.
//!
//! This module provides:
//! - `ObjectHash`: the SHA-256 of a value's canonical JSON form (layer ids, manifest ids)
//! - `ContentHash`: the SHA-256 of filesystem content
//! - `hash_directory()`: deterministic directory hashing
//! - `hash_file()` and `hash_bytes()`

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::SHORT_HASH_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a layer or manifest.
///
/// Lowercase hexadecimal SHA-256 of the JSON-serialized value. Struct fields
/// serialize in declaration order and maps are `BTreeMap`s, so the JSON form
/// is canonical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl ObjectHash {
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(SHORT_HASH_LEN)]
  }

  /// Accepts only full-length lowercase hex digests.
  pub fn parse(s: &str) -> Option<Self> {
    let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    valid.then(|| ObjectHash(s.to_string()))
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    Ok(ObjectHash(hash_bytes(serialized.as_bytes()).0))
  }
}

/// A SHA-256 over filesystem content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers the directory structure, file contents, the unix
/// permission bits of files and directories, and symlink targets. Timestamps
/// and ownership are ignored. Entries are visited in sorted path order.
pub fn hash_directory(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut hasher = Sha256::new();

  for entry in WalkDir::new(path).sort_by_file_name() {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      format!("L:{}:{}", rel_path, hash_bytes(target.to_string_lossy().as_bytes()).0)
    } else if file_type.is_file() {
      format!("F:{}:{:o}:{}", rel_path, mode_of(&entry), hash_file(entry_path)?.0)
    } else if file_type.is_dir() {
      format!("D:{}:{:o}", rel_path, mode_of(&entry))
    } else {
      // sockets, fifos and device nodes are not part of an image
      continue;
    };

    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

#[cfg(unix)]
fn mode_of(entry: &walkdir::DirEntry) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  entry.metadata().map(|m| m.permissions().mode() & 0o7777).unwrap_or(0)
}

#[cfg(not(unix))]
fn mode_of(entry: &walkdir::DirEntry) -> u32 {
  entry
    .metadata()
    .map(|m| if m.permissions().readonly() { 0o444 } else { 0o644 })
    .unwrap_or(0)
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}
