//! `COPY` from the build context.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::types::BuildError;
use crate::util::fs::{copy_symlink, normalize_image_path, resolve_in_rootfs};
use crate::util::hash::{ContentHash, hash_bytes, hash_directory, hash_file};

/// A context path that passed the containment checks.
#[derive(Debug, Clone)]
pub(crate) struct CopySource {
  /// Path as written, relative to the context.
  pub name: String,
  pub path: PathBuf,
}

fn source_error(name: &str, message: impl Into<String>) -> BuildError {
  BuildError::CopySource {
    path: name.to_string(),
    message: message.into(),
  }
}

/// Resolve `COPY` sources against the build context.
///
/// Sources must exist and stay inside the context, including after
/// following symlinks.
pub(crate) fn resolve_sources(context: &Path, sources: &[String]) -> Result<Vec<CopySource>, BuildError> {
  let context = fs::canonicalize(context).map_err(|e| {
    source_error(
      &context.display().to_string(),
      format!("build context is not accessible: {}", e),
    )
  })?;

  sources
    .iter()
    .map(|name| {
      let mut depth = 0usize;
      for component in Path::new(name.trim_start_matches('/')).components() {
        match component {
          Component::Normal(_) => depth += 1,
          Component::ParentDir if depth == 0 => return Err(source_error(name, "escapes the build context")),
          Component::ParentDir => depth -= 1,
          _ => {}
        }
      }

      let joined = context.join(name.trim_start_matches('/'));
      let path = fs::canonicalize(&joined).map_err(|_| source_error(name, "no such file or directory"))?;
      if !path.starts_with(&context) {
        return Err(source_error(name, "escapes the build context"));
      }

      Ok(CopySource {
        name: name.clone(),
        path,
      })
    })
    .collect()
}

/// Digest of the sources' names and content.
pub(crate) fn digest_sources(sources: &[CopySource]) -> Result<ContentHash, BuildError> {
  let mut lines = String::new();
  for source in sources {
    let hash = if source.path.is_dir() {
      hash_directory(&source.path)?
    } else {
      hash_file(&source.path)?
    };
    lines.push_str(&source.name);
    lines.push(':');
    lines.push_str(&hash.0);
    lines.push('\n');
  }
  Ok(hash_bytes(lines.as_bytes()))
}

/// Copy resolved sources into `rootfs`.
///
/// `dest` resolves against `workdir`. A directory source copies its
/// contents. A file source lands at `dest` itself unless `dest` ends in `/`
/// or is an existing directory, in which case it keeps its file name.
/// Every target is resolved inside `rootfs`, so symlinks in the image never
/// redirect a write onto the host.
pub(crate) fn apply_copy(rootfs: &Path, workdir: &str, sources: &[CopySource], dest: &str) -> Result<(), BuildError> {
  let dest_path = normalize_image_path(workdir, dest);
  let host_dest = resolve(rootfs, &dest_path)?;
  let dest_is_dir = dest.ends_with('/') || host_dest.is_dir() || sources.len() > 1;

  if sources.len() > 1 && !dest.ends_with('/') && !host_dest.is_dir() {
    return Err(BuildError::PathError {
      path: dest_path,
      message: "COPY with multiple sources needs a directory destination ending in '/'".to_string(),
    });
  }

  for source in sources {
    if source.path.is_dir() {
      if host_dest.exists() && !host_dest.is_dir() {
        return Err(BuildError::PathError {
          path: dest_path,
          message: "exists and is not a directory".to_string(),
        });
      }
      debug!(source = %source.name, dest = %dest_path, "copying directory");
      copy_dir_into(rootfs, &source.path, &dest_path)?;
      continue;
    }

    let target = if dest_is_dir {
      let file_name = source
        .path
        .file_name()
        .ok_or_else(|| source_error(&source.name, "has no file name"))?;
      normalize_image_path(&dest_path, &file_name.to_string_lossy())
    } else {
      dest_path.clone()
    };
    debug!(source = %source.name, target = %target, "copying file");
    copy_file_into(rootfs, &source.path, &target)?;
  }

  Ok(())
}

fn resolve(rootfs: &Path, image_path: &str) -> Result<PathBuf, BuildError> {
  resolve_in_rootfs(rootfs, image_path).map_err(|e| BuildError::PathError {
    path: image_path.to_string(),
    message: e.to_string(),
  })
}

fn copy_file_into(rootfs: &Path, src: &Path, image_path: &str) -> Result<(), BuildError> {
  let target = resolve(rootfs, image_path)?;
  if target.is_dir() {
    return Err(BuildError::PathError {
      path: image_path.to_string(),
      message: "a directory is in the way of the copied file".to_string(),
    });
  }
  if let Some(parent) = target.parent() {
    if parent.exists() && !parent.is_dir() {
      return Err(BuildError::PathError {
        path: image_path.to_string(),
        message: "parent exists and is not a directory".to_string(),
      });
    }
    fs::create_dir_all(parent)?;
  }
  fs::copy(src, &target)?;
  Ok(())
}

fn copy_dir_into(rootfs: &Path, src: &Path, image_dir: &str) -> Result<(), BuildError> {
  for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let image_path = normalize_image_path(image_dir, &rel.to_string_lossy());
    let file_type = entry.file_type();

    if file_type.is_dir() {
      let dir = resolve(rootfs, &image_path)?;
      if dir.exists() && !dir.is_dir() {
        return Err(BuildError::PathError {
          path: image_path,
          message: "exists and is not a directory".to_string(),
        });
      }
      fs::create_dir_all(&dir)?;
    } else if file_type.is_file() {
      copy_file_into(rootfs, entry.path(), &image_path)?;
    } else if file_type.is_symlink() {
      // The link itself is recreated; only its parent is resolved.
      let parent = resolve(rootfs, &normalize_image_path(&image_path, ".."))?;
      copy_symlink(entry.path(), &parent.join(entry.file_name()))?;
    }
  }
  Ok(())
}
