//! Filesystem helpers shared by the layer store and step execution.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Recursively copy `src` into `dst`, preserving symlinks and permissions.
///
/// `dst` is created if missing. Special files (sockets, fifos, devices) are
/// skipped. Directory permissions are applied after their contents are
/// copied so read-only directories can still be populated.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
  fs::create_dir_all(dst)?;
  let mut dirs = Vec::new();

  for entry in WalkDir::new(src).follow_links(false) {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
      dirs.push((target, entry.metadata().map_err(io::Error::other)?.permissions()));
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target)?;
    } else if file_type.is_symlink() {
      copy_symlink(entry.path(), &target)?;
    }
  }

  for (dir, perms) in dirs.into_iter().rev() {
    fs::set_permissions(dir, perms)?;
  }

  Ok(())
}

/// Recreate the symlink at `src` as `dst`, replacing whatever `dst` is.
#[cfg(unix)]
pub fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  let target = fs::read_link(src)?;
  if dst.symlink_metadata().is_ok() {
    fs::remove_file(dst)?;
  }
  std::os::unix::fs::symlink(target, dst)
}

#[cfg(windows)]
pub fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  let target = fs::read_link(src)?;
  if src.is_dir() {
    std::os::windows::fs::symlink_dir(target, dst)
  } else {
    std::os::windows::fs::symlink_file(target, dst)
  }
}

/// Write `contents` to `path` so readers never observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  fs::create_dir_all(parent)?;
  let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
  tmp.write_all(contents)?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

/// Total size in bytes of the regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Remove a directory tree, including read-only directories inside it.
///
/// A missing `path` is not an error.
pub fn remove_tree(path: &Path) -> io::Result<()> {
  if path.symlink_metadata().is_err() {
    return Ok(());
  }

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(path).follow_links(false).into_iter().filter_map(|e| e.ok()) {
      if entry.file_type().is_dir()
        && let Ok(meta) = entry.metadata()
      {
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
          fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
        }
      }
    }
  }

  fs::remove_dir_all(path)
}

/// Lexically normalize an image path to an absolute, `/`-separated form.
///
/// Relative paths resolve against `base`. `..` never climbs above `/`.
pub fn normalize_image_path(base: &str, path: &str) -> String {
  let joined = if path.starts_with('/') {
    PathBuf::from(path)
  } else {
    Path::new(base).join(path)
  };

  let mut parts: Vec<String> = Vec::new();
  for component in joined.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
      Component::ParentDir => {
        parts.pop();
      }
      Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
    }
  }

  format!("/{}", parts.join("/"))
}

const MAX_SYMLINKS: usize = 40;

/// Resolve an absolute image path to a host path below `rootfs`.
///
/// Symlinks met along the way are followed the way a process chrooted into
/// `rootfs` would see them: absolute targets restart at `rootfs` and `..`
/// stops at the image root, so the result never leaves `rootfs`. Components
/// that do not exist yet are appended as written.
///
/// Fails when resolution meets more than 40 symlinks.
pub fn resolve_in_rootfs(rootfs: &Path, image_path: &str) -> io::Result<PathBuf> {
  let mut pending = Vec::new();
  push_components(&mut pending, Path::new(image_path));

  let mut resolved: Vec<OsString> = Vec::new();
  let mut links = 0;
  while let Some(part) = pending.pop() {
    if part == ".." {
      resolved.pop();
      continue;
    }

    let candidate = join_parts(rootfs, &resolved).join(&part);
    match fs::symlink_metadata(&candidate) {
      Ok(meta) if meta.file_type().is_symlink() => {
        links += 1;
        if links > MAX_SYMLINKS {
          return Err(io::Error::other(format!(
            "too many levels of symbolic links resolving {}",
            image_path
          )));
        }
        let target = fs::read_link(&candidate)?;
        if target.has_root() {
          resolved.clear();
        }
        push_components(&mut pending, &target);
      }
      _ => resolved.push(part),
    }
  }

  Ok(join_parts(rootfs, &resolved))
}

// Pushed in reverse so the first component is popped first.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
  let parts: Vec<OsString> = path
    .components()
    .filter_map(|component| match component {
      Component::Normal(part) => Some(part.to_os_string()),
      Component::ParentDir => Some(OsString::from("..")),
      Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
    .collect();
  stack.extend(parts.into_iter().rev());
}

fn join_parts(rootfs: &Path, parts: &[OsString]) -> PathBuf {
  let mut path = rootfs.to_path_buf();
  path.extend(parts);
  path
}
