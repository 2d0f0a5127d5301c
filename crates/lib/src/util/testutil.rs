//! Test utilities for stratum-lib.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::execute::BuildConfig;
use crate::layer::LayerStore;
use crate::recipe::Recipe;

/// An isolated store, image directory and build context under one temp dir.
pub struct TestStore {
  pub temp: TempDir,
  pub store: LayerStore,
}

impl TestStore {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let store = LayerStore::open(temp.path().join("store")).unwrap();
    std::fs::create_dir_all(temp.path().join("images")).unwrap();
    std::fs::create_dir_all(temp.path().join("context")).unwrap();
    Self { temp, store }
  }

  pub fn images_dir(&self) -> PathBuf {
    self.temp.path().join("images")
  }

  pub fn context_dir(&self) -> PathBuf {
    self.temp.path().join("context")
  }

  pub fn config(&self) -> BuildConfig {
    BuildConfig {
      images_dir: self.images_dir(),
      context_dir: self.context_dir(),
      ..BuildConfig::default()
    }
  }

  /// Write a file into the build context.
  pub fn context_file(&self, rel: &str, content: &str) -> PathBuf {
    let path = self.context_dir().join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Create a local base image directory containing the given files.
  pub fn base_image(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = self.images_dir().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    for (rel, content) in files {
      let path = dir.join(rel);
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
      }
      std::fs::write(path, content).unwrap();
    }
    dir
  }

  /// Create a local base image holding a working `/bin/sh`.
  #[cfg(unix)]
  pub fn shell_image(&self, name: &str) -> PathBuf {
    let dir = self.base_image(name, &[]);
    install_shell(&dir);
    dir
  }
}

/// Copy the host's `/bin/sh` and the shared libraries it loads into `root`,
/// enough for shell-form commands made of builtins to run chrooted there.
/// Also creates `/etc` and `/tmp`.
#[cfg(unix)]
pub fn install_shell(root: &Path) {
  let sh = std::fs::canonicalize("/bin/sh").unwrap();
  copy_host_file(root, &sh, Path::new("/bin/sh"));

  // "libc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x...)" or
  // "/lib64/ld-linux-x86-64.so.2 (0x...)"; a static shell has none.
  if let Ok(out) = std::process::Command::new("ldd").arg(&sh).output() {
    for line in String::from_utf8_lossy(&out.stdout).lines() {
      let rest = line.split_once("=>").map_or(line, |(_, rest)| rest);
      if let Some(lib) = rest.split_whitespace().next()
        && lib.starts_with('/')
      {
        copy_host_file(root, Path::new(lib), Path::new(lib));
      }
    }
  }

  std::fs::create_dir_all(root.join("etc")).unwrap();
  std::fs::create_dir_all(root.join("tmp")).unwrap();
}

#[cfg(unix)]
fn copy_host_file(root: &Path, host: &Path, image: &Path) {
  let target = root.join(image.strip_prefix("/").unwrap());
  std::fs::create_dir_all(target.parent().unwrap()).unwrap();
  std::fs::copy(host, &target).unwrap();
}

pub fn recipe(src: &str) -> Recipe {
  Recipe::parse(src).unwrap()
}

pub fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
  pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn read(path: &Path) -> String {
  std::fs::read_to_string(path).unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}
