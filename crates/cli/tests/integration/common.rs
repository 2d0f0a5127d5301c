//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Read fixture content.
pub fn fixture_content(name: &str) -> String {
  std::fs::read_to_string(fixture_path(name)).unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", name, e))
}

#[cfg(unix)]
fn copy_into_image(root: &std::path::Path, host: &std::path::Path, image_path: &str) {
  let target = root.join(image_path.trim_start_matches('/'));
  std::fs::create_dir_all(target.parent().unwrap()).unwrap();
  std::fs::copy(host, target).unwrap();
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the recipe, build
/// context, layer store and base-image directory.
pub struct TestEnv {
  pub temp: TempDir,
  pub recipe_path: PathBuf,
}

impl TestEnv {
  /// Create from a fixture recipe, copied to `Stratumfile` in the temp dir.
  /// The `toolbox` base image is available.
  pub fn from_fixture(name: &str) -> Self {
    Self::from_recipe(&fixture_content(name))
  }

  /// Create from inline recipe text. The `toolbox` base image is available.
  pub fn from_recipe(src: &str) -> Self {
    let env = Self::empty();
    std::fs::write(&env.recipe_path, src).unwrap();
    #[cfg(unix)]
    env.base_image_with_shell("toolbox");
    env
  }

  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    let recipe_path = temp.path().join("Stratumfile");
    Self { temp, recipe_path }
  }

  /// Write a file relative to the temp directory, which is also the build context.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Store path (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    let p = self.temp.path().join("store");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Directory searched for local base images.
  pub fn images_path(&self) -> PathBuf {
    let p = self.temp.path().join("images");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Create a base image holding the host's `/bin/sh` and the shared
  /// libraries it loads, so shell builtins work inside the image.
  #[cfg(unix)]
  pub fn base_image_with_shell(&self, name: &str) -> PathBuf {
    let root = self.images_path().join(name);
    let sh = std::fs::canonicalize("/bin/sh").unwrap();
    copy_into_image(&root, &sh, "/bin/sh");

    if let Ok(out) = std::process::Command::new("ldd").arg(&sh).output() {
      for line in String::from_utf8_lossy(&out.stdout).lines() {
        let rest = line.split_once("=>").map_or(line, |(_, rest)| rest);
        if let Some(lib) = rest.split_whitespace().next()
          && lib.starts_with('/')
        {
          copy_into_image(&root, std::path::Path::new(lib), lib);
        }
      }
    }
    std::fs::create_dir_all(root.join("etc")).unwrap();
    root
  }

  /// Get a pre-configured Command for the stratum binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `STRATUM_STORE`: Isolated layer store
  /// - `STRATUM_IMAGES`: Isolated base-image directory
  /// - `RUST_LOG`: Cleared so log output stays at the default level
  pub fn stratum_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("stratum");
    cmd.env("STRATUM_STORE", self.store_path());
    cmd.env("STRATUM_IMAGES", self.images_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `stratum build` of this environment's recipe.
  pub fn build_cmd(&self) -> Command {
    let mut cmd = self.stratum_cmd();
    cmd.arg("build").arg(&self.recipe_path);
    cmd
  }

  /// Number of layers in the store.
  pub fn layer_count(&self) -> usize {
    match std::fs::read_dir(self.store_path().join("layers")) {
      Ok(entries) => entries.count(),
      Err(_) => 0,
    }
  }
}
