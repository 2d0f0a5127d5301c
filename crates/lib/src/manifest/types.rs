//! The image manifest.
//!
//! A manifest is the result of a successful build: the ordered chain of
//! layers plus the runtime configuration that ENV, WORKDIR and LABEL steps
//! accumulated. It is content addressed, so two builds that produce the
//! same chain and configuration share one manifest id.
//!
//! # Example
//!
//! ```json
//! {
//!   "version": 1,
//!   "base": "scratch",
//!   "layers": ["9f2c...", "41ab..."],
//!   "rootfs": "41ab...",
//!   "env": { "TZ": "UTC" },
//!   "workdir": "/app",
//!   "labels": { "maintainer": "ops" }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::layer::LayerId;
use crate::util::hash::{Hashable, ObjectHash};

pub type ManifestId = ObjectHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
  pub version: u32,
  /// Base image reference as written in `FROM`, after substitution.
  pub base: String,
  /// Every layer of the build, in step order.
  pub layers: Vec<LayerId>,
  /// The layer holding the final filesystem.
  pub rootfs: LayerId,
  pub env: BTreeMap<String, String>,
  pub workdir: String,
  pub labels: BTreeMap<String, String>,
}

impl Hashable for ImageManifest {}

impl ImageManifest {
  /// The exported environment as `KEY=value` lines, sorted by key.
  pub fn env_lines(&self) -> Vec<String> {
    self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
  }

  /// The id of the last layer, if any.
  pub fn top_layer(&self) -> Option<&LayerId> {
    self.layers.last()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manifest() -> ImageManifest {
    ImageManifest {
      version: 1,
      base: "scratch".to_string(),
      layers: vec![ObjectHash("a".repeat(64)), ObjectHash("b".repeat(64))],
      rootfs: ObjectHash("a".repeat(64)),
      env: BTreeMap::from([
        ("TZ".to_string(), "UTC".to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
      ]),
      workdir: "/".to_string(),
      labels: BTreeMap::new(),
    }
  }

  #[test]
  fn env_lines_are_sorted() {
    assert_eq!(manifest().env_lines(), vec!["LANG=C.UTF-8", "TZ=UTC"]);
  }

  #[test]
  fn id_depends_on_environment() {
    let a = manifest();
    let mut b = manifest();
    b.env.insert("TZ".to_string(), "America/New_York".to_string());

    assert_eq!(a.compute_hash().unwrap(), manifest().compute_hash().unwrap());
    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn top_layer_is_last() {
    assert_eq!(manifest().top_layer(), Some(&ObjectHash("b".repeat(64))));
  }
}
