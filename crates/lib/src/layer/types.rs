use serde::{Deserialize, Serialize};

use crate::execute::StepState;
use crate::recipe::StepKind;
use crate::util::hash::{ContentHash, HashError, Hashable, ObjectHash};

/// Identifies a layer. A layer's id is its cache key.
pub type LayerId = ObjectHash;

/// Everything that determines a step's result.
///
/// Chaining on `parent` means a change anywhere upstream changes every key
/// after it. `state` is the full snapshot the step observes, so any argument
/// or environment value a command could read is part of the key.
#[derive(Debug, Serialize)]
pub struct CacheKey<'a> {
  pub parent: Option<&'a LayerId>,
  pub kind: StepKind,
  /// The instruction payload after variable substitution.
  pub payload: &'a str,
  pub state: &'a StepState,
  /// Digest of external inputs (base image content, `COPY` sources).
  pub inputs: Option<&'a ContentHash>,
}

impl Hashable for CacheKey<'_> {}

impl CacheKey<'_> {
  pub fn layer_id(&self) -> Result<LayerId, HashError> {
    self.compute_hash()
  }
}

/// The persisted description of a layer (`layer.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
  pub version: u32,
  pub id: LayerId,
  pub parent: Option<LayerId>,
  pub kind: StepKind,
  /// The literal instruction that produced this layer.
  pub instruction: String,
  /// Pipeline state after this step.
  pub state: StepState,
  /// The layer whose `rootfs/` holds this layer's filesystem. Equal to `id`
  /// when the step produced its own filesystem snapshot.
  pub rootfs: LayerId,
  /// Content hash of `rootfs/`, present only when `rootfs == id`.
  pub content_hash: Option<ContentHash>,
}

impl LayerRecord {
  pub fn owns_rootfs(&self) -> bool {
    self.rootfs == self.id
  }
}
