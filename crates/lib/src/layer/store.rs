//! On-disk layer storage.
//!
//! Layout under the store root:
//!
//! ```text
//! layers/<id>/layer.json   layer record
//! layers/<id>/rootfs/      filesystem snapshot (filesystem layers only)
//! tmp/                     staging directories
//! manifests/               image manifests
//! tags/                    tag files
//! ```
//!
//! Writers build a layer inside `tmp/` and publish it with a single rename,
//! so a reader either sees a complete layer or none at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{LayerId, LayerRecord};
use crate::consts::FORMAT_VERSION;
use crate::util::fs::{remove_tree, write_atomic};
use crate::util::hash::{DirHashError, ObjectHash, hash_directory};

const RECORD_FILE: &str = "layer.json";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, Error)]
pub enum LayerStoreError {
  #[error("failed to create store directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to stage layer under {path}: {source}")]
  Stage {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read layer {id}: {source}")]
  Read {
    id: LayerId,
    #[source]
    source: io::Error,
  },

  #[error("failed to publish layer {id}: {source}")]
  Publish {
    id: LayerId,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove layer {id}: {source}")]
  Remove {
    id: LayerId,
    #[source]
    source: io::Error,
  },

  #[error("failed to list {path}: {source}")]
  List {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to hash layer content: {0}")]
  Hash(#[from] DirHashError),

  #[error("layer {id} is corrupt: {message}")]
  Corrupt { id: LayerId, message: String },
}

/// A layer under construction in the store's staging area.
///
/// Dropping a staged layer without publishing it discards its contents.
#[derive(Debug)]
pub struct StagedLayer {
  dir: TempDir,
}

impl StagedLayer {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Where a filesystem layer's snapshot is assembled.
  pub fn rootfs(&self) -> PathBuf {
    self.dir.path().join(ROOTFS_DIR)
  }

  fn discard(self) {
    if let Err(e) = remove_tree(self.dir.path()) {
      warn!(path = %self.dir.path().display(), error = %e, "failed to discard staged layer");
    }
  }
}

/// Result of publishing a staged layer.
#[derive(Debug)]
pub struct Published {
  pub record: LayerRecord,
  /// Another writer published the same id first and its layer was kept.
  pub adopted: bool,
}

/// A content-addressed store of build layers.
#[derive(Debug, Clone)]
pub struct LayerStore {
  root: PathBuf,
}

impl LayerStore {
  /// Open a store rooted at `root`, creating its directories if needed.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, LayerStoreError> {
    let store = Self { root: root.into() };
    for dir in [store.layers_dir(), store.tmp_dir(), store.manifests_dir(), store.tags_dir()] {
      fs::create_dir_all(&dir).map_err(|source| LayerStoreError::CreateDir { path: dir.clone(), source })?;
    }
    Ok(store)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn layers_dir(&self) -> PathBuf {
    self.root.join("layers")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join("tmp")
  }

  pub fn manifests_dir(&self) -> PathBuf {
    self.root.join("manifests")
  }

  pub fn tags_dir(&self) -> PathBuf {
    self.root.join("tags")
  }

  pub fn layer_dir(&self, id: &LayerId) -> PathBuf {
    self.layers_dir().join(&id.0)
  }

  /// The filesystem snapshot a record points at.
  pub fn rootfs_dir(&self, record: &LayerRecord) -> PathBuf {
    self.layer_dir(&record.rootfs).join(ROOTFS_DIR)
  }

  pub fn contains(&self, id: &LayerId) -> bool {
    self.layer_dir(id).is_dir()
  }

  /// Read a layer record without verifying its content.
  pub fn read_record(&self, id: &LayerId) -> Result<LayerRecord, LayerStoreError> {
    let path = self.layer_dir(id).join(RECORD_FILE);
    let data = match fs::read(&path) {
      Ok(data) => data,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(LayerStoreError::Corrupt {
          id: id.clone(),
          message: "layer.json is missing".to_string(),
        });
      }
      Err(source) => return Err(LayerStoreError::Read { id: id.clone(), source }),
    };

    serde_json::from_slice(&data).map_err(|e| LayerStoreError::Corrupt {
      id: id.clone(),
      message: format!("unreadable layer.json: {}", e),
    })
  }

  /// Look up a published layer.
  ///
  /// Returns `Ok(None)` when no layer with `id` exists. With `verify`, a
  /// filesystem layer's content is re-hashed and compared with its record.
  /// Any disagreement is reported as [`LayerStoreError::Corrupt`].
  pub fn lookup(&self, id: &LayerId, verify: bool) -> Result<Option<LayerRecord>, LayerStoreError> {
    if !self.contains(id) {
      return Ok(None);
    }

    let record = self.read_record(id)?;
    let corrupt = |message: String| LayerStoreError::Corrupt { id: id.clone(), message };

    if &record.id != id {
      return Err(corrupt(format!("record names layer {}", record.id)));
    }

    let rootfs = self.rootfs_dir(&record);
    if !rootfs.is_dir() {
      return Err(corrupt(format!("rootfs {} is missing", rootfs.display())));
    }

    if verify && record.owns_rootfs() {
      let expected = record
        .content_hash
        .as_ref()
        .ok_or_else(|| corrupt("record has no content hash".to_string()))?;
      let actual = hash_directory(&rootfs)?;
      if &actual != expected {
        return Err(corrupt(format!("content hash {} does not match recorded {}", actual, expected)));
      }
      debug!(layer = %id.short(), "verified layer content");
    }

    Ok(Some(record))
  }

  /// Create a private staging directory for a new layer.
  pub fn stage(&self) -> Result<StagedLayer, LayerStoreError> {
    let tmp = self.tmp_dir();
    let dir = tempfile::Builder::new()
      .prefix("stage-")
      .tempdir_in(&tmp)
      .map_err(|source| LayerStoreError::Stage { path: tmp, source })?;
    Ok(StagedLayer { dir })
  }

  /// Atomically publish a staged layer under `record.id`.
  ///
  /// For a filesystem layer the staged `rootfs/` is hashed into
  /// `record.content_hash` first. If the id is already present, the staged
  /// copy is discarded and the existing layer is returned instead.
  pub fn publish(&self, staged: StagedLayer, mut record: LayerRecord) -> Result<Published, LayerStoreError> {
    let id = record.id.clone();
    let publish_err = |source| LayerStoreError::Publish { id: id.clone(), source };

    record.version = FORMAT_VERSION;
    if record.owns_rootfs() {
      fs::create_dir_all(staged.rootfs()).map_err(publish_err)?;
      record.content_hash = Some(hash_directory(&staged.rootfs())?);
    } else {
      record.content_hash = None;
    }

    if self.contains(&id) {
      staged.discard();
      return self.adopt(&id);
    }

    let json = serde_json::to_vec_pretty(&record).map_err(|e| publish_err(io::Error::other(e)))?;
    write_atomic(&staged.path().join(RECORD_FILE), &json).map_err(publish_err)?;

    let target = self.layer_dir(&id);
    match fs::rename(staged.path(), &target) {
      Ok(()) => {
        // the TempDir guard now points at nothing; its cleanup is a no-op
        drop(staged);
        info!(layer = %id.short(), kind = %record.kind, "published layer");
        Ok(Published { record, adopted: false })
      }
      Err(e) if self.contains(&id) => {
        debug!(layer = %id.short(), error = %e, "lost publish race");
        staged.discard();
        self.adopt(&id)
      }
      Err(source) => {
        staged.discard();
        Err(LayerStoreError::Publish { id, source })
      }
    }
  }

  fn adopt(&self, id: &LayerId) -> Result<Published, LayerStoreError> {
    info!(layer = %id.short(), "layer already published, adopting existing copy");
    let record = self.lookup(id, false)?.ok_or_else(|| LayerStoreError::Corrupt {
      id: id.clone(),
      message: "layer vanished after publish".to_string(),
    })?;
    Ok(Published { record, adopted: true })
  }

  /// Ids of every layer directory in the store.
  pub fn list(&self) -> Result<Vec<LayerId>, LayerStoreError> {
    let dir = self.layers_dir();
    let entries = fs::read_dir(&dir).map_err(|source| LayerStoreError::List { path: dir, source })?;

    let mut ids: Vec<LayerId> = entries
      .filter_map(|e| e.ok())
      .filter(|e| e.path().is_dir())
      .filter_map(|e| ObjectHash::parse(&e.file_name().to_string_lossy()))
      .collect();
    ids.sort();
    Ok(ids)
  }

  pub fn remove(&self, id: &LayerId) -> Result<(), LayerStoreError> {
    remove_tree(&self.layer_dir(id)).map_err(|source| LayerStoreError::Remove { id: id.clone(), source })
  }
}
