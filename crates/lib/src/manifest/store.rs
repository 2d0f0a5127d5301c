//! Persisted manifests and tags.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use super::types::{ImageManifest, ManifestId};
use crate::layer::LayerStore;
use crate::util::fs::write_atomic;
use crate::util::hash::{Hashable, ObjectHash};

/// Shortest id prefix accepted by [`resolve`].
const MIN_PREFIX_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to serialize manifest: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("manifest {path} is unreadable: {message}")]
  Invalid { path: PathBuf, message: String },

  #[error("invalid tag name '{0}': use letters, digits, '.', '_' or '-'")]
  InvalidTag(String),

  #[error("no image named '{0}'")]
  NotFound(String),

  #[error("'{prefix}' is ambiguous: matches {count} manifests")]
  Ambiguous { prefix: String, count: usize },
}

fn manifest_path(store: &LayerStore, id: &ManifestId) -> PathBuf {
  store.manifests_dir().join(format!("{}.json", id.0))
}

fn tag_path(store: &LayerStore, name: &str) -> PathBuf {
  store.tags_dir().join(name)
}

/// Tag names are single path components made of `[A-Za-z0-9._-]`.
pub fn validate_tag(name: &str) -> Result<(), ManifestError> {
  let valid = !name.is_empty()
    && name.len() <= 128
    && !name.starts_with('.')
    && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
  if valid {
    Ok(())
  } else {
    Err(ManifestError::InvalidTag(name.to_string()))
  }
}

/// Persist a manifest under its content hash and return the id.
pub fn save_manifest(store: &LayerStore, manifest: &ImageManifest) -> Result<ManifestId, ManifestError> {
  let id = manifest.compute_hash()?;
  let path = manifest_path(store, &id);

  if path.exists() {
    debug!(manifest = %id.short(), "manifest already stored");
    return Ok(id);
  }

  let json = serde_json::to_vec_pretty(manifest)?;
  write_atomic(&path, &json).map_err(|source| ManifestError::Write { path, source })?;
  info!(manifest = %id.short(), layers = manifest.layers.len(), "saved manifest");
  Ok(id)
}

pub fn load_manifest(store: &LayerStore, id: &ManifestId) -> Result<ImageManifest, ManifestError> {
  let path = manifest_path(store, id);
  let data = match fs::read(&path) {
    Ok(data) => data,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ManifestError::NotFound(id.0.clone())),
    Err(source) => return Err(ManifestError::Read { path, source }),
  };

  serde_json::from_slice(&data).map_err(|e| ManifestError::Invalid {
    path,
    message: e.to_string(),
  })
}

/// Point `name` at a manifest, replacing any previous target.
pub fn tag(store: &LayerStore, name: &str, id: &ManifestId) -> Result<(), ManifestError> {
  validate_tag(name)?;
  let path = tag_path(store, name);
  write_atomic(&path, format!("{}\n", id.0).as_bytes()).map_err(|source| ManifestError::Write { path, source })?;
  info!(tag = %name, manifest = %id.short(), "tagged image");
  Ok(())
}

/// Remove a tag. Returns whether it existed.
pub fn untag(store: &LayerStore, name: &str) -> Result<bool, ManifestError> {
  validate_tag(name)?;
  let path = tag_path(store, name);
  match fs::remove_file(&path) {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(source) => Err(ManifestError::Write { path, source }),
  }
}

fn read_tag(store: &LayerStore, name: &str) -> Result<Option<ManifestId>, ManifestError> {
  let path = tag_path(store, name);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(source) => return Err(ManifestError::Read { path, source }),
  };

  ObjectHash::parse(content.trim()).map(Some).ok_or_else(|| ManifestError::Invalid {
    path,
    message: "tag does not contain a manifest id".to_string(),
  })
}

/// All tags with their manifest ids, sorted by name.
pub fn list_tags(store: &LayerStore) -> Result<Vec<(String, ManifestId)>, ManifestError> {
  let dir = store.tags_dir();
  let entries = fs::read_dir(&dir).map_err(|source| ManifestError::Read { path: dir, source })?;

  let mut tags = Vec::new();
  for entry in entries.flatten() {
    let name = entry.file_name().to_string_lossy().to_string();
    if validate_tag(&name).is_err() {
      continue;
    }
    if let Some(id) = read_tag(store, &name)? {
      tags.push((name, id));
    }
  }
  tags.sort();
  Ok(tags)
}

/// Ids of every stored manifest.
pub fn list_manifests(store: &LayerStore) -> Result<Vec<ManifestId>, ManifestError> {
  let dir = store.manifests_dir();
  let entries = fs::read_dir(&dir).map_err(|source| ManifestError::Read { path: dir, source })?;

  let mut ids: Vec<ManifestId> = entries
    .flatten()
    .filter_map(|e| {
      let name = e.file_name().to_string_lossy().to_string();
      name.strip_suffix(".json").and_then(ObjectHash::parse)
    })
    .collect();
  ids.sort();
  Ok(ids)
}

pub fn remove_manifest(store: &LayerStore, id: &ManifestId) -> Result<(), ManifestError> {
  let path = manifest_path(store, id);
  match fs::remove_file(&path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(ManifestError::Write { path, source }),
  }
}

/// Resolve a tag name, a full manifest id, or a unique id prefix.
pub fn resolve(store: &LayerStore, reference: &str) -> Result<ManifestId, ManifestError> {
  if validate_tag(reference).is_ok()
    && let Some(id) = read_tag(store, reference)?
  {
    return Ok(id);
  }

  if let Some(id) = ObjectHash::parse(reference) {
    return if manifest_path(store, &id).exists() {
      Ok(id)
    } else {
      Err(ManifestError::NotFound(reference.to_string()))
    };
  }

  if reference.len() >= MIN_PREFIX_LEN {
    let mut matches: Vec<ManifestId> = list_manifests(store)?
      .into_iter()
      .filter(|id| id.0.starts_with(reference))
      .collect();
    match matches.len() {
      0 => {}
      1 => return Ok(matches.remove(0)),
      count => {
        return Err(ManifestError::Ambiguous {
          prefix: reference.to_string(),
          count,
        });
      }
    }
  }

  Err(ManifestError::NotFound(reference.to_string()))
}
