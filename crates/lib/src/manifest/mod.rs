//! Image manifests and tags.
//!
//! A successful build persists an [`ImageManifest`] under
//! `<store>/manifests/<id>.json`. Tags under `<store>/tags/` give manifests
//! stable names and are the roots garbage collection keeps alive.

mod store;
mod types;

pub use store::{
  ManifestError, list_manifests, list_tags, load_manifest, remove_manifest, resolve, save_manifest, tag, untag,
  validate_tag,
};
pub use types::{ImageManifest, ManifestId};
