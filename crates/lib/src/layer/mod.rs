//! Content-addressed build layers.
//!
//! Every executed step produces a [`LayerRecord`] identified by its cache key.
//! Steps that change the filesystem own a `rootfs/` snapshot. Metadata steps
//! produce empty layers that point at their nearest filesystem ancestor.

mod store;
mod types;

pub use store::{LayerStore, LayerStoreError, Published, StagedLayer};
pub use types::{CacheKey, LayerId, LayerRecord};
