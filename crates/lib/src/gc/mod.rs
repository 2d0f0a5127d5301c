//! Garbage collection of unreferenced layers.
//!
//! Tags are the roots. Every layer a tagged manifest lists is live, and so
//! is everything reachable from a live layer through its `parent` and
//! `rootfs` links. Everything else is deleted, along with untagged
//! manifests and leftover staging directories. Collection takes the store's
//! exclusive lock, so it never runs alongside a build.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layer::{LayerId, LayerStore, LayerStoreError};
use crate::manifest::{ManifestError, list_manifests, list_tags, load_manifest, remove_manifest};
use crate::store_lock::{LockMode, StoreLock, StoreLockError};
use crate::util::fs::{dir_size, remove_tree};

#[derive(Debug, Error)]
pub enum GcError {
  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Store(#[from] LayerStoreError),

  #[error("failed to read store directory: {0}")]
  ReadStore(#[from] io::Error),
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GcStats {
  pub layers_scanned: usize,
  pub layers_deleted: usize,
  pub manifests_deleted: usize,
  pub staging_deleted: usize,
  pub bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.layers_deleted + self.manifests_deleted + self.staging_deleted
  }
}

#[derive(Debug, serde::Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
  pub dry_run: bool,
}

/// The store's layers as a graph with edges from each layer to the layers
/// it depends on.
struct LayerGraph {
  graph: DiGraph<LayerId, ()>,
  nodes: HashMap<LayerId, NodeIndex>,
}

impl LayerGraph {
  fn load(store: &LayerStore, ids: &[LayerId]) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for id in ids {
      nodes.insert(id.clone(), graph.add_node(id.clone()));
    }

    for id in ids {
      let record = match store.read_record(id) {
        Ok(record) => record,
        Err(e) => {
          warn!(layer = %id.short(), error = %e, "unreadable layer record");
          continue;
        }
      };

      let from = nodes[id];
      for dep in record.parent.iter().chain(std::iter::once(&record.rootfs)) {
        match nodes.get(dep) {
          Some(&to) if to != from => {
            graph.add_edge(from, to, ());
          }
          Some(_) => {}
          None => warn!(layer = %id.short(), missing = %dep.short(), "layer refers to a missing layer"),
        }
      }
    }

    Self { graph, nodes }
  }

  fn reachable(&self, roots: &HashSet<LayerId>) -> HashSet<LayerId> {
    let mut live = HashSet::new();
    for root in roots {
      let Some(&start) = self.nodes.get(root) else {
        warn!(layer = %root.short(), "tagged image refers to a missing layer");
        continue;
      };
      let mut dfs = Dfs::new(&self.graph, start);
      while let Some(node) = dfs.next(&self.graph) {
        live.insert(self.graph[node].clone());
      }
    }
    live
  }
}

/// Delete everything no tag keeps alive.
pub fn collect_garbage(store: &LayerStore, dry_run: bool) -> Result<GcResult, GcError> {
  let _lock = StoreLock::acquire(store.root(), LockMode::Exclusive, "gc")?;

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  let tagged: HashSet<_> = list_tags(store)?.into_iter().map(|(_, id)| id).collect();
  let mut roots = HashSet::new();
  for id in &tagged {
    match load_manifest(store, id) {
      Ok(manifest) => {
        roots.extend(manifest.layers.iter().cloned());
        roots.insert(manifest.rootfs.clone());
      }
      Err(e) => warn!(manifest = %id.short(), error = %e, "skipping unreadable manifest"),
    }
  }

  let ids = store.list()?;
  stats.layers_scanned = ids.len();
  let live = LayerGraph::load(store, &ids).reachable(&roots);
  debug!(roots = roots.len(), live = live.len(), "computed live layers");

  for id in ids.iter().filter(|id| !live.contains(*id)) {
    let path = store.layer_dir(id);
    let size = dir_size(&path);
    if !dry_run
      && let Err(e) = store.remove(id)
    {
      warn!(layer = %id.short(), error = %e, "failed to delete layer");
      continue;
    }
    debug!(layer = %id.short(), "removed unreferenced layer");
    stats.layers_deleted += 1;
    stats.bytes_freed += size;
    deleted_paths.push(path);
  }

  for id in list_manifests(store)?.into_iter().filter(|id| !tagged.contains(id)) {
    if !dry_run {
      remove_manifest(store, &id)?;
    }
    stats.manifests_deleted += 1;
    deleted_paths.push(store.manifests_dir().join(format!("{}.json", id.0)));
  }

  // staging directories can only belong to builds that died
  for entry in fs::read_dir(store.tmp_dir())?.flatten() {
    let path = entry.path();
    let size = dir_size(&path);
    if !dry_run
      && let Err(e) = remove_tree(&path)
    {
      warn!(path = %path.display(), error = %e, "failed to delete staging directory");
      continue;
    }
    stats.staging_deleted += 1;
    stats.bytes_freed += size;
    deleted_paths.push(path);
  }

  info!(
    layers_deleted = stats.layers_deleted,
    manifests_deleted = stats.manifests_deleted,
    staging_deleted = stats.staging_deleted,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult {
    stats,
    deleted_paths,
    dry_run,
  })
}
