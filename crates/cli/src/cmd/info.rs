use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use stratum_lib::manifest::{list_manifests, list_tags};
use stratum_lib::platform::paths;
use stratum_lib::util::fs::dir_size;

use super::open_store;
use crate::output::{self, OutputFormat};

#[derive(Serialize)]
struct StoreInfo {
  version: &'static str,
  store: String,
  images: String,
  layers: usize,
  manifests: usize,
  tags: usize,
  bytes: u64,
}

pub fn cmd_info(store_root: &Path, format: OutputFormat) -> Result<()> {
  let store = open_store(store_root)?;
  let root = dunce::canonicalize(store.root()).unwrap_or_else(|_| store.root().to_path_buf());

  let info = StoreInfo {
    version: env!("CARGO_PKG_VERSION"),
    store: root.display().to_string(),
    images: paths::images_dir().display().to_string(),
    layers: store.list()?.len(),
    manifests: list_manifests(&store)?.len(),
    tags: list_tags(&store)?.len(),
    bytes: dir_size(&store.layers_dir()),
  };

  if format.is_json() {
    return output::json(&info);
  }

  println!("stratum {}", info.version);
  output::stat("Store", &info.store);
  output::stat("Base images", &info.images);
  output::stat("Layers", &info.layers.to_string());
  output::stat("Manifests", &info.manifests.to_string());
  output::stat("Tags", &info.tags.to_string());
  output::stat("Layer data", &output::human_bytes(info.bytes));
  Ok(())
}
