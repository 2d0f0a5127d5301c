use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use stratum_lib::manifest::{ImageManifest, ManifestId, list_tags, load_manifest, resolve};

use super::open_store;
use crate::output::{self, OutputFormat};

#[derive(Serialize)]
struct Inspected<'a> {
  id: &'a ManifestId,
  #[serde(flatten)]
  manifest: &'a ImageManifest,
}

pub fn cmd_inspect(image: &str, env_only: bool, store_root: &Path, format: OutputFormat) -> Result<()> {
  let store = open_store(store_root)?;
  let id = resolve(&store, image).with_context(|| format!("Failed to resolve image '{}'", image))?;
  let manifest = load_manifest(&store, &id)?;

  if env_only {
    if format.is_json() {
      return output::json(&manifest.env);
    }
    for line in manifest.env_lines() {
      println!("{}", line);
    }
    return Ok(());
  }

  if format.is_json() {
    return output::json(&Inspected {
      id: &id,
      manifest: &manifest,
    });
  }

  println!("Image {}", id);
  output::stat("Base", &manifest.base);
  output::stat("Workdir", &manifest.workdir);
  output::stat("Layers", &manifest.layers.len().to_string());
  output::stat("Filesystem", output::short_id(&manifest.rootfs.0));
  if !manifest.env.is_empty() {
    println!("Environment:");
    for line in manifest.env_lines() {
      println!("  {}", line);
    }
  }
  if !manifest.labels.is_empty() {
    println!("Labels:");
    for (key, value) in &manifest.labels {
      println!("  {}={}", key, value);
    }
  }
  Ok(())
}

#[derive(Serialize)]
struct TagEntry {
  name: String,
  id: ManifestId,
}

pub fn cmd_tags(store_root: &Path, format: OutputFormat) -> Result<()> {
  let store = open_store(store_root)?;
  let tags: Vec<TagEntry> = list_tags(&store)?
    .into_iter()
    .map(|(name, id)| TagEntry { name, id })
    .collect();

  if format.is_json() {
    return output::json(&tags);
  }

  if tags.is_empty() {
    output::note("No tagged images");
    return Ok(());
  }
  for entry in &tags {
    println!("{:<32} {}", entry.name, output::short_id(&entry.id.0));
  }
  Ok(())
}
