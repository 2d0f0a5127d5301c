use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use stratum_lib::export::export_rootfs;
use stratum_lib::manifest::{load_manifest, resolve};

use super::open_store;
use crate::output::{self, OutputFormat};

pub fn cmd_export(image: &str, output_file: &Path, store_root: &Path, format: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let store = open_store(store_root)?;
  let id = resolve(&store, image).with_context(|| format!("Failed to resolve image '{}'", image))?;
  let manifest = load_manifest(&store, &id)?;

  let stats = export_rootfs(&store, &manifest, output_file)
    .with_context(|| format!("Failed to export image to {}", output_file.display()))?;

  if format.is_json() {
    output::json(&stats)?;
  } else {
    output::done(&format!("Exported {}", output_file.display()));
    output::stat("Entries", &stats.entries.to_string());
    output::stat("Size", &output::human_bytes(stats.bytes));
    output::stat("Duration", &output::human_duration(start.elapsed()));
  }
  Ok(())
}
