use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use stratum_lib::gc::collect_garbage;

use super::open_store;
use crate::output::{self, OutputFormat};

pub fn cmd_gc(dry_run: bool, store_root: &Path, format: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let store = open_store(store_root)?;
  let result = collect_garbage(&store, dry_run).context("Garbage collection failed")?;

  if format.is_json() {
    output::json(&result)?;
  } else {
    println!();
    if dry_run {
      output::note("Dry run - no changes made");
    } else {
      output::done("Garbage collection complete!");
    }
    output::stat("Layers scanned", &result.stats.layers_scanned.to_string());
    output::stat("Layers removed", &result.stats.layers_deleted.to_string());
    output::stat("Manifests removed", &result.stats.manifests_deleted.to_string());
    output::stat("Staging dirs removed", &result.stats.staging_deleted.to_string());
    output::stat("Space freed", &output::human_bytes(result.stats.bytes_freed));
    output::stat("Duration", &output::human_duration(start.elapsed()));
  }

  Ok(())
}
