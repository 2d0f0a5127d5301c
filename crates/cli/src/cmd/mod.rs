mod build;
mod export;
mod gc;
mod info;
mod inspect;

pub use build::{BuildArgs, cmd_build};
pub use export::cmd_export;
pub use gc::cmd_gc;
pub use info::cmd_info;
pub use inspect::{cmd_inspect, cmd_tags};

use std::path::Path;

use anyhow::{Context, Result};
use stratum_lib::layer::LayerStore;

/// Open the store at `root`, creating its layout if needed.
fn open_store(root: &Path) -> Result<LayerStore> {
  LayerStore::open(root).with_context(|| format!("Failed to open store at {}", root.display()))
}
