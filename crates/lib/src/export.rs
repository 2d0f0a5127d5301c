//! Export an image's filesystem as a gzip-compressed tarball.
//!
//! Entries are written in sorted path order with ownership and timestamps
//! normalized, so exporting the same image twice produces identical
//! archives.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

use crate::layer::{LayerStore, LayerStoreError};
use crate::manifest::ImageManifest;

#[derive(Debug, Error)]
pub enum ExportError {
  #[error(transparent)]
  Store(#[from] LayerStoreError),

  #[error("layer {0} holding the image filesystem is missing")]
  MissingRootfs(String),

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, serde::Serialize)]
pub struct ExportStats {
  pub entries: usize,
  pub bytes: u64,
}

/// Write the manifest's final rootfs to `output`.
pub fn export_rootfs(store: &LayerStore, manifest: &ImageManifest, output: &Path) -> Result<ExportStats, ExportError> {
  let record = store
    .lookup(&manifest.rootfs, false)?
    .ok_or_else(|| ExportError::MissingRootfs(manifest.rootfs.0.clone()))?;
  let rootfs = store.rootfs_dir(&record);

  let write_err = |source| ExportError::Write {
    path: output.to_path_buf(),
    source,
  };

  let parent = output
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  std::fs::create_dir_all(parent).map_err(write_err)?;
  let tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;

  let encoder = GzEncoder::new(tmp.reopen().map_err(write_err)?, Compression::default());
  let mut builder = tar::Builder::new(encoder);
  let entries = append_tree(&mut builder, &rootfs).map_err(write_err)?;
  let mut file = builder.into_inner().map_err(write_err)?.finish().map_err(write_err)?;
  file.flush().map_err(write_err)?;
  file.sync_all().map_err(write_err)?;

  let bytes = file.metadata().map_err(write_err)?.len();
  tmp.persist(output).map_err(|e| write_err(e.error))?;

  info!(path = %output.display(), entries, bytes, "exported image filesystem");
  Ok(ExportStats { entries, bytes })
}

fn append_tree(builder: &mut tar::Builder<GzEncoder<File>>, root: &Path) -> io::Result<usize> {
  let mut count = 0;

  for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }

    let metadata = entry.path().symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode_of(&metadata));

    let file_type = metadata.file_type();
    if file_type.is_dir() {
      header.set_entry_type(tar::EntryType::Directory);
      header.set_size(0);
      header.set_cksum();
      builder.append_data(&mut header, rel, io::empty())?;
    } else if file_type.is_file() {
      header.set_entry_type(tar::EntryType::Regular);
      header.set_size(metadata.len());
      header.set_cksum();
      builder.append_data(&mut header, rel, File::open(entry.path())?)?;
    } else if file_type.is_symlink() {
      header.set_entry_type(tar::EntryType::Symlink);
      header.set_size(0);
      header.set_mode(0o777);
      builder.append_link(&mut header, rel, std::fs::read_link(entry.path())?)?;
    } else {
      continue;
    }
    count += 1;
  }

  Ok(count)
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
  if metadata.is_dir() {
    0o755
  } else if metadata.permissions().readonly() {
    0o444
  } else {
    0o644
  }
}
