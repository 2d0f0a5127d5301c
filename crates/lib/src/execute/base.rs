//! `FROM` base image resolution.
//!
//! A base reference is one of:
//!
//! - `scratch`, an empty filesystem
//! - a name with a directory `<images>/<name>`
//! - a name with an archive `<images>/<name>.tar.gz`, `.tgz` or `.tar`
//! - an `http(s)://` URL to a tar or gzip-compressed tar archive, optionally
//!   pinned with a `#sha256=<hex>` suffix
//!
//! Each resolved base carries a digest of its content, which becomes part of
//! the `FROM` layer's cache key.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{BuildError, RetryPolicy};
use crate::consts::SCRATCH_IMAGE;
use crate::util::fs::copy_tree;
use crate::util::hash::{ContentHash, hash_bytes, hash_directory, hash_file};

const ARCHIVE_EXTENSIONS: &[&str] = &["tar.gz", "tgz", "tar"];

#[derive(Debug)]
enum Source {
  Scratch,
  Directory(PathBuf),
  Archive(PathBuf),
  Remote {
    url: String,
    sha256: String,
    bytes: Option<Vec<u8>>,
  },
}

/// A base image whose content digest is known.
#[derive(Debug)]
pub(crate) struct ResolvedBase {
  pub image: String,
  pub digest: ContentHash,
  source: Source,
}

fn unavailable(image: &str, message: impl Into<String>) -> BuildError {
  BuildError::BaseImageUnavailable {
    image: image.to_string(),
    message: message.into(),
  }
}

/// Locate a base image and compute its digest.
///
/// Unpinned URLs are downloaded here since their digest is their content.
pub(crate) async fn resolve_base(
  image: &str,
  images_dir: &Path,
  retry: &RetryPolicy,
  cancel: &CancellationToken,
) -> Result<ResolvedBase, BuildError> {
  let (source, digest) = if image == SCRATCH_IMAGE {
    (Source::Scratch, hash_bytes(b""))
  } else if image.starts_with("http://") || image.starts_with("https://") {
    let (url, pin) = split_pin(image).map_err(|message| unavailable(image, message))?;
    match pin {
      Some(sha256) => (
        Source::Remote {
          url: url.to_string(),
          sha256: sha256.clone(),
          bytes: None,
        },
        ContentHash(sha256),
      ),
      None => {
        warn!(url = %url, "base image URL is not pinned with #sha256=");
        let bytes = fetch_with_retry(image, url, retry, cancel).await?;
        let digest = hash_bytes(&bytes);
        (
          Source::Remote {
            url: url.to_string(),
            sha256: digest.0.clone(),
            bytes: Some(bytes),
          },
          digest,
        )
      }
    }
  } else {
    find_local(image, images_dir).await?
  };

  debug!(image = %image, digest = %digest, "resolved base image");
  Ok(ResolvedBase {
    image: image.to_string(),
    digest,
    source,
  })
}

impl ResolvedBase {
  /// Populate `rootfs` with the base image's filesystem.
  pub(crate) async fn materialize(
    self,
    rootfs: &Path,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
  ) -> Result<(), BuildError> {
    let image = self.image;
    let rootfs = rootfs.to_path_buf();
    info!(image = %image, "materializing base image");

    match self.source {
      Source::Scratch => tokio::fs::create_dir_all(&rootfs).await?,
      Source::Directory(dir) => {
        tokio::task::spawn_blocking(move || copy_tree(&dir, &rootfs))
          .await
          .map_err(io::Error::other)??;
      }
      Source::Archive(path) => {
        tokio::task::spawn_blocking(move || {
          let file = std::fs::File::open(&path)?;
          unpack(file, &rootfs)
        })
        .await
        .map_err(io::Error::other)?
        .map_err(|e| unavailable(&image, format!("failed to unpack archive: {}", e)))?;
      }
      Source::Remote { url, sha256, bytes } => {
        let bytes = match bytes {
          Some(bytes) => bytes,
          None => fetch_with_retry(&image, &url, retry, cancel).await?,
        };

        let actual = hash_bytes(&bytes);
        if actual.0 != sha256 {
          return Err(unavailable(
            &image,
            format!("sha256 mismatch: expected {}, got {}", sha256, actual),
          ));
        }

        tokio::task::spawn_blocking(move || unpack(io::Cursor::new(bytes), &rootfs))
          .await
          .map_err(io::Error::other)?
          .map_err(|e| unavailable(&image, format!("failed to unpack archive: {}", e)))?;
      }
    }

    Ok(())
  }
}

async fn find_local(image: &str, images_dir: &Path) -> Result<(Source, ContentHash), BuildError> {
  let valid_name = !image.is_empty()
    && !image.starts_with('.')
    && image
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
  if !valid_name {
    return Err(unavailable(image, "not a valid image name or URL"));
  }

  let dir = images_dir.join(image);
  if dir.is_dir() {
    let hashed = dir.clone();
    let digest = tokio::task::spawn_blocking(move || hash_directory(&hashed))
      .await
      .map_err(io::Error::other)??;
    return Ok((Source::Directory(dir), digest));
  }

  for ext in ARCHIVE_EXTENSIONS {
    let archive = images_dir.join(format!("{}.{}", image, ext));
    if archive.is_file() {
      let hashed = archive.clone();
      let digest = tokio::task::spawn_blocking(move || hash_file(&hashed))
        .await
        .map_err(io::Error::other)??;
      return Ok((Source::Archive(archive), digest));
    }
  }

  Err(unavailable(
    image,
    format!("no directory or archive named '{}' in {}", image, images_dir.display()),
  ))
}

/// Split `url#sha256=<hex>` into the URL and the pinned digest.
fn split_pin(reference: &str) -> Result<(&str, Option<String>), String> {
  let Some((url, fragment)) = reference.split_once('#') else {
    return Ok((reference, None));
  };

  let digest = fragment
    .strip_prefix("sha256=")
    .ok_or_else(|| format!("unsupported URL fragment '#{}'", fragment))?
    .to_ascii_lowercase();
  if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
    return Err(format!("invalid sha256 pin '{}'", digest));
  }

  Ok((url, Some(digest)))
}

/// Unpack a tar stream, gzip-compressed or not, into `dest`.
fn unpack(reader: impl Read, dest: &Path) -> io::Result<()> {
  let mut reader = io::BufReader::new(reader);
  std::fs::create_dir_all(dest)?;

  let gzipped = {
    use io::BufRead;
    reader.fill_buf()?.starts_with(&[0x1f, 0x8b])
  };

  if gzipped {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
  } else {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
  }
}

async fn fetch_with_retry(
  image: &str,
  url: &str,
  retry: &RetryPolicy,
  cancel: &CancellationToken,
) -> Result<Vec<u8>, BuildError> {
  let attempts = retry.max_attempts.max(1);
  let mut last_error = String::new();

  for attempt in 1..=attempts {
    if attempt > 1 {
      let delay = retry.backoff_delay(attempt - 1);
      debug!(url = %url, attempt, delay = ?delay, "retrying download");
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => return Err(BuildError::Cancelled),
      }
    }

    let result = tokio::select! {
      result = fetch(url) => result,
      _ = cancel.cancelled() => return Err(BuildError::Cancelled),
    };

    match result {
      Ok(bytes) => {
        info!(url = %url, size = bytes.len(), attempt, "downloaded base image");
        return Ok(bytes);
      }
      Err(e) => {
        warn!(url = %url, attempt, error = %e, "base image download failed");
        last_error = e;
      }
    }
  }

  Err(unavailable(
    image,
    format!("download failed after {} attempt(s): {}", attempts, last_error),
  ))
}

async fn fetch(url: &str) -> Result<Vec<u8>, String> {
  let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
  if !response.status().is_success() {
    return Err(format!("HTTP {}", response.status()));
  }
  let bytes = response.bytes().await.map_err(|e| e.to_string())?;
  Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use std::time::Duration;
  use tempfile::TempDir;

  fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(0o644);
      header.set_cksum();
      builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
  }

  async fn resolve(image: &str, images: &Path) -> Result<ResolvedBase, BuildError> {
    resolve_base(image, images, &RetryPolicy::default(), &CancellationToken::new()).await
  }

  #[tokio::test]
  async fn scratch_is_empty() {
    let temp = TempDir::new().unwrap();
    let base = resolve("scratch", temp.path()).await.unwrap();
    let rootfs = temp.path().join("rootfs");

    base
      .materialize(&rootfs, &RetryPolicy::default(), &CancellationToken::new())
      .await
      .unwrap();

    assert!(rootfs.is_dir());
    assert_eq!(fs::read_dir(&rootfs).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn directory_image_is_copied() {
    let temp = TempDir::new().unwrap();
    let images = temp.path().join("images");
    fs::create_dir_all(images.join("alpine/etc")).unwrap();
    fs::write(images.join("alpine/etc/os-release"), "alpine").unwrap();

    let base = resolve("alpine", &images).await.unwrap();
    let digest = base.digest.clone();
    let rootfs = temp.path().join("rootfs");
    base
      .materialize(&rootfs, &RetryPolicy::default(), &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(fs::read_to_string(rootfs.join("etc/os-release")).unwrap(), "alpine");
    assert_eq!(digest, hash_directory(&images.join("alpine")).unwrap());
  }

  #[tokio::test]
  async fn directory_digest_tracks_content() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("base")).unwrap();
    fs::write(temp.path().join("base/file"), "one").unwrap();
    let first = resolve("base", temp.path()).await.unwrap().digest;

    fs::write(temp.path().join("base/file"), "two").unwrap();
    let second = resolve("base", temp.path()).await.unwrap().digest;

    assert_ne!(first, second);
  }

  #[tokio::test]
  async fn archive_image_is_unpacked() {
    let temp = TempDir::new().unwrap();
    write_tar_gz(&temp.path().join("tools.tar.gz"), &[("bin/tool", "#!/bin/sh\n")]);

    let base = resolve("tools", temp.path()).await.unwrap();
    let rootfs = temp.path().join("rootfs");
    base
      .materialize(&rootfs, &RetryPolicy::default(), &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(fs::read_to_string(rootfs.join("bin/tool")).unwrap(), "#!/bin/sh\n");
  }

  #[tokio::test]
  async fn unknown_image_is_unavailable() {
    let temp = TempDir::new().unwrap();
    let err = resolve("missing", temp.path()).await.unwrap_err();
    assert!(matches!(err, BuildError::BaseImageUnavailable { .. }));
    assert_eq!(err.exit_code(), 69);
  }

  #[tokio::test]
  async fn path_like_names_are_rejected() {
    let temp = TempDir::new().unwrap();
    for image in ["../etc", "/abs", "a/b"] {
      let err = resolve(image, temp.path()).await.unwrap_err();
      assert!(matches!(err, BuildError::BaseImageUnavailable { .. }), "{image}");
    }
  }

  #[tokio::test]
  async fn unreachable_url_fails_after_retries() {
    let temp = TempDir::new().unwrap();
    let retry = RetryPolicy {
      max_attempts: 2,
      initial_delay: Duration::from_millis(1),
      multiplier: 2,
      max_delay: Duration::from_millis(5),
    };

    let err = resolve_base("http://127.0.0.1:9/base.tar.gz", temp.path(), &retry, &CancellationToken::new())
      .await
      .unwrap_err();

    match err {
      BuildError::BaseImageUnavailable { message, .. } => assert!(message.contains("2 attempt"), "{message}"),
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn pinned_url_uses_pin_as_digest() {
    let temp = TempDir::new().unwrap();
    let pin = "ab".repeat(32);
    let base = resolve(&format!("https://example.invalid/base.tar.gz#sha256={}", pin), temp.path())
      .await
      .unwrap();
    assert_eq!(base.digest.0, pin);
  }

  #[test]
  fn split_pin_forms() {
    assert_eq!(split_pin("https://h/x.tar").unwrap(), ("https://h/x.tar", None));
    let pin = "0f".repeat(32);
    assert_eq!(
      split_pin(&format!("https://h/x.tar#sha256={}", pin)).unwrap(),
      ("https://h/x.tar", Some(pin))
    );
    assert!(split_pin("https://h/x.tar#md5=abc").is_err());
    assert!(split_pin("https://h/x.tar#sha256=short").is_err());
  }

  #[test]
  fn unpack_plain_tar() {
    let temp = TempDir::new().unwrap();
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(2);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "hi.txt", &b"hi"[..]).unwrap();
    let data = builder.into_inner().unwrap();

    unpack(io::Cursor::new(data), &temp.path().join("out")).unwrap();
    assert_eq!(fs::read_to_string(temp.path().join("out/hi.txt")).unwrap(), "hi");
  }
}
