//! Crate-wide constants.

pub const APP_NAME: &str = "stratum";

/// Environment variable overriding the layer store location.
pub const STORE_ENV: &str = "STRATUM_STORE";

/// Environment variable overriding the local base-image directory.
pub const IMAGES_ENV: &str = "STRATUM_IMAGES";

/// `PATH` handed to `RUN` steps when the image environment does not define one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Base image name that resolves to an empty filesystem.
pub const SCRATCH_IMAGE: &str = "scratch";

/// On-disk format version for layer records and manifests.
pub const FORMAT_VERSION: u32 = 1;

/// Length of the abbreviated hash shown in logs and CLI output.
pub const SHORT_HASH_LEN: usize = 12;

/// How much of a failed command's output is kept for error reports.
pub const OUTPUT_TAIL_BYTES: usize = 16 * 1024;
