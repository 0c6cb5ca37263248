//! Mapping from upload IDs to their files under the upload root.

use std::path::{Path, PathBuf};

/// Extension of the binary content file
pub const BIN_EXT: &str = "bin";
/// Extension of the metadata file
pub const INFO_EXT: &str = "info";
/// Extension of the lock file
pub const LOCK_EXT: &str = "lock";

/// The files that make up one upload.
///
/// Resolution is pure string joining: nothing is checked on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPaths {
    pub bin: PathBuf,
    pub info: PathBuf,
    pub lock: PathBuf,
}

impl UploadPaths {
    pub fn resolve(root: &Path, id: &str) -> Self {
        Self {
            bin: file_path(root, id, BIN_EXT),
            info: file_path(root, id, INFO_EXT),
            lock: file_path(root, id, LOCK_EXT),
        }
    }
}

pub(crate) fn file_path(root: &Path, id: &str, ext: &str) -> PathBuf {
    root.join(format!("{}.{}", id, ext))
}
