//! Append-only storage of upload content in `<id>.bin` files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::paths::{file_path, BIN_EXT};
use crate::{Result, StoreError};

/// Binary content of uploads.
///
/// The length of `<id>.bin` is the upload's offset; nothing else records it.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        file_path(&self.root, id, BIN_EXT)
    }

    /// Create an empty `.bin` file. Fails if one already exists.
    #[instrument(skip(self), level = "debug")]
    pub fn create(&self, id: &str) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(crate::DEFAULT_FILE_MODE);
        }

        options
            .open(self.path(id))
            .map_err(|e| StoreError::from_create(e, &self.root, id))?;
        Ok(())
    }

    /// Open the `.bin` file for appending. Never creates it.
    pub(crate) fn open_append(&self, id: &str) -> Result<File> {
        OpenOptions::new()
            .append(true)
            .open(self.path(id))
            .map_err(|e| StoreError::from_io(e, id))
    }

    /// Copy `src` to the end of the upload until it is exhausted.
    ///
    /// On a read or write error the bytes copied so far stay in the file.
    #[instrument(skip(self, src), level = "debug")]
    pub fn append<R: Read>(&self, id: &str, mut src: R) -> Result<u64> {
        let mut file = self.open_append(id)?;
        let written = io::copy(&mut src, &mut file)?;
        Ok(written)
    }

    /// Open the upload's content for sequential reading from the start.
    pub fn reader(&self, id: &str) -> Result<File> {
        File::open(self.path(id)).map_err(|e| StoreError::from_io(e, id))
    }

    /// Current length of the upload's content.
    pub fn offset(&self, id: &str) -> Result<u64> {
        let meta = fs::metadata(self.path(id)).map_err(|e| StoreError::from_io(e, id))?;
        Ok(meta.len())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        fs::remove_file(self.path(id)).map_err(|e| StoreError::from_io(e, id))
    }
}
