//! Upload metadata records stored as `<id>.info` JSON files.
//!
//! Field names follow the `.info` layout already on disk in existing upload
//! directories (`ID`, `Size`, `SizeIsDeferred`, ...), so stores written by
//! earlier deployments stay readable.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use tracing::instrument;

use crate::paths::{file_path, INFO_EXT};
use crate::{Result, StoreError};

/// Free-form upload metadata supplied by the client
pub type MetaData = HashMap<String, String>;

/// Metadata record of one upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInfo {
    #[serde(rename = "ID")]
    pub id: String,
    /// Declared total length, meaningless while `size_is_deferred`
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "SizeIsDeferred")]
    pub size_is_deferred: bool,
    /// Bytes stored so far. Persisted for readers of the raw file only:
    /// [`crate::MdfStore::get_info`] always recomputes it.
    #[serde(rename = "Offset")]
    pub offset: u64,
    #[serde(rename = "MetaData", deserialize_with = "null_as_default")]
    pub metadata: MetaData,
    #[serde(rename = "IsPartial")]
    pub is_partial: bool,
    #[serde(rename = "IsFinal")]
    pub is_final: bool,
    /// IDs of the partial uploads a final upload is assembled from
    #[serde(rename = "PartialUploads", deserialize_with = "null_as_default")]
    pub partial_uploads: Vec<String>,
}

impl FileInfo {
    pub fn with_size(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// A record whose length will be declared later
    pub fn deferred() -> Self {
        Self {
            size_is_deferred: true,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether all declared bytes have arrived
    pub fn is_complete(&self) -> bool {
        !self.size_is_deferred && self.offset == self.size
    }
}

/// `null` (written for empty maps and lists by older deployments) reads as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reads and replaces whole `.info` records.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        file_path(&self.root, id, INFO_EXT)
    }

    /// Replace the record of `id` with `info`.
    ///
    /// The record goes to a temporary file in the same directory which is
    /// synced and then renamed over `<id>.info`. Readers see either the old
    /// or the new record, never a truncated one. If anything fails before
    /// the rename the temporary file is removed on drop.
    #[instrument(skip(self, info), level = "debug")]
    pub fn write(&self, id: &str, info: &FileInfo) -> Result<()> {
        let tmp = NamedTempFile::new_in(&self.root)
            .map_err(|e| StoreError::from_create(e, &self.root, id))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(crate::DEFAULT_FILE_MODE))?;
        }

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, info).map_err(io::Error::from)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        tmp.persist(self.path(id)).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Load the record of `id` exactly as stored.
    pub fn read(&self, id: &str) -> Result<FileInfo> {
        let data = fs::read(self.path(id)).map_err(|e| StoreError::from_io(e, id))?;
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
            id: id.to_string(),
            source,
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        fs::remove_file(self.path(id)).map_err(|e| StoreError::from_io(e, id))
    }
}
