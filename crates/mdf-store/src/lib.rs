//! # mdf-store
//!
//! Filesystem storage backend for resumable uploads.
//!
//! Every upload lives as flat files under a single, pre-existing root:
//!
//! ```text
//! <root>/
//! ├── <id>.bin    # raw upload content, offset = file length
//! ├── <id>.info   # JSON metadata record
//! └── <id>.lock   # exists only while the upload is locked
//! ```
//!
//! The store exposes primitive operations for a resumable-upload protocol
//! layer: chunk appends, metadata read-modify-write, advisory per-upload
//! locking, concatenation of finished uploads, and a post-processing
//! pipeline that runs an external converter over a completed `.bin` file.
//!
//! Nothing here serializes access on its own. Callers that need exclusive
//! access must bracket their work with [`MdfStore::lock_upload`] and
//! [`MdfStore::unlock_upload`].

pub mod chunk;
pub mod compose;
pub mod concat;
pub mod convert;
pub mod info;
pub mod lock;
pub mod paths;
pub mod uid;

pub use chunk::ChunkStore;
pub use compose::{Concater, DataStore, Finisher, GetReader, LengthDeferrer, Locker, Terminater};
pub use convert::{ConversionReport, Converter, OutputSink, OutputStream, TracingSink};
pub use info::{FileInfo, MetaData, MetadataStore};
pub use lock::LockManager;
pub use mdf_config::ExitPolicy;
pub use paths::UploadPaths;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use mdf_config::{log_store_info, log_store_warn, Config};
use thiserror::Error;
use tracing::instrument;

/// Permission bits for `.bin` and `.info` files
pub const DEFAULT_FILE_MODE: u32 = 0o664;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("upload directory does not exist: {}", root.display())]
    StorageRootMissing { root: PathBuf },

    #[error("upload not found: {id}")]
    NotFound { id: String },

    #[error("upload already exists: {id}")]
    AlreadyExists { id: String },

    #[error("upload is locked by another holder: {id}")]
    LockBusy { id: String },

    #[error("lock for upload {id} is held by another holder")]
    LockNotOwned { id: String },

    #[error("corrupt metadata for upload {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to start converter {}: {reason}", program.display())]
    ProcessSpawnFailure { program: PathBuf, reason: String },

    #[error("converter failed for upload {id} (exit code {code:?})")]
    ConverterFailed { id: String, code: Option<i32> },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Classify an I/O error on an existing upload's file.
    pub(crate) fn from_io(err: io::Error, id: &str) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound { id: id.to_string() }
        } else {
            StoreError::Io(err)
        }
    }

    /// Classify an I/O error raised while creating a file under `root`.
    pub(crate) fn from_create(err: io::Error, root: &Path, id: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::StorageRootMissing {
                root: root.to_path_buf(),
            },
            io::ErrorKind::AlreadyExists => StoreError::AlreadyExists { id: id.to_string() },
            _ => StoreError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_lock_busy(&self) -> bool {
        matches!(self, StoreError::LockBusy { .. })
    }
}

/// File-based upload store.
///
/// Composes the chunk store, metadata store, lock manager and the optional
/// converter over one upload root.
#[derive(Debug)]
pub struct MdfStore {
    root: PathBuf,
    chunks: ChunkStore,
    infos: MetadataStore,
    locks: LockManager,
    converter: Option<Converter>,
}

impl MdfStore {
    /// Create a store over `root`.
    ///
    /// The directory is not checked or created; operations on a missing root
    /// fail with [`StoreError::StorageRootMissing`].
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            chunks: ChunkStore::new(&root),
            infos: MetadataStore::new(&root),
            locks: LockManager::new(&root),
            converter: None,
            root,
        }
    }

    /// Attach the post-processing converter run by [`MdfStore::finish_upload`].
    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Build a store from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let root = &config.storage.upload_dir;
        if config.storage.create_missing_root && !root.exists() {
            std::fs::create_dir_all(root)?;
            log_store_info!(
                "Created upload directory",
                root = tracing::field::display(root.display())
            );
        }

        let mut store = Self::new(root);
        store.converter = Converter::from_config(&config.converter);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &str) -> UploadPaths {
        UploadPaths::resolve(&self.root, id)
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.infos
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn converter(&self) -> Option<&Converter> {
        self.converter.as_ref()
    }

    /// Create a new upload and return its ID.
    ///
    /// An empty `info.id` is replaced with a freshly generated one. The
    /// `.bin` file is created first so a missing root is reported before
    /// any metadata is written. If the metadata cannot be written the
    /// `.bin` file is removed again.
    #[instrument(skip(self, info), level = "debug")]
    pub fn new_upload(&self, mut info: FileInfo) -> Result<String> {
        if info.id.is_empty() {
            info.id = uid::generate();
        }
        let id = info.id.clone();

        self.chunks.create(&id)?;
        info.offset = 0;
        if let Err(e) = self.infos.write(&id, &info) {
            if let Err(cleanup) = self.chunks.delete(&id) {
                log_store_warn!(
                    "Content file left behind after failed create",
                    id = id.as_str(),
                    error = tracing::field::display(&cleanup)
                );
            }
            return Err(e);
        }

        log_store_info!("Upload created", id = id.as_str(), size = info.size);
        Ok(id)
    }

    /// Append `src` to the upload, returning the number of bytes written.
    ///
    /// `offset` is where the caller believes the upload ends. A mismatch is
    /// logged but not rejected.
    #[instrument(skip(self, src), level = "debug")]
    pub fn write_chunk<R: Read>(&self, id: &str, offset: u64, src: R) -> Result<u64> {
        let current = self.chunks.offset(id)?;
        if current != offset {
            log_store_warn!(
                "Chunk offset differs from end of file",
                id = id,
                expected = offset,
                actual = current
            );
        }
        self.chunks.append(id, src)
    }

    /// Read the metadata record with `offset` recomputed from the `.bin` file.
    pub fn get_info(&self, id: &str) -> Result<FileInfo> {
        let mut info = self.infos.read(id)?;
        info.offset = self.chunks.offset(id)?;
        Ok(info)
    }

    pub fn get_reader(&self, id: &str) -> Result<File> {
        self.chunks.reader(id)
    }

    /// Delete both files of an upload and any stale lock file.
    ///
    /// A lock held through this store stays held; the caller releases it
    /// with [`MdfStore::unlock_upload`] as usual.
    #[instrument(skip(self), level = "debug")]
    pub fn terminate(&self, id: &str) -> Result<()> {
        self.infos.delete(id)?;
        self.chunks.delete(id)?;
        if !self.locks.holds(id) {
            if let Err(e) = self.locks.unlock(id) {
                log_store_warn!(
                    "Lock left behind after terminate",
                    id = id,
                    error = tracing::field::display(&e)
                );
            }
        }
        log_store_info!("Upload terminated", id = id);
        Ok(())
    }

    /// Append the content of `sources`, in order, to `dest`.
    pub fn concat_uploads<S: AsRef<str>>(&self, dest: &str, sources: &[S]) -> Result<u64> {
        concat::concat_uploads(&self.chunks, dest, sources)
    }

    /// Fix the total size of an upload created with a deferred length.
    #[instrument(skip(self), level = "debug")]
    pub fn declare_length(&self, id: &str, length: u64) -> Result<()> {
        let mut info = self.get_info(id)?;
        info.size = length;
        info.size_is_deferred = false;
        self.infos.write(id, &info)
    }

    pub fn lock_upload(&self, id: &str) -> Result<()> {
        self.locks.try_lock(id)
    }

    pub fn unlock_upload(&self, id: &str) -> Result<()> {
        self.locks.unlock(id)
    }

    /// Run the post-processing converter over a completed upload.
    ///
    /// Returns `Ok(None)` when no converter is configured.
    pub async fn finish_upload(&self, id: &str) -> Result<Option<ConversionReport>> {
        log_store_info!("Upload finished", id = id);

        let Some(converter) = &self.converter else {
            return Ok(None);
        };

        let bin = self.paths(id).bin;
        converter.run(id, &bin).await.map(Some)
    }
}
