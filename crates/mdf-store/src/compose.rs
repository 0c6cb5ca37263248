//! Capability traits consumed by the upload protocol layer.
//!
//! A protocol handler asks only for the capabilities it needs (e.g. a
//! `&dyn Locker`), so alternative backends can provide a subset.
//! [`MdfStore`] implements all of them.

use std::io::Read;

use async_trait::async_trait;

use crate::{ConversionReport, FileInfo, MdfStore, Result};

/// Operations every backend must support
pub trait DataStore: Send + Sync {
    fn new_upload(&self, info: FileInfo) -> Result<String>;
    fn write_chunk(&self, id: &str, offset: u64, src: &mut dyn Read) -> Result<u64>;
    fn get_info(&self, id: &str) -> Result<FileInfo>;
}

pub trait GetReader: Send + Sync {
    fn get_reader(&self, id: &str) -> Result<Box<dyn Read + Send>>;
}

pub trait Terminater: Send + Sync {
    fn terminate(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait Finisher: Send + Sync {
    async fn finish_upload(&self, id: &str) -> Result<Option<ConversionReport>>;
}

pub trait Locker: Send + Sync {
    fn lock_upload(&self, id: &str) -> Result<()>;
    fn unlock_upload(&self, id: &str) -> Result<()>;
}

pub trait Concater: Send + Sync {
    fn concat_uploads(&self, dest: &str, sources: &[String]) -> Result<u64>;
}

pub trait LengthDeferrer: Send + Sync {
    fn declare_length(&self, id: &str, length: u64) -> Result<()>;
}

impl MdfStore {
    /// Names of the capabilities this store provides
    pub fn capabilities(&self) -> &'static [&'static str] {
        &[
            "core",
            "get-reader",
            "terminater",
            "finisher",
            "locker",
            "concater",
            "length-deferrer",
        ]
    }
}

impl DataStore for MdfStore {
    fn new_upload(&self, info: FileInfo) -> Result<String> {
        MdfStore::new_upload(self, info)
    }

    fn write_chunk(&self, id: &str, offset: u64, src: &mut dyn Read) -> Result<u64> {
        MdfStore::write_chunk(self, id, offset, src)
    }

    fn get_info(&self, id: &str) -> Result<FileInfo> {
        MdfStore::get_info(self, id)
    }
}

impl GetReader for MdfStore {
    fn get_reader(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(MdfStore::get_reader(self, id)?))
    }
}

impl Terminater for MdfStore {
    fn terminate(&self, id: &str) -> Result<()> {
        MdfStore::terminate(self, id)
    }
}

#[async_trait]
impl Finisher for MdfStore {
    async fn finish_upload(&self, id: &str) -> Result<Option<ConversionReport>> {
        MdfStore::finish_upload(self, id).await
    }
}

impl Locker for MdfStore {
    fn lock_upload(&self, id: &str) -> Result<()> {
        MdfStore::lock_upload(self, id)
    }

    fn unlock_upload(&self, id: &str) -> Result<()> {
        MdfStore::unlock_upload(self, id)
    }
}

impl Concater for MdfStore {
    fn concat_uploads(&self, dest: &str, sources: &[String]) -> Result<u64> {
        MdfStore::concat_uploads(self, dest, sources)
    }
}

impl LengthDeferrer for MdfStore {
    fn declare_length(&self, id: &str, length: u64) -> Result<()> {
        MdfStore::declare_length(self, id, length)
    }
}
