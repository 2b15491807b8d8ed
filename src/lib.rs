mod manifest;
mod storage;
mod storage_file;

pub use manifest::*;
pub use storage::*;
pub use storage_file::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage is broken: {0}")]
    Broken(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err.to_string())
    }
}

/// External integrity collaborator. The hash tree learns the content size
/// from the storage layer as soon as the multi-file spec is complete, and is
/// the authority on the total size once it knows it.
pub trait HashTree: Send {
    fn set_size(&mut self, size: u64);
    fn size(&self) -> Option<u64>;
}

/// One-shot notification fired with the transfer id right before the first
/// (potentially slow) on-disk preallocation.
pub type AllocCallback = Box<dyn FnMut(i32) + Send>;

#[cfg(test)]
mod test_storage;
