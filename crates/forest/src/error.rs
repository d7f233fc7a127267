use forest_storage::StorageError;
use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T, E = ForestError> = std::result::Result<T, E>;

/// An error returned by forest operations.
#[derive(Clone, Error, Debug)]
pub enum ForestError {
    /// A file could not be created, opened, read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A file was read but does not hold a well-formed record.
    #[error("Malformed record: {0}")]
    Codec(#[from] CodecError),

    #[error("Tree {0:?} does not exist.")]
    TreeNotFound(String),

    #[error("Tree {0:?} already exists.")]
    TreeExists(String),

    #[error("Key {0} does not exist in the tree.")]
    KeyNotFound(String),

    /// A caller-supplied parameter is unusable, e.g. a factor below the
    /// minimum or a key of the wrong type.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("The forest has been folded.")]
    Folded,

    /// The record of a cursor positioned past either end was accessed.
    #[error("The record is positioned past the end of the tree.")]
    EndOfTree,
}

impl ForestError {
    /// Returns true for the domain "does not exist" errors, as opposed to
    /// I/O failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TreeNotFound(_) | Self::KeyNotFound(_))
    }
}
