use std::io::ErrorKind;
use thiserror::Error;

/// An error that can occur when using the storage backend.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    StdIo(ErrorKind),

    /// The named file does not exist in the storage directory.
    #[error("File {0:?} does not exist in storage.")]
    NotFound(String),

    /// A read ended before the requested byte range or header was complete.
    #[error("Unexpected end of file {name:?} at offset {offset}.")]
    ShortRead { name: String, offset: u64 },
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::ShortRead { .. } => ErrorKind::UnexpectedEof,
        }
    }

    /// Maps a `NotFound` failure to success, for removals that may race with
    /// another removal of the same file.
    pub fn ignore_notfound<T>(result: Result<T, Self>) -> Result<(), Self> {
        match result {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Converts an I/O error about the file `name` into a storage error,
    /// naming the file when it is missing.
    pub(crate) fn with_name(error: std::io::Error, name: &str) -> Self {
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound(name.to_string()),
            kind => Self::StdIo(kind),
        }
    }
}
