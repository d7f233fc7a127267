//! File storage for the forest B+Tree engine.
//!
//! Every node of every tree lives in its own file inside one directory. This
//! crate hides the filesystem behind [`StorageBackend`]: files are created
//! under generated names, replaced atomically by rename, and read through
//! shared [`FileReader`] handles that reopen their descriptor on demand and
//! can postpone the deletion of a file until the last handle is gone.

use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, Once};

use fdlimit::{raise_fd_limit, Outcome::LimitRaised};
use tracing::warn;
use uuid::Uuid;

pub mod error;
pub mod metrics;
pub mod posixio_impl;


pub use error::StorageError;
pub use posixio_impl::PosixBackend;

/// Callback run with the final name of a file when its reader goes away.
pub type CloseCallback = Box<dyn FnOnce(&str) + Send>;

/// A storage backend.
pub trait StorageBackend: Send + Sync {
    /// Creates a new file with the given `name`, which is relative to the
    /// backend's base directory. Fails if the file already exists.
    fn create_named(&self, name: &str) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Creates a new file under a generated name and returns the writer
    /// together with the name.
    fn create_unique(&self) -> Result<(Box<dyn FileWriter>, String), StorageError> {
        let name = Uuid::now_v7().to_string();
        let writer = self.create_named(&name)?;
        Ok((writer, name))
    }

    /// Opens a file for reading.
    ///
    /// While a reader for `name` is alive, opening the same name again
    /// returns that reader.
    fn open(&self, name: &str) -> Result<Arc<dyn FileReader>, StorageError>;

    /// Reads the whole content of `name`.
    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Deletes `name`. A file that is already gone is not an error.
    fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// Moves the file currently backing a live reader of `name` out of the
    /// way, so that `name` can be replaced while the reader keeps working.
    /// The moved file is deleted when the reader goes away. Does nothing if
    /// no reader of `name` is alive.
    fn supersede(&self, name: &str) -> Result<(), StorageError>;

    /// Deletes `name`, or, if a reader of it is alive, deletes it when that
    /// reader goes away.
    fn remove_deferred(&self, name: &str) -> Result<(), StorageError>;

    /// Returns true if `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Number of files in the base directory.
    fn file_count(&self) -> Result<usize, StorageError>;

    /// Number of readers currently holding an open descriptor.
    fn open_files(&self) -> usize;

    /// The base directory.
    fn base(&self) -> &Path;
}

/// A file being written.
///
/// The file is deleted if the writer is dropped before
/// [FileWriter::complete] is called.
pub trait FileWriter: Send {
    /// The file's name, relative to the backend's base directory.
    fn name(&self) -> &str;

    /// Appends `data` to the file.
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flushes the file and keeps it. Returns its name.
    fn complete(self: Box<Self>) -> Result<String, StorageError>;
}

/// A readable file.
pub trait FileReader: Send + Sync + Debug {
    /// The file's current name. It changes if the file is superseded.
    fn name(&self) -> String;

    /// Reads up to `len` bytes at `offset`, stopping early only at the end
    /// of the file.
    fn read_some_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Reads exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let data = self.read_some_at(offset, len)?;
        if data.len() < len {
            return Err(StorageError::ShortRead {
                name: self.name(),
                offset: offset + data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Reads the prefix of the file up to and including its `lines`-th
    /// newline.
    fn read_lines(&self, lines: usize) -> Result<Vec<u8>, StorageError> {
        const CHUNK: usize = 4096;

        let mut prefix = Vec::new();
        let mut seen = 0;
        if lines == 0 {
            return Ok(prefix);
        }
        loop {
            let chunk = self.read_some_at(prefix.len() as u64, CHUNK)?;
            if chunk.is_empty() {
                return Err(StorageError::ShortRead {
                    name: self.name(),
                    offset: prefix.len() as u64,
                });
            }
            for (i, byte) in chunk.iter().enumerate() {
                if *byte == b'\n' {
                    seen += 1;
                    if seen == lines {
                        prefix.extend_from_slice(&chunk[..=i]);
                        return Ok(prefix);
                    }
                }
            }
            prefix.extend_from_slice(&chunk);
        }
    }

    /// Releases the descriptor. The next read reopens the file.
    fn close(&self);

    /// Registers `callback` to run, with the file's name at that time, when
    /// the last reference to this reader is dropped.
    fn on_close(&self, callback: CloseCallback);
}

/// Raise the fd limit to run the storage library to avoid surprises.  This
/// is a no-op on Windows, so it does not need to be behind an architectural
/// cfg.
fn init_fd_limit() {
    match raise_fd_limit() {
        Ok(LimitRaised { from, to }) => {
            const WARN_THRESHOLD: u64 = 1 << 14;
            if to < WARN_THRESHOLD {
                warn!("Raised fd limit from {} to {}. It's still very low -- try increasing the fd hard-limit (in your limits.conf).", from, to);
            }
        }
        Ok(_) => { /* not on unix */ }
        Err(e) => {
            warn!("Failed to raise fd limit: {}", e);
        }
    }
}

/// Performs process-wide initialization for the storage library. Safe to call
/// more than once.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(init_fd_limit);
}
