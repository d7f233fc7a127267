//! Storage metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! backend maintains via [`metrics`] crate interfaces.

/// Total number of files created.
pub const FILES_CREATED: &str = "forest.disk.total_files_created";

/// Total number of files deleted.
pub const FILES_DELETED: &str = "forest.disk.total_files_deleted";

/// Total number of files whose deletion was deferred until their last reader
/// closed.
pub const FILES_DEFERRED: &str = "forest.disk.total_files_deferred";

/// Total number of descriptors opened, including lazy reopens.
pub const FILES_OPENED: &str = "forest.disk.total_files_opened";

/// Total number of descriptors closed early to stay under the open-file
/// ceiling.
pub const FILES_EVICTED: &str = "forest.disk.total_files_evicted";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "forest.disk.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "forest.disk.total_bytes_read";
