//! Engine metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! engine maintains via [`metrics`] crate interfaces. Cache metrics carry a
//! `cache` label naming the node kind.

/// Total number of node cache hits.
pub const NODE_CACHE_HIT: &str = "forest.node_cache_hit";

/// Total number of node cache misses.
pub const NODE_CACHE_MISS: &str = "forest.node_cache_miss";

/// Total number of node loads that failed.
pub const NODE_CACHE_LOAD_FAILED: &str = "forest.node_cache_load_failed";

/// Total number of save or remove requests accepted by the savior.
pub const SAVES_REQUESTED: &str = "forest.savior.requested";

/// Total number of save or remove requests executed.
pub const SAVES_EXECUTED: &str = "forest.savior.executed";

/// Total number of save or remove requests that failed.
pub const SAVES_FAILED: &str = "forest.savior.failed";

/// Total number of trees created.
pub const TREES_CREATED: &str = "forest.trees_created";

/// Total number of trees deleted.
pub const TREES_DELETED: &str = "forest.trees_deleted";
