//! A forest of disk-resident B+Trees.
//!
//! Every node of every tree is a file in one directory. Nodes are loaded on
//! demand through bounded caches, written back asynchronously by the savior,
//! and traversed concurrently under per-node locks. [Forest] is the entry
//! point: it maps tree names to trees and hands out cursors over them.

pub mod bplustree;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod forest;
pub mod hooks;
pub mod key;
pub mod lock;
mod materialize;
pub mod metrics;
pub mod node;
pub mod savior;
pub mod tree;


pub use config::ForestConfig;
pub use error::{ForestError, Result};
pub use forest::{Forest, LeafRecord, Near, RecordPosition, TreeHandle, ROOT_TREE};
pub use key::{Key, KeyType, Value};
