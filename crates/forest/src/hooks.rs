use std::sync::Arc;

use crate::error::Result;
use crate::lock::Mode;
use crate::node::{Node, NodeBody};

/// Extension points of the B+Tree algorithm.
///
/// [crate::bplustree::BPlusTree] never touches storage itself. It reaches
/// every node through [TreeHooks::enter] and [TreeHooks::leave], and reports
/// every change through [TreeHooks::insert] and [TreeHooks::remove].
pub trait TreeHooks: Send + Sync {
    /// Name reported by operations on a retired tree.
    fn tree_name(&self) -> &str;

    /// Locks `node` for traversal in `mode` and makes sure its payload is
    /// present. On error nothing stays locked.
    fn enter(&self, node: &Arc<Node>, mode: Mode) -> Result<Arc<NodeBody>>;

    /// Undoes [TreeHooks::enter].
    fn leave(&self, node: &Arc<Node>, mode: Mode);

    /// `node`'s payload changed. A node that has no file yet gets a name
    /// here. Must be called while `node` is entered.
    fn insert(&self, node: &Arc<Node>) -> Result<()>;

    /// `node` was unlinked from the tree.
    fn remove(&self, node: &Arc<Node>);

    /// Keeps `node`'s payload loaded after it is left, for a cursor.
    fn reserve(&self, node: &Arc<Node>);

    /// Undoes [TreeHooks::reserve].
    fn release(&self, node: &Arc<Node>);

    /// A cursor is about to step away from a position in `node`.
    fn before_move(&self, _node: &Arc<Node>, _forward: bool) {}

    /// A cursor stepped away from a position in `node`.
    fn after_move(&self, _node: &Arc<Node>, _forward: bool) {}

    /// The tree's root or entry count changed.
    fn save_base(&self, root: &Arc<Node>, count: u64, factor: usize) -> Result<()>;
}
