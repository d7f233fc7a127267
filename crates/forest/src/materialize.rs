//! Loading and releasing node payloads.
//!
//! The first owner of a ghost node loads its payload through the node cache,
//! which pins it; the last owner detaches the payload and unpins it, after
//! which the cache may evict it. Nodes without a file are created live and
//! stay live until they get one.

use std::sync::Arc;

use tracing::trace;

use crate::codec::{InternalRecord, LeafHeader};
use crate::error::Result;
use crate::key::{KeyType, Value};
use crate::node::{InternalData, LeafData, Node, NodeBody, NodeData, NodeKind};
use crate::tree::Context;

/// Makes `node` live for one more owner and returns its payload.
pub(crate) fn materialize(ctx: &Context, node: &Node, key_type: KeyType) -> Result<Arc<NodeBody>> {
    node.owner.enter(|| -> Result<()> {
        let Some(path) = node.path() else {
            return Ok(());
        };
        if node.is_ghost() {
            let body = ctx
                .node_cache(node.kind())
                .acquire(path, |path| load(ctx, node.kind(), path, key_type))?;
            node.attach(body);
        }
        Ok(())
    })?;
    match node.body() {
        Some(body) => Ok(body),
        None => unreachable!("{node:?} entered without a payload"),
    }
}

/// Drops one owner of `node`, releasing the payload with the last one.
pub(crate) fn unmaterialize(ctx: &Context, node: &Node) {
    node.owner.leave(|| {
        let Some(path) = node.path() else {
            return;
        };
        let Some(body) = node.detach() else {
            return;
        };
        let cache = ctx.node_cache(node.kind());
        cache.release_ref(path);
        if node.is_leaf() && cache.refs(path) == 0 {
            ctx.savior.leave(path, &body);
        }
    });
}

fn load(ctx: &Context, kind: NodeKind, path: &str, key_type: KeyType) -> Result<Arc<NodeBody>> {
    ctx.savior.get(path);
    trace!("loading {kind:?} node {path}");
    let body = match kind {
        NodeKind::Internal => {
            let record = InternalRecord::decode(&ctx.storage.read(path)?, key_type)?;
            let children = record
                .children
                .into_iter()
                .map(|child| Node::ghost(record.child_kind, child))
                .collect();
            let data = InternalData {
                keys: record.keys,
                children,
            };
            NodeBody::loaded(path, NodeData::Internal(data), None)
        }
        NodeKind::Leaf => {
            let file = ctx.storage.open(path)?;
            let (header, start) =
                LeafHeader::decode(&file.read_lines(LeafHeader::LINES)?, key_type)?;
            let ranges = header.value_ranges(start as u64);
            let entries = header
                .keys
                .into_iter()
                .zip(ranges)
                .map(|(key, (offset, len))| {
                    let value = Value::Stored {
                        file: file.clone(),
                        offset,
                        len,
                    };
                    (key, value)
                })
                .collect();
            let data = LeafData {
                entries,
                prev: header.prev,
                next: header.next,
            };
            NodeBody::loaded(path, NodeData::Leaf(data), Some(file))
        }
    };
    Ok(Arc::new(body))
}
