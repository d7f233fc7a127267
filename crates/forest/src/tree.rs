//! Disk-backed trees.
//!
//! [TreeDriver] implements the algorithm's hooks on top of the node caches,
//! the savior and storage. [Tree] pairs the algorithm with a driver and
//! checks keys before they reach it.

use std::sync::Arc;

use forest_storage::StorageBackend;
use tracing::{debug, trace};

use crate::bplustree::{BPlusTree, Position, Seek};
use crate::cache::NodeCache;
use crate::codec::BaseRecord;
use crate::config::{check_factor, ForestConfig};
use crate::error::Result;
use crate::hooks::TreeHooks;
use crate::key::{Key, KeyType, Value};
use crate::lock::Mode;
use crate::materialize::{materialize, unmaterialize};
use crate::node::{Node, NodeBody, NodeData, NodeKind};
use crate::savior::{SaveTarget, Savior};

/// Everything trees share: storage, caches and the savior.
pub struct Context {
    pub config: ForestConfig,
    pub storage: Arc<dyn StorageBackend>,
    pub intr_cache: NodeCache<Arc<NodeBody>>,
    pub leaf_cache: NodeCache<Arc<NodeBody>>,
    /// Open trees, by base file name.
    pub tree_cache: NodeCache<Arc<Tree>>,
    pub savior: Savior,
}

impl Context {
    pub fn new(config: ForestConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            intr_cache: NodeCache::new("internal", config.intr_cache_length),
            leaf_cache: NodeCache::new("leaf", config.leaf_cache_length),
            tree_cache: NodeCache::new("tree", config.tree_cache_length),
            savior: Savior::new(
                storage.clone(),
                config.savior_delay(),
                config.savior_queue_length,
            ),
            storage,
            config,
        }
    }

    pub fn node_cache(&self, kind: NodeKind) -> &NodeCache<Arc<NodeBody>> {
        match kind {
            NodeKind::Internal => &self.intr_cache,
            NodeKind::Leaf => &self.leaf_cache,
        }
    }
}

fn save_target(kind: NodeKind, body: Arc<NodeBody>) -> SaveTarget {
    match kind {
        NodeKind::Internal => SaveTarget::Internal(body),
        NodeKind::Leaf => SaveTarget::Leaf(body),
    }
}

pub struct TreeDriver {
    ctx: Arc<Context>,
    /// Base file name of the tree.
    name: String,
    key_type: KeyType,
}

impl TreeHooks for TreeDriver {
    fn tree_name(&self) -> &str {
        &self.name
    }

    fn enter(&self, node: &Arc<Node>, mode: Mode) -> Result<Arc<NodeBody>> {
        node.travel.lock(mode);
        materialize(&self.ctx, node, self.key_type).inspect_err(|_| node.travel.unlock(mode))
    }

    fn leave(&self, node: &Arc<Node>, mode: Mode) {
        unmaterialize(&self.ctx, node);
        node.travel.unlock(mode);
    }

    fn insert(&self, node: &Arc<Node>) -> Result<()> {
        let Some(body) = node.body() else {
            debug_assert!(false, "{node:?} changed while not live");
            return Ok(());
        };
        let path = match node.path() {
            Some(path) => path.to_string(),
            None => {
                // An empty file holds the name until the savior writes it.
                let (writer, path) = self.ctx.storage.create_unique()?;
                writer.complete()?;
                node.set_path(&path);
                body.set_path(&path);
                self.ctx.node_cache(node.kind()).register(&path, body.clone());
                trace!("{}: new {:?} node {path}", self.name, node.kind());
                path
            }
        };
        self.ctx.savior.put(&path, save_target(node.kind(), body));
        Ok(())
    }

    fn remove(&self, node: &Arc<Node>) {
        let Some(path) = node.path() else {
            return;
        };
        trace!("{}: removing {:?} node {path}", self.name, node.kind());
        let body = node
            .body()
            .unwrap_or_else(|| Arc::new(NodeBody::new(NodeData::empty_leaf())));
        self.ctx.savior.remove(path, save_target(node.kind(), body));
        self.ctx.node_cache(node.kind()).remove(path);
    }

    fn reserve(&self, node: &Arc<Node>) {
        if let Some(path) = node.path() {
            let pinned = self.ctx.node_cache(node.kind()).acquire_ref(path);
            debug_assert!(pinned, "reserved {path}, which is not loaded");
        }
    }

    fn release(&self, node: &Arc<Node>) {
        if let Some(path) = node.path() {
            self.ctx.node_cache(node.kind()).release_ref(path);
        }
    }

    fn save_base(&self, root: &Arc<Node>, count: u64, factor: usize) -> Result<()> {
        let record = BaseRecord {
            count,
            factor,
            key_type: self.key_type,
            root: root.path().map(str::to_string),
            root_kind: match root.path() {
                Some(_) => root.kind(),
                None => NodeKind::Leaf,
            },
        };
        self.ctx.savior.put(&self.name, SaveTarget::Base(record));
        Ok(())
    }
}

/// A tree stored in the forest's directory.
pub struct Tree {
    name: String,
    key_type: KeyType,
    core: BPlusTree<TreeDriver>,
}

impl Tree {
    /// Writes the base record of a new, empty tree, under `name` or a
    /// generated name. Returns the name.
    pub fn seed(
        storage: &dyn StorageBackend,
        key_type: KeyType,
        factor: usize,
        name: Option<&str>,
    ) -> Result<String> {
        check_factor(factor)?;
        let (mut writer, name) = match name {
            Some(name) => (storage.create_named(name)?, name.to_string()),
            None => storage.create_unique()?,
        };
        let record = BaseRecord {
            count: 0,
            factor,
            key_type,
            root: None,
            root_kind: NodeKind::Leaf,
        };
        writer.write_all(&record.encode())?;
        writer.complete()?;
        debug!("seeded {key_type:?} tree {name} with factor {factor}");
        Ok(name)
    }

    /// Opens the tree whose base record is `name`.
    pub fn open(ctx: &Arc<Context>, name: &str) -> Result<Self> {
        ctx.savior.get(name);
        let record = BaseRecord::decode(&ctx.storage.read(name)?)?;
        check_factor(record.factor)?;
        let root = match record.root {
            Some(path) => Node::ghost(record.root_kind, path),
            None => Node::fresh(NodeData::empty_leaf()),
        };
        let driver = TreeDriver {
            ctx: ctx.clone(),
            name: name.to_string(),
            key_type: record.key_type,
        };
        Ok(Self {
            name: name.to_string(),
            key_type: record.key_type,
            core: BPlusTree::new(driver, record.factor, root, record.count),
        })
    }

    /// Base file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn factor(&self) -> usize {
        self.core.factor()
    }

    pub fn len(&self) -> u64 {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    pub fn insert(&self, key: Key, value: Value, overwrite: bool) -> Result<bool> {
        self.key_type.check(&key)?;
        self.core.insert(key, value, overwrite)
    }

    pub fn erase(&self, key: &Key) -> Result<bool> {
        self.key_type.check(key)?;
        self.core.erase(key)
    }

    pub fn find(&self, key: &Key) -> Result<Option<Value>> {
        self.key_type.check(key)?;
        self.core.find(key)
    }

    pub fn seek(&self, seek: &Seek) -> Result<Option<Position>> {
        match seek {
            Seek::First | Seek::Last => (),
            Seek::Floor(key) | Seek::Ceil(key) | Seek::After(key) | Seek::Before(key) => {
                self.key_type.check(key)?
            }
        }
        self.core.seek(seek)
    }

    pub fn step(&self, position: Position, forward: bool) -> Result<Option<Position>> {
        self.core.step(position, forward)
    }

    pub fn release(&self, position: Position) {
        self.core.release(position)
    }

    pub fn clear(&self) -> Result<()> {
        self.core.clear()
    }

    /// Drops every node. Later operations, including those through handles
    /// opened earlier, fail with [ForestError::TreeNotFound].
    pub fn retire(&self) -> Result<()> {
        self.core.retire()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use forest_storage::{PosixBackend, StorageBackend};
    use pretty_assertions::assert_eq;

    use super::{Context, Tree};
    use crate::bplustree::Seek;
    use crate::config::ForestConfig;
    use crate::error::ForestError;
    use crate::key::{Key, KeyType, Value};
    use crate::test::init_test_logger;

    fn context(dir: &std::path::Path) -> Arc<Context> {
        init_test_logger();
        let config = ForestConfig {
            intr_cache_length: 2,
            leaf_cache_length: 2,
            ..ForestConfig::default()
        };
        let storage: Arc<dyn StorageBackend> =
            Arc::new(PosixBackend::new(dir, config.open_files_limit).unwrap());
        Arc::new(Context::new(config, storage))
    }

    fn contents(tree: &Tree) -> Vec<(i64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut position = tree.seek(&Seek::First).unwrap();
        while let Some(p) = position {
            out.push((p.key().as_int().unwrap(), p.value().read().unwrap()));
            position = tree.step(p, true).unwrap();
        }
        out
    }

    #[test]
    fn survives_eviction_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let name = Tree::seed(ctx.storage.as_ref(), KeyType::Int, 3, None).unwrap();
        let expected: Vec<(i64, Vec<u8>)> = (0..60)
            .map(|n| (n, format!("v{n}").into_bytes()))
            .collect();
        {
            let tree = Tree::open(&ctx, &name).unwrap();
            for (k, v) in expected.iter().rev() {
                assert!(tree.insert(Key::Int(*k), Value::from(v.clone()), false).unwrap());
            }
            // Only a handful of nodes fit in the caches, so this reads most
            // of them back from disk.
            assert_eq!(contents(&tree), expected);
            assert!(ctx.leaf_cache.resident_len() <= 2);
        }
        ctx.savior.save_all();
        let tree = Tree::open(&ctx, &name).unwrap();
        assert_eq!(tree.len(), 60);
        assert_eq!(contents(&tree), expected);
        assert_eq!(
            tree.find(&Key::Int(42)).unwrap().unwrap().read().unwrap(),
            b"v42"
        );

        assert!(matches!(
            tree.insert(Key::from("x"), Value::from(vec![]), false),
            Err(ForestError::InvalidInput(_))
        ));
        ctx.savior.shutdown();
    }

    #[test]
    fn emptied_tree_leaves_only_its_base() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let name = Tree::seed(ctx.storage.as_ref(), KeyType::Int, 4, None).unwrap();
        let tree = Tree::open(&ctx, &name).unwrap();
        for n in 0..40 {
            tree.insert(Key::Int(n), Value::from(vec![n as u8; 100]), false).unwrap();
        }
        for n in 0..40 {
            assert!(tree.erase(&Key::Int(n)).unwrap());
        }
        ctx.savior.save_all();
        assert!(tree.is_empty());
        drop(tree);
        ctx.intr_cache.clear();
        ctx.leaf_cache.clear();
        assert_eq!(ctx.storage.file_count().unwrap(), 1);

        let tree = Tree::open(&ctx, &name).unwrap();
        tree.insert(Key::Int(1), Value::from(vec![1]), false).unwrap();
        tree.clear().unwrap();
        ctx.savior.save_all();
        drop(tree);
        ctx.leaf_cache.clear();
        assert_eq!(ctx.storage.file_count().unwrap(), 1);
        ctx.savior.shutdown();
    }
}
