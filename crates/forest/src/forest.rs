//! The forest: a directory of named trees.
//!
//! A registry tree, stored under [ROOT_TREE], maps each tree name to the
//! file holding that tree's base record. Trees are opened on demand and kept
//! in the tree cache while handles to them exist.

use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use forest_storage::{PosixBackend, StorageBackend};
use metrics::counter;
use tracing::{info, warn};

use crate::bplustree::{Position, Seek};
use crate::codec::{BaseRecord, CodecError};
use crate::config::{check_factor, ForestConfig};
use crate::error::{ForestError, Result};
use crate::key::{check_token, Key, KeyType, Value};
use crate::metrics::{TREES_CREATED, TREES_DELETED};
use crate::node::NodeKind;
use crate::savior::SaveTarget;
use crate::tree::{Context, Tree};

/// File name of the registry tree's base record.
pub const ROOT_TREE: &str = "_root";

/// Which end of a tree [Forest::find_leaf_at] looks at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordPosition {
    Begin,
    End,
}

/// Which neighbour of a key [Forest::find_leaf_near] looks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Near {
    /// The greatest key not above the given one.
    Lower,
    /// The least key not below the given one.
    Upper,
}

/// An open tree. The tree stays in the cache until the handle is dropped.
pub struct TreeHandle {
    ctx: Arc<Context>,
    tree: Arc<Tree>,
}

impl Deref for TreeHandle {
    type Target = Tree;

    fn deref(&self) -> &Tree {
        &self.tree
    }
}

impl Drop for TreeHandle {
    fn drop(&mut self) {
        self.ctx.tree_cache.release_ref(self.tree.name());
    }
}

impl Debug for TreeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeHandle")
            .field("file", &self.tree.name())
            .field("key_type", &self.tree.key_type())
            .finish()
    }
}

/// A cursor over one tree.
///
/// A record either points at an entry or is past the end. While it points at
/// an entry, the leaf holding it stays in memory.
pub struct LeafRecord {
    tree: TreeHandle,
    position: Option<Position>,
}

impl LeafRecord {
    pub fn is_end(&self) -> bool {
        self.position.is_none()
    }

    pub fn key(&self) -> Result<&Key> {
        self.position
            .as_ref()
            .map(Position::key)
            .ok_or(ForestError::EndOfTree)
    }

    pub fn value(&self) -> Result<&Value> {
        self.position
            .as_ref()
            .map(Position::value)
            .ok_or(ForestError::EndOfTree)
    }

    /// Reads the value's bytes.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.value()?.read()
    }

    /// Moves to the next entry. A record past the end stays there.
    pub fn move_forward(&mut self) -> Result<()> {
        if let Some(position) = self.position.take() {
            self.position = self.tree.step(position, true)?;
        }
        Ok(())
    }

    /// Moves to the previous entry. From past the end, moves to the last
    /// entry.
    pub fn move_back(&mut self) -> Result<()> {
        self.position = match self.position.take() {
            Some(position) => self.tree.step(position, false)?,
            None => self.tree.seek(&Seek::Last)?,
        };
        Ok(())
    }
}

impl Drop for LeafRecord {
    fn drop(&mut self) {
        if let Some(position) = self.position.take() {
            self.tree.release(position);
        }
    }
}

impl Debug for LeafRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.position {
            Some(position) => write!(f, "LeafRecord({:?})", position.key()),
            None => f.write_str("LeafRecord(end)"),
        }
    }
}

/// A set of named trees stored in one directory.
pub struct Forest {
    ctx: Arc<Context>,
    registry: Tree,
    /// Serializes removals from the registry.
    unregister: Mutex<()>,
    folded: AtomicBool,
}

impl Forest {
    /// Opens the forest in `dir`, creating the directory and the registry
    /// on first use.
    pub fn bloom(dir: impl AsRef<Path>, config: ForestConfig) -> Result<Self> {
        config.validate()?;
        forest_storage::init();
        let dir = dir.as_ref();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(PosixBackend::new(dir, config.open_files_limit)?);
        if !storage.exists(ROOT_TREE) {
            Tree::seed(
                storage.as_ref(),
                KeyType::String,
                config.root_factor,
                Some(ROOT_TREE),
            )?;
        }
        let ctx = Arc::new(Context::new(config, storage));
        let registry = Tree::open(&ctx, ROOT_TREE)?;
        info!(
            "forest in {} bloomed with {} trees",
            dir.display(),
            registry.len()
        );
        Ok(Self {
            ctx,
            registry,
            unregister: Mutex::new(()),
            folded: AtomicBool::new(false),
        })
    }

    /// Writes out everything pending and stops background work. Further
    /// operations fail with [ForestError::Folded]. Folding twice is a no-op.
    pub fn fold(&self) {
        if self.folded.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.savior.shutdown();
        self.ctx.tree_cache.clear();
        self.ctx.intr_cache.clear();
        self.ctx.leaf_cache.clear();
        info!("forest in {} folded", self.ctx.storage.base().display());
    }

    pub fn is_folded(&self) -> bool {
        self.folded.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ForestConfig {
        &self.ctx.config
    }

    fn check(&self) -> Result<()> {
        if self.is_folded() {
            return Err(ForestError::Folded);
        }
        Ok(())
    }

    /// Creates an empty tree. Without `factor`, the configured default is
    /// used.
    pub fn create_tree(&self, key_type: KeyType, name: &str, factor: Option<usize>) -> Result<()> {
        self.check()?;
        check_token(name)?;
        let factor = factor.unwrap_or(self.ctx.config.default_factor);
        check_factor(factor)?;

        let file = Tree::seed(self.ctx.storage.as_ref(), key_type, factor, None)?;
        let registered = self
            .registry
            .insert(Key::from(name), Value::from(file.as_bytes()), false);
        if !matches!(registered, Ok(true)) {
            if let Err(error) = self.ctx.storage.remove(&file) {
                warn!("could not remove unused base file {file}: {error}");
            }
        }
        match registered {
            Ok(true) => {
                counter!(TREES_CREATED).increment(1);
                info!("created tree {name} in {file}");
                Ok(())
            }
            Ok(false) => Err(ForestError::TreeExists(name.to_string())),
            Err(error) => Err(error),
        }
    }

    /// Deletes a tree and all of its nodes. Deleting a tree that does not
    /// exist does nothing.
    pub fn delete_tree(&self, name: &str) -> Result<()> {
        self.check()?;
        let key = Key::from(name);
        let file = {
            let _unregister = self.unregister.lock().unwrap();
            let Some(file) = self.lookup(&key)? else {
                return Ok(());
            };
            self.registry.erase(&key)?;
            file
        };

        let tree = self.open(&file)?;
        tree.retire()?;
        let record = BaseRecord {
            count: 0,
            factor: tree.factor(),
            key_type: tree.key_type(),
            root: None,
            root_kind: NodeKind::Leaf,
        };
        drop(tree);
        self.ctx.savior.remove(&file, SaveTarget::Base(record));
        self.ctx.tree_cache.remove(&file);
        counter!(TREES_DELETED).increment(1);
        info!("deleted tree {name} from {file}");
        Ok(())
    }

    /// Returns the base file of `name`, if it is registered.
    fn lookup(&self, key: &Key) -> Result<Option<String>> {
        let Some(value) = self.registry.find(key)? else {
            return Ok(None);
        };
        let file = String::from_utf8(value.read()?).map_err(|error| CodecError::Invalid {
            record: "registry",
            what: "base file name",
            token: String::from_utf8_lossy(error.as_bytes()).into_owned(),
        })?;
        Ok(Some(file))
    }

    fn open(&self, file: &str) -> Result<TreeHandle> {
        let tree = self
            .ctx
            .tree_cache
            .acquire(file, |file| Tree::open(&self.ctx, file).map(Arc::new))?;
        Ok(TreeHandle {
            ctx: self.ctx.clone(),
            tree,
        })
    }

    pub fn find_tree(&self, name: &str) -> Result<TreeHandle> {
        self.check()?;
        let Some(file) = self.lookup(&Key::from(name))? else {
            return Err(ForestError::TreeNotFound(name.to_string()));
        };
        // The base file is gone if the tree was deleted after the lookup.
        self.open(&file).map_err(|error| match error {
            ForestError::Storage(error) if error.kind() == ErrorKind::NotFound => {
                ForestError::TreeNotFound(name.to_string())
            }
            error => error,
        })
    }

    /// Inserts `key` unless it is already present. Returns true if it was
    /// inserted.
    pub fn insert_leaf(&self, name: &str, key: Key, value: impl Into<Value>) -> Result<bool> {
        self.find_tree(name)?.insert(key, value.into(), false)
    }

    /// Inserts `key`, replacing the value of an existing entry.
    pub fn update_leaf(&self, name: &str, key: Key, value: impl Into<Value>) -> Result<()> {
        self.find_tree(name)?.insert(key, value.into(), true)?;
        Ok(())
    }

    /// Removes `key`. Returns true if it was present.
    pub fn erase_leaf(&self, name: &str, key: &Key) -> Result<bool> {
        self.find_tree(name)?.erase(key)
    }

    pub fn find_leaf(&self, name: &str, key: &Key) -> Result<LeafRecord> {
        let tree = self.find_tree(name)?;
        let position = tree.seek(&Seek::Ceil(key.clone()))?;
        let record = LeafRecord { tree, position };
        match record.key() {
            Ok(found) if found == key => Ok(record),
            _ => Err(ForestError::KeyNotFound(key.to_string())),
        }
    }

    pub fn find_leaf_at(&self, name: &str, at: RecordPosition) -> Result<LeafRecord> {
        let tree = self.find_tree(name)?;
        let position = tree.seek(match at {
            RecordPosition::Begin => &Seek::First,
            RecordPosition::End => &Seek::Last,
        })?;
        Ok(LeafRecord { tree, position })
    }

    pub fn find_leaf_near(&self, name: &str, key: &Key, near: Near) -> Result<LeafRecord> {
        let tree = self.find_tree(name)?;
        let seek = match near {
            Near::Lower => Seek::Floor(key.clone()),
            Near::Upper => Seek::Ceil(key.clone()),
        };
        let position = tree.seek(&seek)?;
        Ok(LeafRecord { tree, position })
    }

    /// Names of all trees, in order.
    pub fn tree_names(&self) -> Result<Vec<String>> {
        self.check()?;
        let mut names = Vec::new();
        let mut position = self.registry.seek(&Seek::First)?;
        while let Some(p) = position {
            names.push(p.key().to_string());
            position = self.registry.step(p, true)?;
        }
        Ok(names)
    }

    /// Waits until every requested save is on disk.
    pub fn save_all(&self) -> Result<()> {
        self.check()?;
        self.ctx.savior.save_all();
        Ok(())
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        self.fold();
    }
}

impl Debug for Forest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forest")
            .field("dir", &self.ctx.storage.base())
            .field("folded", &self.is_folded())
            .finish()
    }
}
