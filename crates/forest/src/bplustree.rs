//! The B+Tree algorithm.
//!
//! Leaves hold at most `factor` entries and, unless they are the root, at
//! least `max(1, factor / 2)`. Internal nodes hold at most `factor` children
//! and, unless they are the root, at least `ceil(factor / 2)`. Leaves are
//! chained in key order through their sibling links.
//!
//! Readers share the tree's stem lock and descend hand over hand, entering a
//! child before leaving its parent. Writers hold the stem lock exclusively,
//! keep every node they visit entered until they are done, and change-lock
//! every node they modify, in one group whenever a leaf changes together
//! with a new or neighbouring leaf.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{ForestError, Result};
use crate::hooks::TreeHooks;
use crate::key::{Key, Value};
use crate::lock::{ChangeLock, Mode};
use crate::node::{InternalData, Node, NodeBody, NodeData};

/// Where [BPlusTree::seek] lands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seek {
    First,
    Last,
    /// The greatest key less than or equal to the given one.
    Floor(Key),
    /// The least key greater than or equal to the given one.
    Ceil(Key),
    /// The least key strictly greater than the given one.
    After(Key),
    /// The greatest key strictly less than the given one.
    Before(Key),
}

/// An entry found by a seek. Its leaf stays reserved until the position is
/// given back through [BPlusTree::step] or [BPlusTree::release].
#[derive(Debug)]
pub struct Position {
    leaf: Arc<Node>,
    index: usize,
    /// Tree version the position was taken at.
    version: u64,
    key: Key,
    value: Value,
}

impl Position {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn leaf(&self) -> &Arc<Node> {
        &self.leaf
    }
}

struct Root {
    node: Arc<Node>,
    count: u64,
}

#[derive(Copy, Clone)]
enum Descent<'a> {
    Key(&'a Key),
    First,
    Last,
}

enum Landing {
    At(usize),
    Next,
    Prev,
    Nowhere,
}

/// An internal node on a writer's path, with the index of the child taken.
struct Step {
    node: Arc<Node>,
    body: Arc<NodeBody>,
    index: usize,
}

/// The nodes a write has entered and the payloads it has change-locked.
/// Everything is released, in reverse order, when the write is over.
struct WriteOp<'a, H: TreeHooks> {
    hooks: &'a H,
    entered: Vec<Arc<Node>>,
    locked: Vec<Arc<NodeBody>>,
}

impl<'a, H: TreeHooks> WriteOp<'a, H> {
    fn new(hooks: &'a H) -> Self {
        Self {
            hooks,
            entered: Vec::new(),
            locked: Vec::new(),
        }
    }

    fn enter(&mut self, node: &Arc<Node>) -> Result<Arc<NodeBody>> {
        if self.entered.iter().any(|n| Arc::ptr_eq(n, node)) {
            if let Some(body) = node.body() {
                return Ok(body);
            }
        }
        let body = self.hooks.enter(node, Mode::Write)?;
        self.entered.push(node.clone());
        Ok(body)
    }

    fn lock(&mut self, bodies: &[&Arc<NodeBody>]) {
        let mut fresh: Vec<Arc<NodeBody>> = Vec::with_capacity(bodies.len());
        for &body in bodies {
            if !self.locked.iter().chain(&fresh).any(|b| Arc::ptr_eq(b, body)) {
                fresh.push(body.clone());
            }
        }
        let locks: Vec<&ChangeLock> = fresh.iter().map(|body| &body.change).collect();
        ChangeLock::lock_group(&locks);
        self.locked.extend(fresh);
    }
}

impl<H: TreeHooks> Drop for WriteOp<'_, H> {
    fn drop(&mut self) {
        for body in self.locked.drain(..).rev() {
            body.change.unlock_write();
        }
        for node in self.entered.drain(..).rev() {
            self.hooks.leave(&node, Mode::Write);
        }
    }
}

pub struct BPlusTree<H: TreeHooks> {
    hooks: H,
    factor: usize,
    stem: RwLock<()>,
    root: Mutex<Root>,
    /// Bumped by every change, so positions can tell they went stale.
    version: AtomicU64,
    /// Set under the exclusive stem lock once the tree is deleted.
    retired: AtomicBool,
}

impl<H: TreeHooks> BPlusTree<H> {
    /// Wraps an existing tree whose root is `root`.
    pub fn new(hooks: H, factor: usize, root: Arc<Node>, count: u64) -> Self {
        Self {
            hooks,
            factor,
            stem: RwLock::new(()),
            root: Mutex::new(Root { node: root, count }),
            version: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.root.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn root(&self) -> Arc<Node> {
        self.root.lock().unwrap().node.clone()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Fails once the tree is retired. Callers hold the stem lock.
    fn check_live(&self) -> Result<()> {
        if self.retired.load(Ordering::Acquire) {
            return Err(ForestError::TreeNotFound(self.hooks.tree_name().to_string()));
        }
        Ok(())
    }

    fn min_leaf(&self) -> usize {
        (self.factor / 2).max(1)
    }

    fn min_internal(&self) -> usize {
        self.factor.div_ceil(2)
    }

    pub fn find(&self, key: &Key) -> Result<Option<Value>> {
        let _stem = self.stem.read().unwrap();
        self.check_live()?;
        let (leaf, body) = self.descend_read(Descent::Key(key))?;
        let value = {
            let data = body.read();
            let leaf = data.leaf();
            leaf.search(key).ok().map(|index| leaf.entries[index].1.clone())
        };
        self.hooks.leave(&leaf, Mode::Read);
        Ok(value)
    }

    pub fn seek(&self, seek: &Seek) -> Result<Option<Position>> {
        let _stem = self.stem.read().unwrap();
        self.check_live()?;
        self.seek_locked(seek)
    }

    /// Moves to the next (`forward`) or previous entry. If the tree changed
    /// since `position` was taken, the step is a fresh seek past the
    /// position's key.
    pub fn step(&self, position: Position, forward: bool) -> Result<Option<Position>> {
        let _stem = self.stem.read().unwrap();
        if let Err(e) = self.check_live() {
            self.hooks.release(&position.leaf);
            return Err(e);
        }
        if position.version != self.version() {
            self.hooks.release(&position.leaf);
            let seek = if forward {
                Seek::After(position.key)
            } else {
                Seek::Before(position.key)
            };
            return self.seek_locked(&seek);
        }

        let leaf = position.leaf;
        let body = match self.hooks.enter(&leaf, Mode::Read) {
            Ok(body) => body,
            Err(e) => {
                self.hooks.release(&leaf);
                return Err(e);
            }
        };
        self.hooks.before_move(&leaf, forward);
        let len = body.read().len();
        let within = if forward {
            Some(position.index + 1).filter(|&index| index < len)
        } else {
            position.index.checked_sub(1)
        };
        let result = match within {
            Some(index) => Ok(Some(self.position_at(&leaf, &body, index))),
            None => self.neighbour(&leaf, forward),
        };
        self.hooks.after_move(&leaf, forward);
        self.hooks.leave(&leaf, Mode::Read);
        self.hooks.release(&leaf);
        result
    }

    /// Gives back a position without stepping.
    pub fn release(&self, position: Position) {
        self.hooks.release(&position.leaf);
    }

    /// Inserts `key`. An existing entry is replaced only if `overwrite`.
    /// Returns true if the key was new.
    pub fn insert(&self, key: Key, value: Value, overwrite: bool) -> Result<bool> {
        let _stem = self.stem.write().unwrap();
        self.check_live()?;
        let mut op = WriteOp::new(&self.hooks);
        let (mut path, leaf, body) = self.descend_write(&mut op, &key)?;
        op.lock(&[&body]);
        let inserted = {
            let mut data = body.write();
            let entries = &mut data.leaf_mut().entries;
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(_) if !overwrite => return Ok(false),
                Ok(index) => {
                    entries[index].1 = value;
                    false
                }
                Err(index) => {
                    entries.insert(index, (key, value));
                    true
                }
            }
        };
        self.hooks.insert(&leaf)?;

        let mut split = if body.read().len() > self.factor {
            Some(self.split_leaf(&mut op, &leaf, &body)?)
        } else {
            None
        };
        let mut child = leaf;
        while let Some((separator, right)) = split.take() {
            let Some(Step {
                node: parent,
                body: parent_body,
                index,
            }) = path.pop()
            else {
                let root = Node::fresh(NodeData::Internal(InternalData {
                    keys: vec![separator],
                    children: vec![child.clone(), right],
                }));
                op.enter(&root)?;
                self.hooks.insert(&root)?;
                self.root.lock().unwrap().node = root;
                break;
            };
            op.lock(&[&parent_body]);
            {
                let mut data = parent_body.write();
                let internal = data.internal_mut();
                internal.keys.insert(index, separator);
                internal.children.insert(index + 1, right);
            }
            self.hooks.insert(&parent)?;
            if parent_body.read().len() > self.factor {
                split = Some(self.split_internal(&mut op, &parent, &parent_body)?);
            }
            child = parent;
        }

        if inserted {
            self.root.lock().unwrap().count += 1;
        }
        self.commit()?;
        Ok(inserted)
    }

    /// Removes `key`. Returns false if it was not there.
    pub fn erase(&self, key: &Key) -> Result<bool> {
        let _stem = self.stem.write().unwrap();
        self.check_live()?;
        let mut op = WriteOp::new(&self.hooks);
        let (path, leaf, body) = self.descend_write(&mut op, key)?;
        op.lock(&[&body]);
        {
            let mut data = body.write();
            let entries = &mut data.leaf_mut().entries;
            match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                Ok(index) => {
                    entries.remove(index);
                }
                Err(_) => return Ok(false),
            }
        }
        self.hooks.insert(&leaf)?;
        {
            let mut root = self.root.lock().unwrap();
            root.count = root.count.saturating_sub(1);
        }
        self.rebalance(&mut op, path, leaf, body)?;
        self.commit()?;
        Ok(true)
    }

    /// Removes every node and leaves an empty tree.
    pub fn clear(&self) -> Result<()> {
        let _stem = self.stem.write().unwrap();
        self.check_live()?;
        self.clear_locked()?;
        self.commit()
    }

    /// Removes every node and makes every later operation fail with
    /// [ForestError::TreeNotFound]. The base record is left to the caller.
    pub fn retire(&self) -> Result<()> {
        let _stem = self.stem.write().unwrap();
        if self.retired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        self.clear_locked()
    }

    fn clear_locked(&self) -> Result<()> {
        let root = self.root();
        self.clear_node(&root)?;
        let mut root = self.root.lock().unwrap();
        root.node = Node::fresh(NodeData::empty_leaf());
        root.count = 0;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.version.fetch_add(1, Ordering::AcqRel);
        let (root, count) = {
            let root = self.root.lock().unwrap();
            (root.node.clone(), root.count)
        };
        self.hooks.save_base(&root, count, self.factor)
    }

    /// Descends to the leaf for `to`, entering nodes hand over hand. The
    /// returned leaf is entered for reading.
    fn descend_read(&self, to: Descent<'_>) -> Result<(Arc<Node>, Arc<NodeBody>)> {
        let mut node = self.root();
        let mut body = self.hooks.enter(&node, Mode::Read)?;
        while !node.is_leaf() {
            let child = {
                let data = body.read();
                let internal = data.internal();
                let index = match to {
                    Descent::Key(key) => internal.child_index(key),
                    Descent::First => 0,
                    Descent::Last => internal.children.len() - 1,
                };
                internal.children[index].clone()
            };
            let entered = self.hooks.enter(&child, Mode::Read);
            self.hooks.leave(&node, Mode::Read);
            body = entered?;
            node = child;
        }
        Ok((node, body))
    }

    fn descend_write(
        &self,
        op: &mut WriteOp<'_, H>,
        key: &Key,
    ) -> Result<(Vec<Step>, Arc<Node>, Arc<NodeBody>)> {
        let mut path = Vec::new();
        let mut node = self.root();
        let mut body = op.enter(&node)?;
        while !node.is_leaf() {
            let (index, child) = {
                let data = body.read();
                let internal = data.internal();
                let index = internal.child_index(key);
                (index, internal.children[index].clone())
            };
            path.push(Step { node, body, index });
            body = op.enter(&child)?;
            node = child;
        }
        Ok((path, node, body))
    }

    fn seek_locked(&self, seek: &Seek) -> Result<Option<Position>> {
        let descent = match seek {
            Seek::First => Descent::First,
            Seek::Last => Descent::Last,
            Seek::Floor(key) | Seek::Ceil(key) | Seek::After(key) | Seek::Before(key) => {
                Descent::Key(key)
            }
        };
        let (leaf, body) = self.descend_read(descent)?;
        let landing = {
            let data = body.read();
            let entries = &data.leaf().entries;
            let len = entries.len();
            let forward = |index: usize| {
                if index < len {
                    Landing::At(index)
                } else {
                    Landing::Next
                }
            };
            let backward = |count: usize| match count.checked_sub(1) {
                Some(index) => Landing::At(index),
                None => Landing::Prev,
            };
            match seek {
                _ if len == 0 => Landing::Nowhere,
                Seek::First => Landing::At(0),
                Seek::Last => Landing::At(len - 1),
                Seek::Ceil(key) => forward(entries.partition_point(|(k, _)| k < key)),
                Seek::After(key) => forward(entries.partition_point(|(k, _)| k <= key)),
                Seek::Floor(key) => backward(entries.partition_point(|(k, _)| k <= key)),
                Seek::Before(key) => backward(entries.partition_point(|(k, _)| k < key)),
            }
        };
        let result = match landing {
            Landing::At(index) => Ok(Some(self.position_at(&leaf, &body, index))),
            Landing::Next => self.neighbour(&leaf, true),
            Landing::Prev => self.neighbour(&leaf, false),
            Landing::Nowhere => Ok(None),
        };
        self.hooks.leave(&leaf, Mode::Read);
        result
    }

    /// Takes a position at `index` of an entered leaf.
    fn position_at(&self, leaf: &Arc<Node>, body: &NodeBody, index: usize) -> Position {
        let (key, value) = body.read().leaf().entries[index].clone();
        self.hooks.reserve(leaf);
        Position {
            leaf: leaf.clone(),
            index,
            version: self.version(),
            key,
            value,
        }
    }

    /// Takes a position at the near end of the leaf next to an entered leaf.
    fn neighbour(&self, leaf: &Arc<Node>, forward: bool) -> Result<Option<Position>> {
        let sibling = if forward {
            leaf.next_leaf()
        } else {
            leaf.prev_leaf()
        };
        let Some(sibling) = sibling else {
            return Ok(None);
        };
        let body = self.hooks.enter(&sibling, Mode::Read)?;
        let len = body.read().len();
        let position = match len {
            0 => None,
            _ if forward => Some(self.position_at(&sibling, &body, 0)),
            _ => Some(self.position_at(&sibling, &body, len - 1)),
        };
        self.hooks.leave(&sibling, Mode::Read);
        Ok(position)
    }

    fn split_leaf(
        &self,
        op: &mut WriteOp<'_, H>,
        leaf: &Arc<Node>,
        body: &Arc<NodeBody>,
    ) -> Result<(Key, Arc<Node>)> {
        let right = Node::fresh(NodeData::empty_leaf());
        let right_body = op.enter(&right)?;
        let next = leaf.next_leaf();
        let next_body = match &next {
            Some(next) => Some(op.enter(next)?),
            None => None,
        };
        let mut group = vec![body, &right_body];
        group.extend(next_body.as_ref());
        op.lock(&group);
        self.hooks.insert(&right)?;

        let right_path = right.path().map(str::to_string);
        let separator = {
            let mut data = body.write();
            let mut right_data = right_body.write();
            let (left, new) = (data.leaf_mut(), right_data.leaf_mut());
            let mid = left.entries.len() / 2;
            new.entries = left.entries.split_off(mid);
            new.prev = leaf.path().map(str::to_string);
            new.next = left.next.take();
            left.next = right_path.clone();
            new.entries[0].0.clone()
        };
        if let Some(next_body) = &next_body {
            next_body.write().leaf_mut().prev = right_path;
        }
        for node in [Some(leaf), Some(&right), next.as_ref()].into_iter().flatten() {
            node.relink();
            self.hooks.insert(node)?;
        }
        Ok((separator, right))
    }

    fn split_internal(
        &self,
        op: &mut WriteOp<'_, H>,
        node: &Arc<Node>,
        body: &Arc<NodeBody>,
    ) -> Result<(Key, Arc<Node>)> {
        let right = Node::fresh(NodeData::Internal(InternalData::default()));
        let right_body = op.enter(&right)?;
        op.lock(&[body, &right_body]);
        let separator = {
            let mut data = body.write();
            let mut right_data = right_body.write();
            let (left, new) = (data.internal_mut(), right_data.internal_mut());
            let mid = left.children.len() / 2;
            new.children = left.children.split_off(mid);
            new.keys = left.keys.split_off(mid);
            left.keys.remove(mid - 1)
        };
        self.hooks.insert(&right)?;
        self.hooks.insert(node)?;
        Ok((separator, right))
    }

    /// Restores the size bounds after an erasure shrank `node`, walking up
    /// `path` for as long as merges shrink the parent too.
    fn rebalance(
        &self,
        op: &mut WriteOp<'_, H>,
        mut path: Vec<Step>,
        mut node: Arc<Node>,
        mut body: Arc<NodeBody>,
    ) -> Result<()> {
        loop {
            let Some(Step {
                node: parent,
                body: parent_body,
                index,
            }) = path.pop()
            else {
                return self.shrink_root(&node, &body);
            };
            let min = if node.is_leaf() {
                self.min_leaf()
            } else {
                self.min_internal()
            };
            if body.read().len() >= min {
                return Ok(());
            }

            let from_left = index > 0;
            let sibling_index = if from_left { index - 1 } else { index + 1 };
            let sibling = parent_body.read().internal().children[sibling_index].clone();
            let sibling_body = op.enter(&sibling)?;
            let spare = sibling_body.read().len() > min;
            let (left_index, left, right) = if from_left {
                (sibling_index, (&sibling, &sibling_body), (&node, &body))
            } else {
                (index, (&node, &body), (&sibling, &sibling_body))
            };

            if spare {
                return self.borrow(op, (&parent, &parent_body), left_index, left, right, from_left);
            }
            self.merge(op, (&parent, &parent_body), left_index, left, right)?;
            node = parent;
            body = parent_body;
        }
    }

    /// Moves one entry or child from the sibling with spare capacity to the
    /// other one, through the separator between them.
    fn borrow(
        &self,
        op: &mut WriteOp<'_, H>,
        parent: (&Arc<Node>, &Arc<NodeBody>),
        left_index: usize,
        left: (&Arc<Node>, &Arc<NodeBody>),
        right: (&Arc<Node>, &Arc<NodeBody>),
        from_left: bool,
    ) -> Result<()> {
        op.lock(&[parent.1, left.1, right.1]);
        {
            let mut parent_data = parent.1.write();
            let separator = &mut parent_data.internal_mut().keys[left_index];
            let mut left_data = left.1.write();
            let mut right_data = right.1.write();
            match (&mut *left_data, &mut *right_data) {
                (NodeData::Leaf(l), NodeData::Leaf(r)) => {
                    if from_left {
                        if let Some(entry) = l.entries.pop() {
                            r.entries.insert(0, entry);
                        }
                    } else if !r.entries.is_empty() {
                        l.entries.push(r.entries.remove(0));
                    }
                    *separator = r.entries[0].0.clone();
                }
                (NodeData::Internal(l), NodeData::Internal(r)) => {
                    if from_left {
                        if let (Some(child), Some(key)) = (l.children.pop(), l.keys.pop()) {
                            r.children.insert(0, child);
                            r.keys.insert(0, mem::replace(separator, key));
                        }
                    } else if !r.keys.is_empty() {
                        l.children.push(r.children.remove(0));
                        let key = r.keys.remove(0);
                        l.keys.push(mem::replace(separator, key));
                    }
                }
                _ => unreachable!("siblings of different kinds"),
            }
        }
        for node in [parent.0, left.0, right.0] {
            self.hooks.insert(node)?;
        }
        Ok(())
    }

    /// Folds `right` into `left` and unlinks it from the parent.
    fn merge(
        &self,
        op: &mut WriteOp<'_, H>,
        parent: (&Arc<Node>, &Arc<NodeBody>),
        left_index: usize,
        left: (&Arc<Node>, &Arc<NodeBody>),
        right: (&Arc<Node>, &Arc<NodeBody>),
    ) -> Result<()> {
        let far = if right.0.is_leaf() {
            right.0.next_leaf()
        } else {
            None
        };
        let far_body = match &far {
            Some(far) => Some(op.enter(far)?),
            None => None,
        };
        let mut group = vec![parent.1, left.1, right.1];
        group.extend(far_body.as_ref());
        op.lock(&group);
        {
            let mut parent_data = parent.1.write();
            let internal = parent_data.internal_mut();
            let separator = internal.keys.remove(left_index);
            internal.children.remove(left_index + 1);
            let mut left_data = left.1.write();
            let mut right_data = right.1.write();
            match (&mut *left_data, &mut *right_data) {
                (NodeData::Leaf(l), NodeData::Leaf(r)) => {
                    l.entries.append(&mut r.entries);
                    l.next = r.next.take();
                }
                (NodeData::Internal(l), NodeData::Internal(r)) => {
                    l.keys.push(separator);
                    l.keys.append(&mut r.keys);
                    l.children.append(&mut r.children);
                }
                _ => unreachable!("siblings of different kinds"),
            }
        }
        if let Some(far_body) = &far_body {
            far_body.write().leaf_mut().prev = left.0.path().map(str::to_string);
        }
        self.hooks.remove(right.0);
        left.0.relink();
        if let Some(far) = &far {
            far.relink();
            self.hooks.insert(far)?;
        }
        self.hooks.insert(left.0)?;
        self.hooks.insert(parent.0)
    }

    /// Collapses a root with a single child, or drops an empty root leaf.
    fn shrink_root(&self, node: &Arc<Node>, body: &NodeBody) -> Result<()> {
        let replacement = match &*body.read() {
            NodeData::Internal(internal) if internal.children.len() == 1 => {
                internal.children[0].clone()
            }
            NodeData::Leaf(leaf) if leaf.entries.is_empty() && node.path().is_some() => {
                Node::fresh(NodeData::empty_leaf())
            }
            _ => return Ok(()),
        };
        self.hooks.remove(node);
        self.root.lock().unwrap().node = replacement;
        Ok(())
    }

    fn clear_node(&self, node: &Arc<Node>) -> Result<()> {
        let body = self.hooks.enter(node, Mode::Write)?;
        let children = match &*body.read() {
            NodeData::Internal(internal) => internal.children.clone(),
            NodeData::Leaf(_) => Vec::new(),
        };
        let result = children.iter().try_for_each(|child| self.clear_node(child));
        if result.is_ok() {
            self.hooks.remove(node);
        }
        self.hooks.leave(node, Mode::Write);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::{BPlusTree, Seek};
    use crate::error::{ForestError, Result};
    use crate::hooks::TreeHooks;
    use crate::key::{Key, Value};
    use crate::lock::Mode;
    use crate::node::{Node, NodeBody, NodeData};

    /// Keeps every node in memory, naming nodes by a counter.
    #[derive(Default)]
    struct MemoryHooks {
        next_name: AtomicU64,
        bodies: Mutex<HashMap<String, Arc<NodeBody>>>,
        reserved: AtomicI64,
        bases: AtomicU64,
    }

    impl TreeHooks for MemoryHooks {
        fn tree_name(&self) -> &str {
            "memory"
        }

        fn enter(&self, node: &Arc<Node>, mode: Mode) -> Result<Arc<NodeBody>> {
            node.travel.lock(mode);
            let entered = node.owner.enter(|| {
                if node.is_ghost() {
                    let path = node.path().unwrap_or_default();
                    let body = self.bodies.lock().unwrap().get(path).cloned();
                    node.attach(body.ok_or_else(|| ForestError::KeyNotFound(path.into()))?);
                }
                Ok(())
            });
            match entered.map(|_| node.body()) {
                Ok(Some(body)) => Ok(body),
                Ok(None) => unreachable!(),
                Err(e) => {
                    node.travel.unlock(mode);
                    Err(e)
                }
            }
        }

        fn leave(&self, node: &Arc<Node>, mode: Mode) {
            node.owner.leave(|| ());
            node.travel.unlock(mode);
        }

        fn insert(&self, node: &Arc<Node>) -> Result<()> {
            let body = node.body().unwrap();
            if node.path().is_none() {
                let name = format!("n{}", self.next_name.fetch_add(1, Ordering::SeqCst));
                node.set_path(&name);
                body.set_path(&name);
                self.bodies.lock().unwrap().insert(name, body);
            }
            Ok(())
        }

        fn remove(&self, node: &Arc<Node>) {
            if let Some(path) = node.path() {
                self.bodies.lock().unwrap().remove(path);
            }
        }

        fn reserve(&self, _node: &Arc<Node>) {
            self.reserved.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self, _node: &Arc<Node>) {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }

        fn save_base(&self, _root: &Arc<Node>, _count: u64, _factor: usize) -> Result<()> {
            self.bases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tree(factor: usize) -> BPlusTree<MemoryHooks> {
        BPlusTree::new(
            MemoryHooks::default(),
            factor,
            Node::fresh(NodeData::empty_leaf()),
            0,
        )
    }

    fn value(n: i64) -> Value {
        Value::from(n.to_string().into_bytes())
    }

    fn read(value: &Value) -> i64 {
        String::from_utf8(value.read().unwrap()).unwrap().parse().unwrap()
    }

    /// Walks the whole tree checking its shape and returns its keys in order.
    fn check(tree: &BPlusTree<MemoryHooks>) -> Vec<Key> {
        struct Walk {
            keys: Vec<Key>,
            leaves: Vec<(usize, Option<String>, Option<String>, Option<String>)>,
        }

        fn walk(
            tree: &BPlusTree<MemoryHooks>,
            node: &Arc<Node>,
            depth: usize,
            bounds: (Option<&Key>, Option<&Key>),
            is_root: bool,
            out: &mut Walk,
        ) {
            let body = tree.hooks.enter(node, Mode::Read).unwrap();
            let data = body.read();
            match &*data {
                NodeData::Leaf(leaf) => {
                    assert!(leaf.entries.len() <= tree.factor);
                    if !is_root {
                        assert!(leaf.entries.len() >= tree.min_leaf());
                    }
                    for (key, _) in &leaf.entries {
                        assert!(bounds.0.is_none_or(|low| low <= key));
                        assert!(bounds.1.is_none_or(|high| key < high));
                        out.keys.push(key.clone());
                    }
                    out.leaves.push((
                        depth,
                        node.path().map(str::to_string),
                        leaf.prev.clone(),
                        leaf.next.clone(),
                    ));
                }
                NodeData::Internal(internal) => {
                    assert_eq!(internal.keys.len() + 1, internal.children.len());
                    assert!(internal.children.len() <= tree.factor);
                    assert!(internal.children.len() >= if is_root { 2 } else { tree.min_internal() });
                    assert!(internal.keys.windows(2).all(|w| w[0] < w[1]));
                    for (i, child) in internal.children.iter().enumerate() {
                        let low = if i == 0 { bounds.0 } else { Some(&internal.keys[i - 1]) };
                        let high = internal.keys.get(i).or(bounds.1);
                        walk(tree, child, depth + 1, (low, high), false, out);
                    }
                }
            }
            drop(data);
            tree.hooks.leave(node, Mode::Read);
        }

        let mut out = Walk {
            keys: Vec::new(),
            leaves: Vec::new(),
        };
        let root = tree.root();
        walk(tree, &root, 0, (None, None), true, &mut out);

        assert!(out.keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(out.keys.len() as u64, tree.len());
        let depth = out.leaves[0].0;
        assert!(out.leaves.iter().all(|leaf| leaf.0 == depth));
        assert_eq!(out.leaves[0].2, None);
        assert_eq!(out.leaves[out.leaves.len() - 1].3, None);
        for pair in out.leaves.windows(2) {
            assert_eq!(pair[0].3, pair[1].1);
            assert_eq!(pair[1].2, pair[0].1);
        }
        out.keys
    }

    fn scan(tree: &BPlusTree<MemoryHooks>, forward: bool) -> Vec<Key> {
        let mut keys = Vec::new();
        let start = if forward { Seek::First } else { Seek::Last };
        let mut position = tree.seek(&start).unwrap();
        while let Some(p) = position {
            keys.push(p.key().clone());
            position = tree.step(p, forward).unwrap();
        }
        keys
    }

    #[test]
    fn grows_and_shrinks() {
        let tree = tree(3);
        for n in 0..100 {
            assert!(tree.insert(Key::Int(n), value(n * n), false).unwrap());
        }
        assert_eq!(check(&tree), (0..100).map(Key::Int).collect::<Vec<_>>());
        assert!(!tree.insert(Key::Int(7), value(0), false).unwrap());
        assert_eq!(read(&tree.find(&Key::Int(7)).unwrap().unwrap()), 49);
        assert!(!tree.insert(Key::Int(7), value(-1), true).unwrap());
        assert_eq!(read(&tree.find(&Key::Int(7)).unwrap().unwrap()), -1);

        for n in (0..100).rev().step_by(2) {
            assert!(tree.erase(&Key::Int(n)).unwrap());
            check(&tree);
        }
        assert!(!tree.erase(&Key::Int(1)).unwrap());
        assert_eq!(tree.len(), 50);
        for n in (0..100).step_by(2) {
            assert!(tree.erase(&Key::Int(n)).unwrap());
        }
        assert!(tree.is_empty());
        assert!(check(&tree).is_empty());
        assert!(tree.root().path().is_none());
        assert!(tree.hooks.bodies.lock().unwrap().is_empty());
    }

    #[test]
    fn bounds() {
        let tree = tree(4);
        for c in ('a'..='y').step_by(2) {
            tree.insert(Key::from(c.to_string()), value(0), false).unwrap();
        }
        let seek = |seek: Seek| {
            let position = tree.seek(&seek).unwrap();
            let key = position.as_ref().map(|p| p.key().to_string());
            if let Some(position) = position {
                tree.release(position);
            }
            key
        };
        let k = |s: &str| Key::from(s);
        assert_eq!(seek(Seek::Floor(k("b"))).as_deref(), Some("a"));
        assert_eq!(seek(Seek::Ceil(k("b"))).as_deref(), Some("c"));
        assert_eq!(seek(Seek::Floor(k("c"))).as_deref(), Some("c"));
        assert_eq!(seek(Seek::Ceil(k("c"))).as_deref(), Some("c"));
        assert_eq!(seek(Seek::After(k("c"))).as_deref(), Some("e"));
        assert_eq!(seek(Seek::Before(k("c"))).as_deref(), Some("a"));
        assert_eq!(seek(Seek::Floor(k("0"))), None);
        assert_eq!(seek(Seek::Ceil(k("z"))), None);
        assert_eq!(seek(Seek::First).as_deref(), Some("a"));
        assert_eq!(seek(Seek::Last).as_deref(), Some("y"));
        assert_eq!(tree.hooks.reserved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cursor_survives_changes() {
        let tree = tree(3);
        for n in 0..20 {
            tree.insert(Key::Int(n * 10), value(n), false).unwrap();
        }
        let position = tree.seek(&Seek::Ceil(Key::Int(45))).unwrap().unwrap();
        assert_eq!(position.key(), &Key::Int(50));

        // Erase the next key and add one in between: the step re-seeks.
        tree.erase(&Key::Int(60)).unwrap();
        tree.insert(Key::Int(55), value(0), false).unwrap();
        let position = tree.step(position, true).unwrap().unwrap();
        assert_eq!(position.key(), &Key::Int(55));
        let position = tree.step(position, true).unwrap().unwrap();
        assert_eq!(position.key(), &Key::Int(70));
        let position = tree.step(position, false).unwrap().unwrap();
        assert_eq!(position.key(), &Key::Int(55));
        tree.release(position);
        assert_eq!(tree.hooks.reserved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_removes_every_node() {
        let tree = tree(3);
        for n in 0..50 {
            tree.insert(Key::Int(n), value(n), false).unwrap();
        }
        tree.clear().unwrap();
        assert!(tree.is_empty());
        assert!(tree.hooks.bodies.lock().unwrap().is_empty());
        assert_eq!(tree.seek(&Seek::First).unwrap().map(|p| p.key().clone()), None);
        tree.insert(Key::Int(1), value(1), false).unwrap();
        assert_eq!(check(&tree), vec![Key::Int(1)]);
    }

    #[test]
    fn retired_tree_refuses_every_operation() {
        let tree = tree(3);
        for n in 0..20 {
            tree.insert(Key::Int(n), value(n), false).unwrap();
        }
        let position = tree.seek(&Seek::First).unwrap().unwrap();
        let bases = tree.hooks.bases.load(Ordering::SeqCst);
        tree.retire().unwrap();
        tree.retire().unwrap();
        assert!(tree.hooks.bodies.lock().unwrap().is_empty());
        assert_eq!(tree.hooks.bases.load(Ordering::SeqCst), bases);

        let gone = |result: Result<()>| {
            assert!(matches!(result, Err(ForestError::TreeNotFound(name)) if name == "memory"));
        };
        gone(tree.step(position, true).map(drop));
        gone(tree.insert(Key::Int(100), value(100), false).map(drop));
        gone(tree.erase(&Key::Int(1)).map(drop));
        gone(tree.find(&Key::Int(1)).map(drop));
        gone(tree.seek(&Seek::Last).map(drop));
        gone(tree.clear());
        assert!(tree.hooks.bodies.lock().unwrap().is_empty());
        assert_eq!(tree.hooks.reserved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn readers_and_writers() {
        let tree = Arc::new(tree(4));
        for n in (0..400).step_by(2) {
            tree.insert(Key::Int(n), value(n), false).unwrap();
        }
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        match t % 4 {
                            0 => {
                                tree.insert(Key::Int(i * 4 + 1), value(0), false).unwrap();
                            }
                            1 => {
                                tree.erase(&Key::Int(i * 4 + 1)).unwrap();
                            }
                            2 => {
                                let keys = scan(&tree, true);
                                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                                let evens = keys.iter().filter(|k| k.as_int().unwrap() % 2 == 0).count();
                                assert_eq!(evens, 200);
                            }
                            _ => {
                                let keys = scan(&tree, false);
                                assert!(keys.windows(2).all(|w| w[0] > w[1]));
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        check(&tree);
        assert_eq!(tree.hooks.reserved.load(Ordering::SeqCst), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(i64, bool),
        Erase(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..64, any::<bool>()).prop_map(|(k, o)| Op::Insert(k, o)),
            (0i64..64).prop_map(Op::Erase),
        ]
    }

    proptest! {
        #[test]
        fn matches_btreemap(factor in 3usize..7, ops in prop::collection::vec(op(), 1..200)) {
            let tree = tree(factor);
            let mut model = BTreeMap::new();
            for (i, op) in ops.into_iter().enumerate() {
                let i = i as i64;
                match op {
                    Op::Insert(key, overwrite) => {
                        let fresh = !model.contains_key(&key);
                        if fresh || overwrite {
                            model.insert(key, i);
                        }
                        prop_assert_eq!(tree.insert(Key::Int(key), value(i), overwrite).unwrap(), fresh);
                    }
                    Op::Erase(key) => {
                        prop_assert_eq!(tree.erase(&Key::Int(key)).unwrap(), model.remove(&key).is_some());
                    }
                }
            }
            let keys = check(&tree);
            prop_assert_eq!(keys, model.keys().map(|k| Key::Int(*k)).collect::<Vec<_>>());
            let mut backward = scan(&tree, false);
            backward.reverse();
            prop_assert_eq!(backward, scan(&tree, true));
            for (key, expected) in &model {
                prop_assert_eq!(read(&tree.find(&Key::Int(*key)).unwrap().unwrap()), *expected);
            }
            let probe = Key::Int(31);
            let floor = tree.seek(&Seek::Floor(probe.clone())).unwrap();
            prop_assert_eq!(
                floor.as_ref().map(|p| p.key().clone()),
                model.range(..=31).next_back().map(|(k, _)| Key::Int(*k))
            );
            if let Some(floor) = floor {
                tree.release(floor);
            }
        }
    }
}
