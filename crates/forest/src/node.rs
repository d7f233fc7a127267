//! In-memory tree nodes.
//!
//! A [Node] is a shell: it names a node (by its file name, once it has one)
//! and carries the travel and owner locks. The shell's payload, a
//! [NodeBody], is present only while the node is live. Bodies are shared
//! through the node caches, so every shell naming the same file sees the
//! same body.
//!
//! Leaf bodies record their siblings by file name. A live leaf shell
//! additionally holds ghost shells for its siblings, created from those
//! names, so a cursor can step to a neighbour without holding a reference to
//! the neighbour's payload.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use forest_storage::FileReader;

use crate::codec::{CodecError, InternalRecord, LeafHeader};
use crate::key::{Key, Value};
use crate::lock::{ChangeLock, OwnerLock, TravelLock};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Internal,
    Leaf,
}

impl NodeKind {
    pub fn code(self) -> u8 {
        match self {
            NodeKind::Internal => 0,
            NodeKind::Leaf => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NodeKind::Internal),
            1 => Some(NodeKind::Leaf),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct InternalData {
    /// `keys[i]` is the least key under `children[i + 1]`, or a lower bound
    /// for it after erasures.
    pub keys: Vec<Key>,
    pub children: Vec<Arc<Node>>,
}

impl InternalData {
    /// Index of the child whose range contains `key`.
    pub fn child_index(&self, key: &Key) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    pub fn to_record(&self) -> Result<InternalRecord, CodecError> {
        let child_kind = match self.children.first() {
            Some(child) => child.kind(),
            None => return Err(CodecError::Childless),
        };
        let children = self
            .children
            .iter()
            .map(|child| child.path().map(str::to_string).ok_or(CodecError::Unnamed))
            .collect::<Result<_, _>>()?;
        Ok(InternalRecord {
            child_kind,
            keys: self.keys.clone(),
            children,
        })
    }
}

#[derive(Debug, Default)]
pub struct LeafData {
    pub entries: Vec<(Key, Value)>,
    pub prev: Option<String>,
    pub next: Option<String>,
}

impl LeafData {
    /// Binary search for `key` among the entries.
    pub fn search(&self, key: &Key) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn header(&self) -> LeafHeader {
        LeafHeader {
            prev: self.prev.clone(),
            next: self.next.clone(),
            keys: self.entries.iter().map(|(k, _)| k.clone()).collect(),
            lengths: self.entries.iter().map(|(_, v)| v.len()).collect(),
        }
    }
}

#[derive(Debug)]
pub enum NodeData {
    Internal(InternalData),
    Leaf(LeafData),
}

impl NodeData {
    pub fn empty_leaf() -> Self {
        NodeData::Leaf(LeafData::default())
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeData::Internal(_) => NodeKind::Internal,
            NodeData::Leaf(_) => NodeKind::Leaf,
        }
    }

    pub fn internal(&self) -> &InternalData {
        match self {
            NodeData::Internal(data) => data,
            NodeData::Leaf(_) => unreachable!("leaf payload where an internal one was expected"),
        }
    }

    pub fn internal_mut(&mut self) -> &mut InternalData {
        match self {
            NodeData::Internal(data) => data,
            NodeData::Leaf(_) => unreachable!("leaf payload where an internal one was expected"),
        }
    }

    pub fn leaf(&self) -> &LeafData {
        match self {
            NodeData::Leaf(data) => data,
            NodeData::Internal(_) => unreachable!("internal payload where a leaf was expected"),
        }
    }

    pub fn leaf_mut(&mut self) -> &mut LeafData {
        match self {
            NodeData::Leaf(data) => data,
            NodeData::Internal(_) => unreachable!("internal payload where a leaf was expected"),
        }
    }

    /// Number of entries (leaf) or children (internal).
    pub fn len(&self) -> usize {
        match self {
            NodeData::Internal(data) => data.children.len(),
            NodeData::Leaf(data) => data.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The payload of a node.
pub struct NodeBody {
    kind: NodeKind,
    path: OnceLock<String>,
    /// Held while the payload is changed or serialized.
    pub change: ChangeLock,
    data: RwLock<NodeData>,
    /// The leaf file that stored values currently point into.
    file: Mutex<Option<Arc<dyn FileReader>>>,
}

impl NodeBody {
    /// A body that has not been written anywhere yet.
    pub fn new(data: NodeData) -> Self {
        Self {
            kind: data.kind(),
            path: OnceLock::new(),
            change: ChangeLock::new(),
            data: RwLock::new(data),
            file: Mutex::new(None),
        }
    }

    /// A body loaded from `path`.
    pub fn loaded(path: &str, data: NodeData, file: Option<Arc<dyn FileReader>>) -> Self {
        let body = Self::new(data);
        body.set_path(path);
        *body.file.lock().unwrap() = file;
        body
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn path(&self) -> Option<&str> {
        self.path.get().map(String::as_str)
    }

    pub(crate) fn set_path(&self, path: &str) {
        let assigned = self.path.get_or_init(|| path.to_string());
        debug_assert_eq!(assigned, path, "node renamed");
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NodeData> {
        self.data.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NodeData> {
        self.data.write().unwrap()
    }

    pub fn file(&self) -> Option<Arc<dyn FileReader>> {
        self.file.lock().unwrap().clone()
    }

    pub(crate) fn set_file(&self, file: Option<Arc<dyn FileReader>>) {
        *self.file.lock().unwrap() = file;
    }
}

impl Debug for NodeBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBody")
            .field("kind", &self.kind)
            .field("path", &self.path())
            .finish()
    }
}

struct Live {
    body: Arc<NodeBody>,
    prev: Option<Arc<Node>>,
    next: Option<Arc<Node>>,
}

impl Live {
    fn new(body: Arc<NodeBody>) -> Self {
        let (prev, next) = match &*body.read() {
            NodeData::Leaf(leaf) => (
                leaf.prev.clone().map(|p| Node::ghost(NodeKind::Leaf, p)),
                leaf.next.clone().map(|p| Node::ghost(NodeKind::Leaf, p)),
            ),
            NodeData::Internal(_) => (None, None),
        };
        Self { body, prev, next }
    }
}

/// A node shell.
pub struct Node {
    kind: NodeKind,
    path: OnceLock<String>,
    pub travel: TravelLock,
    pub owner: OwnerLock,
    live: Mutex<Option<Live>>,
}

impl Node {
    /// A shell for the node stored at `path`, with nothing loaded.
    pub fn ghost(kind: NodeKind, path: String) -> Arc<Self> {
        Arc::new(Self {
            kind,
            path: OnceLock::from(path),
            travel: TravelLock::new(),
            owner: OwnerLock::new(),
            live: Mutex::new(None),
        })
    }

    /// A new node that has no file yet. It stays live until it is given one.
    pub fn fresh(data: NodeData) -> Arc<Self> {
        Arc::new(Self {
            kind: data.kind(),
            path: OnceLock::new(),
            travel: TravelLock::new(),
            owner: OwnerLock::new(),
            live: Mutex::new(Some(Live::new(Arc::new(NodeBody::new(data))))),
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn path(&self) -> Option<&str> {
        self.path.get().map(String::as_str)
    }

    pub(crate) fn set_path(&self, path: &str) {
        let assigned = self.path.get_or_init(|| path.to_string());
        debug_assert_eq!(assigned, path, "node renamed");
    }

    pub fn is_ghost(&self) -> bool {
        self.live.lock().unwrap().is_none()
    }

    /// The payload, if the node is live.
    pub fn body(&self) -> Option<Arc<NodeBody>> {
        self.live.lock().unwrap().as_ref().map(|live| live.body.clone())
    }

    pub(crate) fn attach(&self, body: Arc<NodeBody>) {
        let mut live = self.live.lock().unwrap();
        debug_assert!(live.is_none(), "materializing a live node: {self:?}");
        *live = Some(Live::new(body));
    }

    pub(crate) fn detach(&self) -> Option<Arc<NodeBody>> {
        self.live.lock().unwrap().take().map(|live| live.body)
    }

    /// Rebuilds the sibling shells after the leaf's links changed.
    pub(crate) fn relink(&self) {
        let mut live = self.live.lock().unwrap();
        if let Some(current) = live.take() {
            *live = Some(Live::new(current.body));
        }
    }

    /// Shell of the leaf to the right. `None` for the last leaf or a ghost.
    pub fn next_leaf(&self) -> Option<Arc<Node>> {
        self.live.lock().unwrap().as_ref().and_then(|live| live.next.clone())
    }

    /// Shell of the leaf to the left. `None` for the first leaf or a ghost.
    pub fn prev_leaf(&self) -> Option<Arc<Node>> {
        self.live.lock().unwrap().as_ref().and_then(|live| live.prev.clone())
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("path", &self.path())
            .finish()
    }
}
