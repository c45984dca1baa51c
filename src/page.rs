use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use url::Url;

/// The page tree as shared between the host adapter, the upgrade engine and
/// the interceptors. Single-threaded cooperative model throughout.
pub type SharedTree = Rc<RefCell<PageTree>>;

/// Handle into a [`PageTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

/// A file the user picked into an upload control, mirrored from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelection {
    pub name: String,
    pub media_type: String,
    pub bytes: Rc<[u8]>,
}

impl FileSelection {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes: Rc::from(bytes),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeKind {
    Element { tag: String },
    Text,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    attributes: BTreeMap<String, String>,
    /// Inline style properties, kebab-case keys.
    style: BTreeMap<String, String>,
    /// Resolved style as the host's renderer computed it. The host mirror
    /// fills this in; this crate only reads it.
    computed_style: BTreeMap<String, String>,
    file_payload: Option<FileSelection>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn element(tag: &str) -> Self {
        Self {
            kind: NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
            },
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            computed_style: BTreeMap::new(),
            file_payload: None,
            parent: None,
            children: Vec::new(),
        }
    }

    fn text() -> Self {
        Self {
            kind: NodeKind::Text,
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            computed_style: BTreeMap::new(),
            file_payload: None,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// Mirror of the host document's element tree. The host adapter renders into
/// this tree and forwards its subtree-change notifications; the upgrade
/// engine reads and rewrites it.
///
/// Insertions under an attached parent are journaled; the runtime drains the
/// journal into mutation batches for the watcher.
pub struct PageTree {
    base_url: Url,
    nodes: Vec<Node>,
    body: NodeId,
    journal: Vec<NodeId>,
}

impl PageTree {
    pub fn new(base_url: Url) -> Self {
        let mut tree = Self {
            base_url,
            nodes: Vec::new(),
            body: NodeId(0),
            journal: Vec::new(),
        };
        tree.body = tree.alloc(Node::element("body"));
        tree
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(Node::element(tag))
    }

    pub fn create_text(&mut self) -> NodeId {
        self.alloc(Node::text())
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element { .. })
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element { tag } => Some(tag),
            NodeKind::Text => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// Whether `id` is reachable from the document body.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut cursor = id;
        loop {
            if cursor == self.body {
                return true;
            }
            match self.node(cursor).parent {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    /// Append `child` under `parent`. Attaching under a live subtree records
    /// the child in the mutation journal, like a subtree-change notification.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
        if self.is_attached(parent) {
            self.journal.push(child);
        }
    }

    /// Remove `id` from its parent's child list. The node stays in the arena;
    /// late writes to a detached node are harmless.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).parent {
            self.node_mut(parent).children.retain(|child| *child != id);
            self.node_mut(id).parent = None;
        }
    }

    /// Atomically swap `replacement` into `old`'s position: one node out, one
    /// node in, same parent, same sibling index.
    pub fn replace_node(&mut self, old: NodeId, replacement: NodeId) {
        let Some(parent) = self.node(old).parent else {
            return;
        };
        self.detach(replacement);
        let index = self
            .node(parent)
            .children
            .iter()
            .position(|child| *child == old)
            .expect("old node is a child of its parent");
        self.node_mut(parent).children[index] = replacement;
        self.node_mut(replacement).parent = Some(parent);
        self.node_mut(old).parent = None;
        if self.is_attached(parent) {
            self.journal.push(replacement);
        }
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.node(id).attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        self.node_mut(id)
            .attributes
            .insert(name.to_owned(), value.to_owned());
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) {
        self.node_mut(id).attributes.remove(name);
    }

    pub fn style(&self, id: NodeId, property: &str) -> Option<&str> {
        self.node(id).style.get(property).map(String::as_str)
    }

    pub fn set_style(&mut self, id: NodeId, property: &str, value: &str) {
        self.node_mut(id)
            .style
            .insert(property.to_owned(), value.to_owned());
    }

    pub fn computed_style(&self, id: NodeId, property: &str) -> Option<&str> {
        self.node(id).computed_style.get(property).map(String::as_str)
    }

    pub fn set_computed_style(&mut self, id: NodeId, property: &str, value: &str) {
        self.node_mut(id)
            .computed_style
            .insert(property.to_owned(), value.to_owned());
    }

    pub fn class_list(&self, id: NodeId) -> Vec<String> {
        self.attribute(id, "class")
            .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        let mut classes = self.class_list(id);
        if !classes.iter().any(|existing| existing == class) {
            classes.push(class.to_owned());
        }
        self.set_attribute(id, "class", &classes.join(" "));
    }

    pub fn file_payload(&self, id: NodeId) -> Option<&FileSelection> {
        self.node(id).file_payload.as_ref()
    }

    pub fn set_file_payload(&mut self, id: NodeId, file: FileSelection) {
        self.node_mut(id).file_payload = Some(file);
    }

    /// Pre-order walk of `root` and everything beneath it.
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.node(id).children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Find the first element in the document with the given `id` attribute.
    pub fn element_by_id(&self, element_id: &str) -> Option<NodeId> {
        self.subtree(self.body)
            .into_iter()
            .find(|id| self.is_element(*id) && self.attribute(*id, "id") == Some(element_id))
    }

    /// Take the insertions journaled since the last drain.
    pub fn drain_mutations(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.journal)
    }
}
