use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paths;

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
    BrokenSymlink,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
}

impl Node {
    fn new(kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            parent,
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct DirectoryTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::new(NodeKind::Directory, None))],
            free: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(current).and_then(Option::take) {
                stack.extend(node.children.into_values());
                self.free.push(current);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = ROOT;
        for part in paths::components(path) {
            current = *self.node(current)?.children.get(part)?;
        }
        Some(current)
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.find(path)
            .and_then(|id| self.node(id))
            .map(|n| n.kind)
    }

    pub fn children(&self, path: &str) -> Vec<(String, NodeKind)> {
        let Some(node) = self.find(path).and_then(|id| self.node(id)) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|(name, id)| self.node(*id).map(|c| (name.clone(), c.kind)))
            .collect()
    }

    pub fn is_expanded(&self, path: &str) -> bool {
        self.find(path)
            .and_then(|id| self.node(id))
            .map(|n| n.kind == NodeKind::Directory && !n.children.is_empty())
            .unwrap_or(false)
    }

    /// Makes sure every component of `path` exists as a directory node.
    /// A file node in the way is replaced.
    pub fn ensure_dir(&mut self, path: &str) -> NodeId {
        let mut current = ROOT;
        for part in paths::components(path) {
            let existing = self
                .node(current)
                .and_then(|n| n.children.get(part).copied());
            current = match existing {
                Some(id) if self.node(id).map(|n| n.kind) == Some(NodeKind::Directory) => id,
                Some(stale) => {
                    self.release_subtree(stale);
                    self.insert_child(current, part, NodeKind::Directory)
                }
                None => self.insert_child(current, part, NodeKind::Directory),
            };
        }
        current
    }

    fn insert_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = self.alloc(Node::new(kind, Some(parent)));
        if let Some(p) = self.node_mut(parent) {
            p.children.insert(name.to_string(), id);
        }
        id
    }

    /// Replaces the children of `path` with `listing`. Directories that keep
    /// their name and kind keep their already-expanded subtree.
    pub fn reconcile(&mut self, path: &str, listing: &[(String, NodeKind)]) {
        let dir = self.ensure_dir(path);
        let mut old = match self.node_mut(dir) {
            Some(node) => std::mem::take(&mut node.children),
            None => return,
        };
        let mut fresh = BTreeMap::new();

        for (name, kind) in listing {
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let reuse = old.remove(name).and_then(|id| {
                if self.node(id).map(|n| n.kind) == Some(*kind) {
                    Some(id)
                } else {
                    self.release_subtree(id);
                    None
                }
            });
            let id = match reuse {
                Some(id) => id,
                None => self.alloc(Node::new(*kind, Some(dir))),
            };
            fresh.insert(name.clone(), id);
        }
        for (_, gone) in old {
            self.release_subtree(gone);
        }
        if let Some(node) = self.node_mut(dir) {
            node.children = fresh;
        }
    }

    /// Drops the node and its subtree. The root itself is only emptied.
    pub fn remove(&mut self, path: &str) -> bool {
        let Some(id) = self.find(path) else {
            return false;
        };
        if id == ROOT {
            let children = self
                .node_mut(ROOT)
                .map(|n| std::mem::take(&mut n.children))
                .unwrap_or_default();
            for (_, child) in children {
                self.release_subtree(child);
            }
            return true;
        }
        let name = paths::basename(path).to_string();
        let parent = self.node(id).and_then(|n| n.parent);
        if let Some(parent) = parent.and_then(|p| self.node_mut(p)) {
            parent.children.remove(&name);
        }
        self.release_subtree(id);
        true
    }

    /// The root plus every directory that has been expanded.
    pub fn expanded_dirs(&self) -> Vec<String> {
        let mut out = vec!["/".to_string()];
        let mut stack: Vec<(NodeId, String)> = vec![(ROOT, "/".to_string())];
        while let Some((id, path)) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            for (name, child_id) in node.children.iter().rev() {
                let Some(child) = self.node(*child_id) else {
                    continue;
                };
                if child.kind == NodeKind::Directory && !child.children.is_empty() {
                    let child_path = paths::join(&path, name);
                    out.push(child_path.clone());
                    stack.push((*child_id, child_path));
                }
            }
        }
        out
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        let mut root = BTreeMap::new();
        root.insert(String::new(), self.snapshot_node(ROOT));
        TreeSnapshot(root)
    }

    fn snapshot_node(&self, id: NodeId) -> SnapshotNode {
        match self.node(id) {
            Some(node) => match node.kind {
                NodeKind::File => SnapshotNode::File,
                NodeKind::BrokenSymlink => SnapshotNode::BrokenSymlink,
                NodeKind::Directory => SnapshotNode::Directory {
                    children: node
                        .children
                        .iter()
                        .map(|(name, child)| (name.clone(), self.snapshot_node(*child)))
                        .collect(),
                },
            },
            None => SnapshotNode::File,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotNode {
    File,
    Directory {
        children: BTreeMap<String, SnapshotNode>,
    },
    BrokenSymlink,
}

/// Owned copy of the cache handed to listeners. The single top-level key is
/// the empty string (the root).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot(pub BTreeMap<String, SnapshotNode>);

impl TreeSnapshot {
    pub fn get(&self, path: &str) -> Option<&SnapshotNode> {
        let mut current = self.0.get("")?;
        for part in paths::components(path) {
            match current {
                SnapshotNode::Directory { children } => current = children.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(name: &str) -> (String, NodeKind) {
        (name.to_string(), NodeKind::Directory)
    }

    fn file(name: &str) -> (String, NodeKind) {
        (name.to_string(), NodeKind::File)
    }

    #[test]
    fn ensure_dir_creates_every_ancestor() {
        let mut tree = DirectoryTree::new();
        tree.ensure_dir("/a/b/c");
        for p in ["/a", "/a/b", "/a/b/c"] {
            assert_eq!(tree.kind(p), Some(NodeKind::Directory), "{p}");
        }
        assert!(!tree.is_expanded("/a/b/c"));
        assert!(tree.is_expanded("/a"));
    }

    #[test]
    fn reconcile_preserves_expanded_subdirectories() {
        let mut tree = DirectoryTree::new();
        tree.reconcile("/", &[dir("a"), dir("z"), file("f")]);
        tree.reconcile("/a", &[dir("b"), file("x")]);
        tree.reconcile("/a/b", &[file("deep")]);

        tree.reconcile("/a", &[dir("b"), file("y")]);

        assert_eq!(tree.kind("/a/b/deep"), Some(NodeKind::File));
        assert_eq!(tree.kind("/a/x"), None);
        assert_eq!(tree.kind("/a/y"), Some(NodeKind::File));
        assert_eq!(tree.kind("/z"), Some(NodeKind::Directory));
    }

    #[test]
    fn reconcile_drops_subtree_when_kind_changes() {
        let mut tree = DirectoryTree::new();
        tree.reconcile("/", &[dir("a")]);
        tree.reconcile("/a", &[file("inner")]);
        tree.reconcile("/", &[file("a")]);
        assert_eq!(tree.kind("/a"), Some(NodeKind::File));
        assert_eq!(tree.find("/a/inner"), None);
        // released slots get reused
        let before = tree.nodes.len();
        tree.reconcile("/", &[dir("a"), dir("b")]);
        assert_eq!(tree.nodes.len(), before);
    }

    #[test]
    fn remove_deletes_subtree_only() {
        let mut tree = DirectoryTree::new();
        tree.reconcile("/", &[dir("a"), dir("b")]);
        tree.reconcile("/a", &[file("x")]);
        assert!(tree.remove("/a"));
        assert_eq!(tree.find("/a"), None);
        assert_eq!(tree.kind("/b"), Some(NodeKind::Directory));
        assert!(!tree.remove("/missing"));
        assert!(tree.remove("/"));
        assert!(tree.is_empty());
    }

    #[test]
    fn expanded_dirs_skips_unexpanded() {
        let mut tree = DirectoryTree::new();
        tree.reconcile("/", &[dir("a"), dir("b"), file("c")]);
        tree.reconcile("/a", &[dir("inner")]);
        assert_eq!(tree.expanded_dirs(), vec!["/", "/a"]);
    }

    #[test]
    fn snapshot_is_rooted_at_empty_key() {
        let mut tree = DirectoryTree::new();
        tree.reconcile("/", &[dir("etc"), ("dangling".into(), NodeKind::BrokenSymlink)]);
        let snap = tree.snapshot();
        assert!(snap.0.contains_key(""));
        assert_eq!(
            snap.get("/etc"),
            Some(&SnapshotNode::Directory {
                children: BTreeMap::new()
            })
        );
        assert_eq!(snap.get("/dangling"), Some(&SnapshotNode::BrokenSymlink));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.starts_with("{\"\":{\"type\":\"directory\""));
    }
}
