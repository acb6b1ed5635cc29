//! In-memory mirror of the store's key namespace.
//!
//! The tree is deliberately untyped: it holds exactly the directories and
//! values present under the configured root, so that reconstruction from a
//! full recursive snapshot and reconstruction from an incremental change feed
//! converge on the same shape. Interpretation of records (aliases, redirects,
//! target maps) happens at resolution time, not here.
use std::collections::BTreeMap;

use crate::ports::store::StoreNode;

/// A node in the mirrored namespace: either a directory of named children or
/// a leaf value. Empty directories are legal and are never auto-pruned,
/// mirroring the store's deletion granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNode {
    Dir(BTreeMap<String, ConfigNode>),
    Value(String),
}

impl ConfigNode {
    fn dir() -> Self {
        ConfigNode::Dir(BTreeMap::new())
    }

    /// Child lookup; `None` for leaves and missing names.
    pub fn child(&self, name: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Dir(children) => children.get(name),
            ConfigNode::Value(_) => None,
        }
    }

    /// The leaf value, if this node is one.
    pub fn value(&self) -> Option<&str> {
        match self {
            ConfigNode::Value(v) => Some(v),
            ConfigNode::Dir(_) => None,
        }
    }

    /// Iterate over children of a directory node.
    pub fn children(&self) -> Option<&BTreeMap<String, ConfigNode>> {
        match self {
            ConfigNode::Dir(children) => Some(children),
            ConfigNode::Value(_) => None,
        }
    }

    fn ensure_dir(&mut self) -> &mut BTreeMap<String, ConfigNode> {
        // A value can only sit where a directory belongs when a snapshot and
        // the change feed race; the directory wins.
        if let ConfigNode::Value(_) = self {
            *self = ConfigNode::dir();
        }
        match self {
            ConfigNode::Dir(children) => children,
            ConfigNode::Value(_) => unreachable!("just converted to dir"),
        }
    }
}

/// The routing configuration tree, keyed by store-relative paths such as
/// `domains/example.com/ports/80/targets/10.0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTree {
    root: ConfigNode,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self {
            root: ConfigNode::dir(),
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl ConfigTree {
    /// Look up the node at a relative path. An empty path yields the root.
    pub fn get(&self, path: &str) -> Option<&ConfigNode> {
        let mut node = &self.root;
        for seg in segments(path) {
            node = node.child(seg)?;
        }
        Some(node)
    }

    /// Set the leaf at `path`, creating intermediate directories as needed.
    pub fn set(&mut self, path: &str, value: impl Into<String>) {
        let segs: Vec<&str> = segments(path).collect();
        let Some((leaf, dirs)) = segs.split_last() else {
            return;
        };
        let mut children = self.root.ensure_dir();
        for seg in dirs {
            children = children
                .entry((*seg).to_string())
                .or_insert_with(ConfigNode::dir)
                .ensure_dir();
        }
        children.insert((*leaf).to_string(), ConfigNode::Value(value.into()));
    }

    /// Create an (empty) directory at `path`, creating intermediates too.
    pub fn mkdir(&mut self, path: &str) {
        let mut children = self.root.ensure_dir();
        for seg in segments(path) {
            children = children
                .entry(seg.to_string())
                .or_insert_with(ConfigNode::dir)
                .ensure_dir();
        }
    }

    /// Remove the node at `path` (leaf or whole subtree). Ancestors emptied
    /// by the removal are left in place. Removing the root path clears the
    /// whole tree.
    pub fn remove(&mut self, path: &str) {
        let segs: Vec<&str> = segments(path).collect();
        let Some((leaf, dirs)) = segs.split_last() else {
            self.root = ConfigNode::dir();
            return;
        };
        let mut node = &mut self.root;
        for seg in dirs {
            match node {
                ConfigNode::Dir(children) => match children.get_mut(*seg) {
                    Some(next) => node = next,
                    None => return,
                },
                ConfigNode::Value(_) => return,
            }
        }
        if let ConfigNode::Dir(children) = node {
            children.remove(*leaf);
        }
    }

    /// Whether the tree holds any entries at all.
    pub fn is_empty(&self) -> bool {
        matches!(&self.root, ConfigNode::Dir(children) if children.is_empty())
    }

    /// Rebuild the tree from a full recursive snapshot rooted at `prefix`.
    ///
    /// Reconstruction strips `prefix` from every key and splits the remainder
    /// on `/`; it is lossless and idempotent, so a snapshot produces the same
    /// tree as replaying every individual change since the namespace was
    /// empty.
    pub fn from_snapshot(node: &StoreNode, prefix: &str) -> Self {
        let mut tree = ConfigTree::default();
        tree.merge_node(node, prefix);
        tree
    }

    fn merge_node(&mut self, node: &StoreNode, prefix: &str) {
        let rel = relative_key(&node.key, prefix);
        if !rel.is_empty() {
            if node.dir {
                self.mkdir(rel);
            } else {
                self.set(rel, node.value.clone().unwrap_or_default());
            }
        }
        for child in &node.nodes {
            self.merge_node(child, prefix);
        }
    }
}

/// Strip the root prefix and surrounding separators from an absolute key.
pub fn relative_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key).trim_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_creates_intermediate_directories() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/ports/80/targets/10.0.0.1", "1");

        let node = tree
            .get("domains/example.com/ports/80/targets/10.0.0.1")
            .unwrap();
        assert_eq!(node.value(), Some("1"));
        assert!(tree.get("domains/example.com/ports").is_some());
    }

    #[test]
    fn remove_leaves_empty_parents_in_place() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/ports/80/targets/10.0.0.1", "1");
        tree.remove("domains/example.com/ports/80/targets/10.0.0.1");

        let targets = tree.get("domains/example.com/ports/80/targets").unwrap();
        assert_eq!(targets.children().map(|c| c.len()), Some(0));
    }

    #[test]
    fn remove_missing_path_is_a_no_op() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/alias", "other.com:80");
        tree.remove("domains/nope/alias");
        assert_eq!(
            tree.get("domains/example.com/alias").and_then(|n| n.value()),
            Some("other.com:80")
        );
    }

    #[test]
    fn remove_root_clears_tree() {
        let mut tree = ConfigTree::default();
        tree.set("domains/example.com/redirect", "https://example.org");
        tree.remove("");
        assert!(tree.is_empty());
    }

    #[test]
    fn snapshot_matches_incremental_application() {
        let snapshot = StoreNode {
            key: "/junction".into(),
            dir: true,
            nodes: vec![StoreNode {
                key: "/junction/domains".into(),
                dir: true,
                nodes: vec![StoreNode {
                    key: "/junction/domains/example.com".into(),
                    dir: true,
                    nodes: vec![
                        StoreNode {
                            key: "/junction/domains/example.com/alias".into(),
                            value: Some("other.com:80".into()),
                            ..Default::default()
                        },
                        StoreNode {
                            key: "/junction/domains/example.com/subdomains".into(),
                            dir: true,
                            nodes: vec![],
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let from_snapshot = ConfigTree::from_snapshot(&snapshot, "/junction");

        let mut incremental = ConfigTree::default();
        incremental.set("domains/example.com/alias", "other.com:80");
        incremental.mkdir("domains/example.com/subdomains");

        assert_eq!(from_snapshot, incremental);
    }

    #[test]
    fn relative_key_strips_prefix_and_separators() {
        assert_eq!(
            relative_key("/junction/domains/example.com", "/junction"),
            "domains/example.com"
        );
        assert_eq!(relative_key("/junction", "/junction"), "");
    }
}
