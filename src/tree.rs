//! Ordered tree with globally unique nodes.
//!
//! Describes a package's nested namespace. Built once from the manifest's
//! nested-array literal, optionally edited during configuration, then read
//! to derive per-package name hierarchies (dotted import-style paths and
//! underscore-joined artifact names).

use std::collections::BTreeSet;

use anyhow::{Result, bail};

/// A single tree node: a value and its ordered children.
///
/// The nested-literal form mirrors the manifest syntax: an array whose
/// first element is the node value and whose remaining elements are child
/// arrays, e.g. `["app", ["core"], ["util", ["fmt"]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub value: String,
    pub children: Vec<Node>,
}

impl Node {
    /// A node with no children.
    pub fn leaf(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            children: Vec::new(),
        }
    }

    /// A node with the given children.
    pub fn with_children(value: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            value: value.into(),
            children,
        }
    }

    /// Parse the nested-array literal form from a TOML value.
    ///
    /// Every element after the first must itself be an array; a bare string
    /// in child position is rejected so that malformed literals fail loudly
    /// instead of silently flattening.
    pub fn from_toml(value: &toml::Value) -> Result<Self> {
        let arr = match value {
            toml::Value::Array(arr) => arr,
            other => bail!("tree literal must be an array, got {other:?}"),
        };
        let Some(first) = arr.first() else {
            bail!("tree literal must not be empty");
        };
        let name = match first {
            toml::Value::String(s) => s.clone(),
            other => bail!("tree node value must be a string, got {other:?}"),
        };
        let mut children = Vec::new();
        for child in &arr[1..] {
            match child {
                toml::Value::Array(_) => children.push(Self::from_toml(child)?),
                other => bail!(
                    "children of tree node '{name}' must be arrays, got {other:?}"
                ),
            }
        }
        Ok(Self {
            value: name,
            children,
        })
    }

    fn flatten_into(&self, out: &mut Vec<String>) {
        out.push(self.value.clone());
        for child in &self.children {
            child.flatten_into(out);
        }
    }

    fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(Node::depth)
            .max()
            .unwrap_or(0)
    }
}

/// An ordered tree whose node values are unique across the whole tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    root: Node,
}

impl Tree {
    /// Construct a tree, verifying the uniqueness constraint.
    pub fn new(root: Node) -> Result<Self> {
        let tree = Self { root };
        let flat = tree.flatten();
        let unique: BTreeSet<&String> = flat.iter().collect();
        if unique.len() != flat.len() {
            let mut seen = BTreeSet::new();
            let dups: Vec<&str> = flat
                .iter()
                .filter(|v| !seen.insert(v.as_str()))
                .map(|v| v.as_str())
                .collect();
            bail!("tree nodes must be unique; duplicated: {}", dups.join(", "));
        }
        Ok(tree)
    }

    /// All node values in depth-first pre-order.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.flatten_into(&mut out);
        out
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.flatten().len()
    }

    /// Whether `key` names a node anywhere in the tree.
    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// The root node's value.
    pub fn root(&self) -> &str {
        &self.root.value
    }

    /// The nested node structure.
    pub fn node(&self) -> &Node {
        &self.root
    }

    /// Maximum root-to-leaf path length.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    fn find(&self, key: &str) -> Option<&Node> {
        fn descend<'a>(node: &'a Node, key: &str) -> Option<&'a Node> {
            if node.value == key {
                return Some(node);
            }
            node.children.iter().find_map(|c| descend(c, key))
        }
        descend(&self.root, key)
    }

    /// The complete subtree rooted at `key`.
    pub fn get(&self, key: &str) -> Result<&Node> {
        match self.find(key) {
            Some(node) => Ok(node),
            None => bail!("no such tree node '{key}'"),
        }
    }

    /// The subtree rooted at `key` as an independent tree.
    pub fn subtree(&self, key: &str) -> Result<Tree> {
        Ok(Tree {
            root: self.get(key)?.clone(),
        })
    }

    /// The value of `key`'s parent node; `None` for the root.
    pub fn parent(&self, key: &str) -> Result<Option<&str>> {
        fn descend<'a>(node: &'a Node, key: &str) -> Option<Option<&'a str>> {
            for child in &node.children {
                if child.value == key {
                    return Some(Some(&node.value));
                }
                if let Some(found) = descend(child, key) {
                    return Some(found);
                }
            }
            None
        }
        if self.root.value == key {
            return Ok(None);
        }
        match descend(&self.root, key) {
            Some(parent) => Ok(parent),
            None => bail!("no such tree node '{key}'"),
        }
    }

    /// The chain of values from the root down to `key`, inclusive.
    pub fn path_to(&self, key: &str) -> Result<Vec<String>> {
        fn descend(node: &Node, key: &str, path: &mut Vec<String>) -> bool {
            path.push(node.value.clone());
            if node.value == key {
                return true;
            }
            for child in &node.children {
                if descend(child, key, path) {
                    return true;
                }
            }
            path.pop();
            false
        }
        let mut path = Vec::new();
        if !descend(&self.root, key, &mut path) {
            bail!("no such tree node '{key}'");
        }
        Ok(path)
    }

    /// Replace the children of `key`, re-validating global uniqueness.
    pub fn set_children(&mut self, key: &str, children: Vec<Node>) -> Result<()> {
        fn descend<'a>(node: &'a mut Node, key: &str) -> Option<&'a mut Node> {
            if node.value == key {
                return Some(node);
            }
            node.children.iter_mut().find_map(|c| descend(c, key))
        }
        let mut candidate = self.root.clone();
        match descend(&mut candidate, key) {
            Some(node) => node.children = children,
            None => bail!("no such tree node '{key}'"),
        }
        // Validate on the copy so a failed edit leaves the tree intact.
        *self = Tree::new(candidate)?;
        Ok(())
    }

    /// Detach and return the subtree rooted at `key`.
    pub fn remove(&mut self, key: &str) -> Result<Node> {
        if self.root.value == key {
            bail!("cannot remove the tree root '{key}'");
        }
        fn detach(node: &mut Node, key: &str) -> Option<Node> {
            if let Some(idx) = node.children.iter().position(|c| c.value == key) {
                return Some(node.children.remove(idx));
            }
            node.children.iter_mut().find_map(|c| detach(c, key))
        }
        match detach(&mut self.root, key) {
            Some(node) => Ok(node),
            None => bail!("no such tree node '{key}'"),
        }
    }

    /// A forest of every complete subtree, in pre-order of their roots.
    pub fn subtrees(&self) -> Vec<Tree> {
        fn collect(node: &Node, out: &mut Vec<Tree>) {
            out.push(Tree { root: node.clone() });
            for child in &node.children {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }

    /// A forest rooted at the leaves: for each leaf, the chain of
    /// single-child nodes running leaf → parent → … → root.
    pub fn inverted(&self) -> Vec<Tree> {
        fn collect(node: &Node, ancestry: &[String], out: &mut Vec<Tree>) {
            let mut chain: Vec<String> = vec![node.value.clone()];
            chain.extend(ancestry.iter().rev().cloned());
            if node.children.is_empty() {
                let mut inverted = Node::leaf(chain.pop().expect("chain is non-empty"));
                while let Some(value) = chain.pop() {
                    inverted = Node::with_children(value, vec![inverted]);
                }
                out.push(Tree { root: inverted });
                return;
            }
            let mut next = ancestry.to_vec();
            next.push(node.value.clone());
            for child in &node.children {
                collect(child, &next, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &[], &mut out);
        out
    }

    /// The values of all leaf nodes, left to right.
    pub fn leaves(&self) -> Vec<String> {
        fn collect(node: &Node, out: &mut Vec<String>) {
            if node.children.is_empty() {
                out.push(node.value.clone());
                return;
            }
            for child in &node.children {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The worked example: `['a', ['b', ['c'], ['d']], ['e']]`.
    fn sample() -> Tree {
        Tree::new(Node::with_children(
            "a",
            vec![
                Node::with_children("b", vec![Node::leaf("c"), Node::leaf("d")]),
                Node::leaf("e"),
            ],
        ))
        .unwrap()
    }

    #[test]
    fn flatten_is_preorder() {
        assert_eq!(sample().flatten(), ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn duplicate_nodes_rejected() {
        let err = Tree::new(Node::with_children(
            "a",
            vec![Node::leaf("b"), Node::leaf("b")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("unique"), "unexpected error: {err}");
    }

    #[test]
    fn from_toml_literal() {
        let value: toml::Value = "t = [\"a\", [\"b\", [\"c\"], [\"d\"]], [\"e\"]]"
            .parse::<toml::Table>()
            .unwrap()
            .remove("t")
            .unwrap();
        let tree = Tree::new(Node::from_toml(&value).unwrap()).unwrap();
        assert_eq!(tree.flatten(), ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn from_toml_rejects_bare_string_child() {
        let value: toml::Value = "t = [\"a\", \"b\"]"
            .parse::<toml::Table>()
            .unwrap()
            .remove("t")
            .unwrap();
        assert!(Node::from_toml(&value).is_err());
    }

    #[test]
    fn depth_and_leaves() {
        let tree = sample();
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.leaves(), ["c", "d", "e"]);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn parent_lookup() {
        let tree = sample();
        assert_eq!(tree.parent("c").unwrap(), Some("b"));
        assert_eq!(tree.parent("e").unwrap(), Some("a"));
        assert_eq!(tree.parent("a").unwrap(), None);
        assert!(tree.parent("zzz").is_err());
    }

    #[test]
    fn path_to_walks_from_root() {
        let tree = sample();
        assert_eq!(tree.path_to("d").unwrap(), ["a", "b", "d"]);
        assert_eq!(tree.path_to("a").unwrap(), ["a"]);
    }

    #[test]
    fn missing_key_is_an_error() {
        let tree = sample();
        let err = tree.get("zzz").unwrap_err();
        assert!(err.to_string().contains("zzz"), "unexpected error: {err}");
    }

    #[test]
    fn set_children_replaces_and_revalidates() {
        let mut tree = sample();
        tree.set_children("e", vec![Node::leaf("f")]).unwrap();
        assert_eq!(tree.flatten(), ["a", "b", "c", "d", "e", "f"]);

        // Introducing a duplicate must fail and leave the tree unchanged.
        let err = tree.set_children("f", vec![Node::leaf("c")]).unwrap_err();
        assert!(err.to_string().contains("unique"), "unexpected error: {err}");
        assert_eq!(tree.flatten(), ["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn remove_detaches_subtree() {
        let mut tree = sample();
        let removed = tree.remove("b").unwrap();
        assert_eq!(removed.value, "b");
        assert_eq!(tree.flatten(), ["a", "e"]);
        assert!(tree.remove("a").is_err());
    }

    #[test]
    fn subtrees_forest() {
        let roots: Vec<String> = sample()
            .subtrees()
            .iter()
            .map(|t| t.root().to_string())
            .collect();
        assert_eq!(roots, ["a", "b", "c", "d", "e"]);
        let sub = sample().subtree("b").unwrap();
        assert_eq!(sub.flatten(), ["b", "c", "d"]);
    }

    #[test]
    fn inverted_yields_leaf_to_root_chains() {
        let chains: Vec<Vec<String>> = sample()
            .inverted()
            .iter()
            .map(|t| t.flatten())
            .collect();
        assert_eq!(
            chains,
            vec![
                vec!["c".to_string(), "b".to_string(), "a".to_string()],
                vec!["d".to_string(), "b".to_string(), "a".to_string()],
                vec!["e".to_string(), "a".to_string()],
            ]
        );
    }
}
