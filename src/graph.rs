//! Directed acyclic graph over prerequisite names.
//!
//! Adjacency-list representation with an explicit designated head node,
//! cycle rejection at construction time, and a Kahn-style topological sort
//! producing a leaves-first ordering.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use anyhow::{Result, bail};

use crate::tree::Node;

/// A DAG mapping each node to the list of nodes it depends on.
///
/// Neighbors that never appear as keys are treated as external leaves: they
/// never block the sort and are not emitted by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dag {
    graph: BTreeMap<String, Vec<String>>,
    head: String,
}

/// DFS visit state for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl Dag {
    /// Construct from an adjacency map and a designated head node.
    ///
    /// Rejects any input containing a cycle, found by a full
    /// white/gray/black depth-first check rather than any shortcut over the
    /// literal input shape.
    pub fn from_adjacency(
        graph: BTreeMap<String, Vec<String>>,
        head: impl Into<String>,
    ) -> Result<Self> {
        let head = head.into();
        if !graph.contains_key(&head) {
            bail!("head node '{head}' is not in the adjacency map");
        }
        if let Some(cycle) = find_cycle(&graph) {
            bail!(
                "dependency graph contains a cycle through node(s): {}",
                cycle.join(" -> ")
            );
        }
        Ok(Self { graph, head })
    }

    /// Construct from the nested-literal form (a node followed by its
    /// dependency subtrees, mirroring the tree literal).
    ///
    /// A node may recur verbatim any number of times — that is a diamond
    /// dependency and is merged. A node redeclared with a conflicting set
    /// of direct dependents indicates a cycle folded into the literal, and
    /// construction fails naming the offending node(s).
    pub fn from_nested(root: &Node) -> Result<Self> {
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut conflicts: Vec<String> = Vec::new();
        build_adjacency(root, &mut graph, &mut conflicts);
        if !conflicts.is_empty() {
            conflicts.sort();
            conflicts.dedup();
            bail!(
                "acyclic graph redeclares node(s) with conflicting dependents: {}",
                conflicts.join(", ")
            );
        }
        Self::from_adjacency(graph, root.value.clone())
    }

    /// The adjacency map.
    pub fn adjacency_list(&self) -> &BTreeMap<String, Vec<String>> {
        &self.graph
    }

    /// The designated head (root) node.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Whether `key` is a node of the graph.
    pub fn contains(&self, key: &str) -> bool {
        self.graph.contains_key(key)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the graph has no nodes. Never true for a constructed DAG,
    /// which always contains at least its head.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Order all nodes so that every node appears after all of its
    /// dependencies: leaves first, the head last.
    ///
    /// Kahn's algorithm. Construction guarantees acyclicity, but a
    /// no-progress iteration still fails fast instead of spinning, in case
    /// a malformed graph ever bypasses the constructor.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (node, deps) in &self.graph {
            let degree = deps
                .iter()
                .filter(|d| self.graph.contains_key(d.as_str()))
                .count();
            in_degree.insert(node.as_str(), degree);
            for dep in deps {
                if self.graph.contains_key(dep.as_str()) {
                    dependents.entry(dep.as_str()).or_default().push(node.as_str());
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut sorted: Vec<String> = Vec::new();
        while let Some(node) = queue.pop_front() {
            sorted.push(node.to_string());
            if let Some(deps) = dependents.get(node) {
                for dependent in deps.clone() {
                    let degree = in_degree
                        .get_mut(dependent)
                        .expect("dependent was registered with an in-degree");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() != self.graph.len() {
            bail!(
                "dependency cycle detected: {} of {} nodes cannot be ordered",
                self.graph.len() - sorted.len(),
                self.graph.len()
            );
        }
        Ok(sorted)
    }

    /// Reconstruct the nested-literal form by walking outward from the
    /// head (the inverse of [`Dag::from_nested`]).
    pub fn nested(&self) -> Node {
        fn nest(key: &str, graph: &BTreeMap<String, Vec<String>>) -> Node {
            let children = graph
                .get(key)
                .map(|deps| deps.iter().map(|d| nest(d, graph)).collect())
                .unwrap_or_default();
            Node {
                value: key.to_string(),
                children,
            }
        }
        nest(&self.head, &self.graph)
    }
}

impl fmt::Display for Dag {
    /// ASCII-art rendering of the nested form, one node per line with
    /// `+--` connectors.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn draw(node: &Node, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if depth == 0 {
                write!(f, "{}", node.value)?;
            } else {
                write!(f, "\n{}+--{}", "|  ".repeat(depth - 1), node.value)?;
            }
            for child in &node.children {
                draw(child, depth + 1, f)?;
            }
            Ok(())
        }
        draw(&self.nested(), 0, f)
    }
}

/// Flatten the nested form into an adjacency map, recording nodes that are
/// redeclared with differing direct-dependent sets.
fn build_adjacency(
    node: &Node,
    graph: &mut BTreeMap<String, Vec<String>>,
    conflicts: &mut Vec<String>,
) {
    let deps: Vec<String> = node.children.iter().map(|c| c.value.clone()).collect();
    match graph.get(&node.value) {
        Some(existing) if *existing != deps => conflicts.push(node.value.clone()),
        Some(_) => {}
        None => {
            graph.insert(node.value.clone(), deps);
        }
    }
    for child in &node.children {
        build_adjacency(child, graph, conflicts);
    }
}

/// Standard color-marking DFS cycle check. Returns the nodes on the first
/// back edge's path, or `None` when the graph is acyclic.
fn find_cycle(graph: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = graph.keys().map(|k| (k.as_str(), Mark::White)).collect();

    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<String>,
    ) -> bool {
        marks.insert(node, Mark::Gray);
        path.push(node.to_string());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                match marks.get(dep.as_str()) {
                    Some(Mark::Gray) => {
                        path.push(dep.clone());
                        return true;
                    }
                    Some(Mark::White) => {
                        if visit(dep, graph, marks, path) {
                            return true;
                        }
                    }
                    // Black nodes are fully explored; absent nodes are
                    // external leaves.
                    _ => {}
                }
            }
        }
        marks.insert(node, Mark::Black);
        path.pop();
        false
    }

    let keys: Vec<&str> = graph.keys().map(String::as_str).collect();
    for key in keys {
        if marks.get(key) == Some(&Mark::White) {
            let mut path = Vec::new();
            if visit(key, graph, &mut marks, &mut path) {
                // Trim the path to the cycle proper.
                let last = path.last().cloned().unwrap_or_default();
                if let Some(start) = path.iter().position(|n| *n == last) {
                    return Some(path[start..].to_vec());
                }
                return Some(path);
            }
        }
    }
    None
}
