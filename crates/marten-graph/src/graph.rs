// Graph — generic named-node container with topological ordering
//
// Nodes are held behind Rc<RefCell<..>> handles because the node set is
// a reference graph, not an ownership tree: the engine, the sorted
// order, and callers all hold live handles to the same node. Edges are
// implied by name: each node reports the names of the nodes it
// consumes, and the container resolves them at sort time.
//
// The sorted order, once computed, is the single source of truth for
// execution: forward iteration is the forward pass order and reverse
// iteration is the backward pass order. There is no separately
// maintained backward list.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use marten_core::{Error, Result};

/// Shared handle to a node stored in a [`Graph`].
pub type NodeRef<N> = Rc<RefCell<N>>;

/// The minimal contract a node must satisfy to live in a [`Graph`].
pub trait GraphNode {
    /// Unique identity of the node.
    fn name(&self) -> &str;

    /// Rename the node (used when splicing subgraphs under a prefix).
    fn set_name(&mut self, name: String);

    /// Names of the nodes this node consumes, after connection
    /// realization. Unresolved names fail the topological sort.
    fn input_names(&self) -> Vec<String>;
}

/// Insertion-ordered collection of named nodes with a derived
/// topological ordering.
pub struct Graph<N: GraphNode> {
    nodes: Vec<NodeRef<N>>,
    sorted: Vec<NodeRef<N>>,
    index: HashMap<String, usize>,
}

impl<N: GraphNode> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: GraphNode> Graph<N> {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            sorted: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node in declaration order.
    pub fn add_node(&mut self, node: N) -> Result<NodeRef<N>> {
        let name = node.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        let node = Rc::new(RefCell::new(node));
        self.index.insert(name, self.nodes.len());
        self.nodes.push(Rc::clone(&node));
        // Any previously computed order is stale.
        self.sorted.clear();
        Ok(node)
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Result<NodeRef<N>> {
        self.index
            .get(name)
            .map(|&i| Rc::clone(&self.nodes[i]))
            .ok_or_else(|| Error::NotFound(format!("node '{}'", name)))
    }

    /// Look up a node by declaration index.
    pub fn node_at(&self, index: usize) -> Result<NodeRef<N>> {
        self.nodes
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node index {}", index)))
    }

    /// Look up a node by its position in the sorted order.
    pub fn sorted_node_at(&self, index: usize) -> Result<NodeRef<N>> {
        self.sorted
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sorted node index {}", index)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeRef<N>> {
        self.nodes.iter()
    }

    /// The sorted order; empty until [`Graph::topological_sort`] runs.
    pub fn sorted(&self) -> &[NodeRef<N>] {
        &self.sorted
    }

    /// Forward traversal over the sorted order.
    pub fn sorted_iter(&self) -> impl Iterator<Item = &NodeRef<N>> {
        self.sorted.iter()
    }

    /// Reverse traversal over the sorted order. This is the canonical
    /// backward-pass order.
    pub fn reverse_sorted_iter(&self) -> impl Iterator<Item = &NodeRef<N>> {
        self.sorted.iter().rev()
    }

    /// Compute a topological ordering of the nodes.
    ///
    /// Kahn's algorithm with the ready set keyed by declaration index,
    /// so ties among independent nodes break by declaration order and
    /// compilation stays deterministic. Fails with [`Error::Cycle`] if
    /// no linear extension exists, and with [`Error::InvalidParameter`]
    /// if a node references an input name that does not exist.
    pub fn topological_sort(&mut self) -> Result<()> {
        let n = self.nodes.len();
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for (i, node) in self.nodes.iter().enumerate() {
            for input in node.borrow().input_names() {
                let &src = self.index.get(&input).ok_or_else(|| Error::InvalidParameter {
                    node: node.borrow().name().to_string(),
                    reason: format!("input connection '{}' does not resolve to any node", input),
                })?;
                consumers[src].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(&i) = ready.iter().next() {
            ready.remove(&i);
            order.push(Rc::clone(&self.nodes[i]));
            for &c in &consumers[i] {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.insert(c);
                }
            }
        }

        if order.len() != n {
            let remaining: Vec<String> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, node)| node.borrow().name().to_string())
                .collect();
            return Err(Error::Cycle(remaining.join(", ")));
        }

        self.sorted = order;
        Ok(())
    }

    /// Whether a sorted order has been computed.
    pub fn is_sorted(&self) -> bool {
        !self.sorted.is_empty() || self.nodes.is_empty()
    }
}

impl<N: GraphNode + Clone> Graph<N> {
    /// Deep copy: cloned nodes share no mutable state with the source.
    ///
    /// The sorted order is recomputed on the copy when the source had
    /// one; the sort is deterministic so the orders agree.
    pub fn try_clone(&self) -> Result<Graph<N>> {
        let mut copy = Graph::new();
        for node in &self.nodes {
            copy.add_node(node.borrow().clone())?;
        }
        if !self.sorted.is_empty() {
            copy.topological_sort()?;
        }
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TestNode {
        name: String,
        inputs: Vec<String>,
    }

    impl TestNode {
        fn new(name: &str, inputs: &[&str]) -> Self {
            TestNode {
                name: name.to_string(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl GraphNode for TestNode {
        fn name(&self) -> &str {
            &self.name
        }
        fn set_name(&mut self, name: String) {
            self.name = name;
        }
        fn input_names(&self) -> Vec<String> {
            self.inputs.clone()
        }
    }

    fn sorted_names(g: &Graph<TestNode>) -> Vec<String> {
        g.sorted_iter()
            .map(|n| n.borrow().name().to_string())
            .collect()
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &[])).unwrap();
        match g.add_node(TestNode::new("a", &[])) {
            Err(Error::DuplicateName(name)) => assert_eq!(name, "a"),
            other => panic!("expected DuplicateName, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_lookup_missing() {
        let g: Graph<TestNode> = Graph::new();
        assert!(g.node("nope").is_err());
        assert!(g.node_at(0).is_err());
    }

    #[test]
    fn test_topological_sort_chain() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &[])).unwrap();
        g.add_node(TestNode::new("b", &["a"])).unwrap();
        g.add_node(TestNode::new("c", &["b"])).unwrap();
        g.topological_sort().unwrap();
        assert_eq!(sorted_names(&g), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_is_stable_for_independent_nodes() {
        // Declared out of dependency order: the sort must place "src"
        // first, then break the tie between x and y by declaration.
        let mut g = Graph::new();
        g.add_node(TestNode::new("y", &["src"])).unwrap();
        g.add_node(TestNode::new("x", &["src"])).unwrap();
        g.add_node(TestNode::new("src", &[])).unwrap();
        g.topological_sort().unwrap();
        assert_eq!(sorted_names(&g), vec!["src", "y", "x"]);
    }

    #[test]
    fn test_every_edge_respects_order() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &[])).unwrap();
        g.add_node(TestNode::new("b", &["a"])).unwrap();
        g.add_node(TestNode::new("c", &["a"])).unwrap();
        g.add_node(TestNode::new("d", &["b", "c"])).unwrap();
        g.topological_sort().unwrap();
        let names = sorted_names(&g);
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &["c"])).unwrap();
        g.add_node(TestNode::new("b", &["a"])).unwrap();
        g.add_node(TestNode::new("c", &["b"])).unwrap();
        match g.topological_sort() {
            Err(Error::Cycle(_)) => {}
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_input_named() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &["ghost"])).unwrap();
        match g.topological_sort() {
            Err(Error::InvalidParameter { node, .. }) => assert_eq!(node, "a"),
            other => panic!("expected InvalidParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_clone_is_independent() {
        let mut g = Graph::new();
        g.add_node(TestNode::new("a", &[])).unwrap();
        g.add_node(TestNode::new("b", &["a"])).unwrap();
        g.topological_sort().unwrap();

        let copy = g.try_clone().unwrap();
        assert_eq!(sorted_names(&copy), vec!["a", "b"]);
        copy.node("a").unwrap().borrow_mut().name = "renamed".into();
        assert_eq!(g.node("a").unwrap().borrow().name(), "a");
    }
}
