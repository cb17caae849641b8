//! Directed capacity graph of known peer adjacency.
//!
//! Edges are added lazily as peers announce themselves and are never
//! removed; a capacity of `None` means unbounded.  Path lookup is a BFS
//! shortest path that only crosses edges with nonzero or unspecified
//! capacity.  Neighbor order is insertion order, so for a fixed sequence of
//! `add_edge` calls the chosen path among equal-length candidates is
//! deterministic.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// One of the endpoints was never added to the graph.
    NodeNotFound(String),
    /// Both endpoints exist but no usable edges connect them.
    NoPath { source: String, dest: String },
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::NodeNotFound(key) => write!(f, "node {key} not found"),
            PathError::NoPath { source, dest } => {
                write!(f, "no path between {source} and {dest}")
            }
        }
    }
}

impl std::error::Error for PathError {}

/// In-memory adjacency of one relay's view of the mesh.
#[derive(Debug, Default)]
pub struct FlowNetwork {
    /// from-key → ordered list of (to-key, capacity).
    edges: HashMap<String, Vec<(String, Option<u64>)>>,
    /// Every key ever seen as an endpoint, including pure sinks.
    nodes: HashMap<String, ()>,
}

impl FlowNetwork {
    pub fn new() -> Self {
        FlowNetwork::default()
    }

    /// Upsert a directed edge.  Re-adding an existing (from, to) pair
    /// replaces its capacity rather than creating a parallel edge.
    pub fn add_edge(&mut self, from: &str, to: &str, capacity: Option<u64>) {
        self.nodes.insert(from.to_string(), ());
        self.nodes.insert(to.to_string(), ());
        let neighbors = self.edges.entry(from.to_string()).or_default();
        if let Some(entry) = neighbors.iter_mut().find(|(key, _)| key == to) {
            entry.1 = capacity;
        } else {
            neighbors.push((to.to_string(), capacity));
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn capacity(&self, from: &str, to: &str) -> Option<Option<u64>> {
        self.edges
            .get(from)?
            .iter()
            .find(|(key, _)| key == to)
            .map(|(_, cap)| *cap)
    }

    /// Shortest usable path from `source` to `dest` and the bottleneck
    /// capacity along it (`None` when every edge is unbounded).
    ///
    /// An edge is usable when its capacity is nonzero or unspecified.  A
    /// source equal to the destination yields the single-element path.
    pub fn get_path(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<(Vec<String>, Option<u64>), PathError> {
        if !self.contains(source) {
            return Err(PathError::NodeNotFound(source.to_string()));
        }
        if !self.contains(dest) {
            return Err(PathError::NodeNotFound(dest.to_string()));
        }
        if source == dest {
            return Ok((vec![source.to_string()], None));
        }

        let mut predecessor: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(source);
        predecessor.insert(source, source);

        while let Some(current) = queue.pop_front() {
            if current == dest {
                break;
            }
            let Some(neighbors) = self.edges.get(current) else {
                continue;
            };
            for (next, capacity) in neighbors {
                if capacity == &Some(0) {
                    continue;
                }
                if !predecessor.contains_key(next.as_str()) {
                    predecessor.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        if !predecessor.contains_key(dest) {
            return Err(PathError::NoPath {
                source: source.to_string(),
                dest: dest.to_string(),
            });
        }

        let mut path = vec![dest.to_string()];
        let mut cursor = dest;
        while cursor != source {
            cursor = predecessor[cursor];
            path.push(cursor.to_string());
        }
        path.reverse();

        let mut bottleneck: Option<u64> = None;
        for pair in path.windows(2) {
            if let Some(Some(cap)) = self.capacity(&pair[0], &pair[1]) {
                bottleneck = Some(bottleneck.map_or(cap, |b| b.min(cap)));
            }
        }

        Ok((path, bottleneck))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_endpoints_are_source_and_dest() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", Some(5));
        net.add_edge("b", "c", Some(3));

        let (path, capacity) = net.get_path("a", "c").unwrap();
        assert_eq!(path, vec!["a", "b", "c"]);
        assert_eq!(capacity, Some(3));
    }

    #[test]
    fn unknown_node_is_not_found() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);

        let err = net.get_path("a", "ghost").unwrap_err();
        assert_eq!(err, PathError::NodeNotFound("ghost".to_string()));
        let err = net.get_path("ghost", "a").unwrap_err();
        assert_eq!(err, PathError::NodeNotFound("ghost".to_string()));
    }

    #[test]
    fn disconnected_nodes_have_no_path() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);
        net.add_edge("c", "d", None);

        let err = net.get_path("a", "d").unwrap_err();
        assert!(matches!(err, PathError::NoPath { .. }));
    }

    #[test]
    fn edges_are_directed() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);

        net.get_path("a", "b").unwrap();
        assert!(matches!(
            net.get_path("b", "a"),
            Err(PathError::NoPath { .. })
        ));
    }

    #[test]
    fn add_edge_is_idempotent_and_updates_capacity() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", Some(5));
        net.add_edge("a", "b", Some(9));

        assert_eq!(net.edge_count(), 1);
        assert_eq!(net.capacity("a", "b"), Some(Some(9)));
    }

    #[test]
    fn zero_capacity_edges_are_unusable() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", Some(0));

        let err = net.get_path("a", "b").unwrap_err();
        assert!(matches!(err, PathError::NoPath { .. }));
    }

    #[test]
    fn unbounded_edges_yield_no_bottleneck() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);
        net.add_edge("b", "c", None);

        let (path, capacity) = net.get_path("a", "c").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(capacity, None);
    }

    #[test]
    fn source_equal_to_dest_is_single_element() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);

        let (path, _) = net.get_path("a", "a").unwrap();
        assert_eq!(path, vec!["a"]);
    }

    #[test]
    fn prefers_shorter_path() {
        let mut net = FlowNetwork::new();
        net.add_edge("a", "b", None);
        net.add_edge("b", "c", None);
        net.add_edge("c", "d", None);
        net.add_edge("a", "d", Some(1));

        let (path, capacity) = net.get_path("a", "d").unwrap();
        assert_eq!(path, vec!["a", "d"]);
        assert_eq!(capacity, Some(1));
    }
}
