//! Routable graph over road segments.
//!
//! The graph is an arena of [`Segment`]s plus a node table, with an
//! adjacency index from node id to segment indices. Segments are
//! undirected: routing may enter from either endpoint. Multiple segments
//! between the same node pair are allowed (junction merging produces them)
//! and stay distinct by `segment_id`.
//!
//! Snapshots serialize as a plain node/edge list so they can be stored as
//! JSON on the owning run area and reloaded without loss.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::LatLng;

/// Identifier of a road-network node. OSM node ids fit in i64 and survive
/// the build pipeline unchanged, so they are used directly.
pub type NodeId = i64;

/// A junction (or dead end) in the road network. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub position: LatLng,
}

/// A routable edge with a stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Stable identifier, unique within one graph. Empty until the
    /// orientation pass stamps it during a network build.
    pub segment_id: String,
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub length_metres: f64,
}

impl Segment {
    /// Whether `node` is one of this segment's endpoints.
    pub fn touches(&self, node: NodeId) -> bool {
        self.start_node == node || self.end_node == node
    }

    /// The endpoint opposite `node`, if `node` is an endpoint.
    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if node == self.start_node {
            Some(self.end_node)
        } else if node == self.end_node {
            Some(self.start_node)
        } else {
            None
        }
    }
}

/// Serialized shape of a graph: node list + segment list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphData {
    nodes: Vec<Node>,
    segments: Vec<Segment>,
}

/// Undirected routable graph for one run area.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "GraphData", into = "GraphData")]
pub struct RouteGraph {
    nodes: HashMap<NodeId, Node>,
    segments: Vec<Segment>,
    /// node id -> indices into `segments` of the edges touching it.
    adjacency: HashMap<NodeId, Vec<usize>>,
}

impl Default for RouteGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            segments: Vec::new(),
            adjacency: HashMap::new(),
        }
    }

    /// Build a graph from node and segment lists, indexing adjacency.
    pub fn from_parts(nodes: Vec<Node>, segments: Vec<Segment>) -> Self {
        let mut graph = Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            segments: Vec::with_capacity(segments.len()),
            adjacency: HashMap::new(),
        };
        for segment in segments {
            graph.add_segment(segment);
        }
        graph
    }

    /// Insert a node, replacing any previous node with the same id.
    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Append a segment to the arena and index it under both endpoints.
    pub fn add_segment(&mut self, segment: Segment) {
        let index = self.segments.len();
        self.adjacency
            .entry(segment.start_node)
            .or_default()
            .push(index);
        if segment.end_node != segment.start_node {
            self.adjacency
                .entry(segment.end_node)
                .or_default()
                .push(index);
        }
        self.segments.push(segment);
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Find a segment by its stable id.
    pub fn segment_by_id(&self, segment_id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    /// First segment connecting `a` and `b` in either orientation.
    pub fn segment_between(&self, a: NodeId, b: NodeId) -> Option<&Segment> {
        let indices = self.adjacency.get(&a)?;
        indices
            .iter()
            .map(|&i| &self.segments[i])
            .find(|s| s.other_end(a) == Some(b))
    }

    /// Shortest segment connecting `a` and `b`, for parallel-edge pairs.
    /// This matches the edge the length-weighted router would traverse.
    pub fn min_segment_between(&self, a: NodeId, b: NodeId) -> Option<&Segment> {
        let indices = self.adjacency.get(&a)?;
        indices
            .iter()
            .map(|&i| &self.segments[i])
            .filter(|s| s.other_end(a) == Some(b))
            .min_by(|x, y| x.length_metres.total_cmp(&y.length_metres))
    }

    /// Stamp `segment_id` onto the first not-yet-stamped segment between
    /// the node pair. Returns false when no such segment exists (tolerated:
    /// the edge may have been filtered out upstream).
    pub fn stamp_segment_id(&mut self, start: NodeId, end: NodeId, segment_id: &str) -> bool {
        let index = match self.adjacency.get(&start) {
            Some(indices) => indices
                .iter()
                .copied()
                .find(|&i| self.segments[i].touches(end) && self.segments[i].segment_id.is_empty()),
            None => None,
        };
        match index {
            Some(i) => {
                self.segments[i].segment_id = segment_id.to_string();
                true
            }
            None => false,
        }
    }

    /// Keep only segments matching the predicate, rebuilding adjacency.
    /// Nodes are kept even when they lose all segments; routing simply
    /// never reaches them.
    pub fn retain_segments<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Segment) -> bool,
    {
        let segments = std::mem::take(&mut self.segments);
        self.adjacency.clear();
        for segment in segments {
            if keep(&segment) {
                self.add_segment(segment);
            }
        }
    }

    /// A copy of this graph with the given segment ids removed.
    ///
    /// The receiver is untouched: ignore-aware routing works on the
    /// returned view while other callers keep seeing the full graph.
    pub fn without_segments(&self, ignored: &HashSet<String>) -> RouteGraph {
        let mut filtered = self.clone();
        filtered.retain_segments(|s| !ignored.contains(&s.segment_id));
        filtered
    }

    /// Length-weighted shortest path between two nodes.
    ///
    /// Returns the node sequence (inclusive of both endpoints) and the
    /// total length in metres, or `None` when `to` is unreachable.
    pub fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<(Vec<NodeId>, f64)> {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return None;
        }
        if from == to {
            return Some((vec![from], 0.0));
        }

        let mut dist: HashMap<NodeId, f64> = HashMap::new();
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        // Min-heap via Reverse; secondary key NodeId keeps expansion order
        // deterministic when costs tie.
        let mut heap: BinaryHeap<Reverse<(Cost, NodeId)>> = BinaryHeap::new();

        dist.insert(from, 0.0);
        heap.push(Reverse((Cost(0.0), from)));

        while let Some(Reverse((Cost(cost), node))) = heap.pop() {
            if node == to {
                return Some((self.reconstruct_path(&prev, from, to), cost));
            }
            // Skip stale heap entries.
            if dist.get(&node).is_some_and(|&d| cost > d) {
                continue;
            }

            for &index in self.adjacency.get(&node).into_iter().flatten() {
                let segment = &self.segments[index];
                let Some(neighbor) = segment.other_end(node) else {
                    continue;
                };
                let new_cost = cost + segment.length_metres;
                if dist.get(&neighbor).map_or(true, |&d| new_cost < d) {
                    dist.insert(neighbor, new_cost);
                    prev.insert(neighbor, node);
                    heap.push(Reverse((Cost(new_cost), neighbor)));
                }
            }
        }

        None
    }

    fn reconstruct_path(
        &self,
        prev: &HashMap<NodeId, NodeId>,
        from: NodeId,
        to: NodeId,
    ) -> Vec<NodeId> {
        let mut path = vec![to];
        let mut current = to;
        while current != from {
            match prev.get(&current) {
                Some(&p) => {
                    path.push(p);
                    current = p;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }
}

impl From<GraphData> for RouteGraph {
    fn from(data: GraphData) -> Self {
        RouteGraph::from_parts(data.nodes, data.segments)
    }
}

impl From<RouteGraph> for GraphData {
    fn from(graph: RouteGraph) -> Self {
        let mut nodes: Vec<Node> = graph.nodes.into_values().collect();
        nodes.sort_by_key(|n| n.id);
        GraphData {
            nodes,
            segments: graph.segments,
        }
    }
}

/// f64 cost with a total order, for the Dijkstra heap. Lengths are finite
/// and non-negative by the network builder's contract.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, lat: f64, lng: f64) -> Node {
        Node {
            id,
            position: LatLng::new(lat, lng),
        }
    }

    fn segment(id: &str, start: NodeId, end: NodeId, length: f64) -> Segment {
        Segment {
            segment_id: id.to_string(),
            start_node: start,
            end_node: end,
            length_metres: length,
        }
    }

    /// Square N1-N2-N3-N4-N1, every side 10 m.
    fn square_graph() -> RouteGraph {
        RouteGraph::from_parts(
            vec![
                node(1, 0.0, 0.0),
                node(2, 0.0, 1.0),
                node(3, 1.0, 1.0),
                node(4, 1.0, 0.0),
            ],
            vec![
                segment("a_0", 1, 2, 10.0),
                segment("b_0", 2, 3, 10.0),
                segment("c_0", 3, 4, 10.0),
                segment("d_0", 4, 1, 10.0),
            ],
        )
    }

    #[test]
    fn test_segment_lookup_either_orientation() {
        let graph = square_graph();
        assert_eq!(graph.segment_between(1, 2).unwrap().segment_id, "a_0");
        assert_eq!(graph.segment_between(2, 1).unwrap().segment_id, "a_0");
        assert!(graph.segment_between(1, 3).is_none());
    }

    #[test]
    fn test_parallel_edges_stay_distinct() {
        let mut graph = square_graph();
        graph.add_segment(segment("a_1", 1, 2, 25.0));

        assert_eq!(graph.segment_count(), 5);
        assert_eq!(graph.min_segment_between(1, 2).unwrap().segment_id, "a_0");
        assert_eq!(graph.segment_by_id("a_1").unwrap().length_metres, 25.0);
    }

    #[test]
    fn test_shortest_path_picks_short_side() {
        let mut graph = square_graph();
        // Make one side expensive so 1 -> 3 has a unique best path.
        graph.retain_segments(|s| s.segment_id != "b_0");
        graph.add_segment(segment("b_0", 2, 3, 50.0));

        let (path, length) = graph.shortest_path(1, 3).unwrap();
        assert_eq!(path, vec![1, 4, 3]);
        assert!((length - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_shortest_path_unreachable_is_none() {
        let mut graph = square_graph();
        graph.add_node(node(99, 5.0, 5.0));
        assert!(graph.shortest_path(1, 99).is_none());
        assert!(graph.shortest_path(1, 12345).is_none());
    }

    #[test]
    fn test_shortest_path_same_node_is_trivial() {
        let graph = square_graph();
        let (path, length) = graph.shortest_path(2, 2).unwrap();
        assert_eq!(path, vec![2]);
        assert_eq!(length, 0.0);
    }

    #[test]
    fn test_without_segments_does_not_mutate_source() {
        let graph = square_graph();
        let ignored: HashSet<String> = ["a_0".to_string()].into_iter().collect();

        let filtered = graph.without_segments(&ignored);

        assert!(filtered.segment_by_id("a_0").is_none());
        assert_eq!(filtered.segment_count(), 3);
        // Source still intact.
        assert!(graph.segment_by_id("a_0").is_some());
        assert_eq!(graph.segment_count(), 4);
        // Routing on the filtered view goes the long way round.
        let (path, _) = filtered.shortest_path(1, 2).unwrap();
        assert_eq!(path, vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_stamp_segment_id_fills_first_unstamped() {
        let mut graph = RouteGraph::from_parts(
            vec![node(1, 0.0, 0.0), node(2, 0.0, 1.0)],
            vec![segment("", 1, 2, 10.0), segment("", 1, 2, 12.0)],
        );

        assert!(graph.stamp_segment_id(1, 2, "w_0"));
        assert!(graph.stamp_segment_id(1, 2, "w_1"));
        assert!(!graph.stamp_segment_id(1, 2, "w_2"));

        assert_eq!(graph.segments()[0].segment_id, "w_0");
        assert_eq!(graph.segments()[1].segment_id, "w_1");
    }

    #[test]
    fn test_serde_round_trip_preserves_routing() {
        let graph = square_graph();
        let json = serde_json::to_string(&graph).unwrap();
        let reloaded: RouteGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(reloaded.node_count(), 4);
        assert_eq!(reloaded.segment_count(), 4);
        let (path, length) = reloaded.shortest_path(1, 3).unwrap();
        assert_eq!(path.len(), 3);
        assert!((length - 20.0).abs() < 1e-9);
    }
}
