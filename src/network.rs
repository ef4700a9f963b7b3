//! Running-network construction.
//!
//! Turns a raw road network (as returned by a map-data provider for a
//! user-drawn polygon) into the pair of artifacts the rest of the crate
//! routes and renders with: a [`RouteGraph`] whose every edge carries a
//! stable `segment_id`, and a [`GeometryCollection`] of oriented features,
//! 1:1 with the routable edges.
//!
//! The pipeline, in order:
//!
//! 1. collapse direction-paired edges into one undirected edge
//! 2. consolidate intersections within a metre tolerance (projected
//!    locally to metric coordinates, topology rebuilt, reprojected back)
//! 3. assign stable segment identities
//! 4. drop excluded road classes and ref-marked roads (e.g. motorways)
//! 5. build and orient the geometry collection
//!
//! An empty or degenerate input produces empty artifacts, never an error:
//! callers treat "no network" as "nothing to run on".

use std::collections::{HashMap, HashSet};

use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo_utils::{polyline_length, LocalProjection};
use crate::geometry::{GeometryCollection, SegmentFeature};
use crate::graph::{Node, NodeId, RouteGraph, Segment};
use crate::union_find::UnionFind;
use crate::LatLng;

// ============================================================================
// Raw network types
// ============================================================================

/// Identifier an edge carries from the map data source.
///
/// Providers merge continuous ways when no junction separates them, so an
/// edge can arrive with a list of way ids rather than a single one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceWayId {
    Single(i64),
    Merged(Vec<i64>),
}

impl SourceWayId {
    /// Normalize to a single string: scalar ids pass through, merged ids
    /// join with an underscore. Many edges can share a normalized id (one
    /// way split at junctions), which is why identity assignment appends
    /// an occurrence counter on top.
    pub fn normalized(&self) -> String {
        match self {
            SourceWayId::Single(id) => id.to_string(),
            SourceWayId::Merged(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("_"),
        }
    }
}

/// A node as delivered by the map data provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub id: NodeId,
    pub position: LatLng,
}

/// An edge as delivered by the map data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEdge {
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub source_id: SourceWayId,
    pub length_metres: f64,
    /// Road classification tag (e.g. "residential", "motorway").
    pub road_class: String,
    /// Road reference (e.g. "A61", "M1"), when tagged.
    pub ref_tag: Option<String>,
    /// Line geometry of the road piece. Endpoints coincide with the node
    /// positions, though not necessarily in start -> end order.
    pub coordinates: Vec<LatLng>,
}

/// Raw road network for a polygon, straight from the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawNetwork {
    pub nodes: Vec<RawNode>,
    pub edges: Vec<RawEdge>,
}

impl RawNetwork {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() || self.edges.is_empty()
    }
}

/// Map data provider boundary: given a polygon, return the raw road
/// network inside it. Implementations may be slow; they are only invoked
/// from the asynchronous area-creation path.
pub trait NetworkSource {
    fn fetch(&self, boundary: &[LatLng]) -> Result<RawNetwork>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Knobs for the network build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Collapse direction-paired edges into one undirected edge. Routing
    /// still works both ways; rendering avoids duplicate segments.
    pub undirected: bool,
    /// Merge intersections closer than this many metres. `None` skips
    /// consolidation entirely.
    pub merge_tolerance_metres: Option<f64>,
    /// Road classes to remove outright (exact tag match).
    pub excluded_road_classes: HashSet<String>,
    /// Drop edges whose ref tag contains any of these markers. "M" removes
    /// UK motorways the way the source data tags them.
    pub excluded_ref_markers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            undirected: true,
            merge_tolerance_metres: None,
            excluded_road_classes: HashSet::new(),
            excluded_ref_markers: vec!["M".to_string()],
        }
    }
}

/// Output of a network build: the routable graph and its geometry, stored
/// together and replaced together on rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkArtifacts {
    pub graph: RouteGraph,
    pub geometry: GeometryCollection,
}

impl NetworkArtifacts {
    pub fn empty() -> Self {
        Self {
            graph: RouteGraph::new(),
            geometry: GeometryCollection::default(),
        }
    }
}

// ============================================================================
// Segment identity assignment
// ============================================================================

/// Assign a unique, stable segment id to each edge.
///
/// Ids are the normalized source id plus a zero-based occurrence counter
/// (`<source>_<n>`), counters scoped per normalized id and advanced in
/// encounter order. The result is a pure function of input order: feeding
/// the same edges in the same order reproduces identical ids, which is
/// what lets a stored graph be rebuilt without invalidating run history.
pub fn assign_segment_ids(source_ids: &[SourceWayId]) -> Vec<String> {
    let mut counters: HashMap<String, u32> = HashMap::new();
    source_ids
        .iter()
        .map(|source_id| {
            let base = source_id.normalized();
            let counter = counters.entry(base.clone()).or_insert(0);
            let segment_id = format!("{}_{}", base, counter);
            *counter += 1;
            segment_id
        })
        .collect()
}

// ============================================================================
// Geometry orientation
// ============================================================================

/// Make every feature's coordinates run from its start node to its end
/// node, and stamp segment ids back onto the graph.
///
/// For each feature, the graph edge keyed by the feature's node pair (the
/// first such edge still missing an id) gets the feature's `segment_id`;
/// this repairs identity loss from upstream processing, and a missing edge
/// is tolerated. Orientation is decided by the first coordinate: equal to
/// the start node's position means keep, equal to the end node's position
/// means reverse, anything else means the feature is dropped.
pub fn orient_geometries(
    graph: &mut RouteGraph,
    features: Vec<SegmentFeature>,
) -> GeometryCollection {
    let mut oriented = Vec::with_capacity(features.len());

    for mut feature in features {
        if let Some(segment_id) = &feature.segment_id {
            graph.stamp_segment_id(feature.start_node, feature.end_node, segment_id);
        }

        let (Some(start), Some(end)) = (graph.node(feature.start_node), graph.node(feature.end_node))
        else {
            log::debug!(
                "[NetworkBuilder] dropping feature {:?}: unknown node pair ({}, {})",
                feature.segment_id,
                feature.start_node,
                feature.end_node
            );
            continue;
        };

        let Some(&first) = feature.coordinates.first() else {
            log::debug!(
                "[NetworkBuilder] dropping feature {:?}: no coordinates",
                feature.segment_id
            );
            continue;
        };

        if first == start.position {
            oriented.push(feature);
        } else if first == end.position {
            feature.coordinates.reverse();
            oriented.push(feature);
        } else {
            log::debug!(
                "[NetworkBuilder] dropping feature {:?}: geometry matches neither endpoint",
                feature.segment_id
            );
        }
    }

    GeometryCollection::new(oriented)
}

// ============================================================================
// Build pipeline
// ============================================================================

/// Build routable artifacts from a raw network.
///
/// Empty input yields empty artifacts: callers must treat that as "no
/// network available", not as a fault.
pub fn build_running_network(raw: RawNetwork, config: &NetworkConfig) -> NetworkArtifacts {
    if raw.is_empty() {
        log::warn!("[NetworkBuilder] raw network is empty, producing empty artifacts");
        return NetworkArtifacts::empty();
    }

    log::info!(
        "[NetworkBuilder] building network from {} nodes / {} edges",
        raw.nodes.len(),
        raw.edges.len()
    );

    let raw = if config.undirected {
        collapse_paired_edges(raw)
    } else {
        raw
    };

    let raw = match config.merge_tolerance_metres {
        Some(tolerance) => consolidate_intersections(raw, tolerance),
        None => raw,
    };

    // Identity assignment happens over the full edge table so ids stay
    // stable regardless of which edges the filters remove afterwards.
    let source_ids: Vec<SourceWayId> = raw.edges.iter().map(|e| e.source_id.clone()).collect();
    let segment_ids = assign_segment_ids(&source_ids);

    let kept: Vec<(String, &RawEdge)> = segment_ids
        .into_iter()
        .zip(raw.edges.iter())
        .filter(|(_, edge)| !config.excluded_road_classes.contains(&edge.road_class))
        .filter(|(_, edge)| !ref_matches_marker(edge.ref_tag.as_deref(), &config.excluded_ref_markers))
        .collect();

    let mut graph = RouteGraph::new();
    for node in &raw.nodes {
        graph.add_node(Node {
            id: node.id,
            position: node.position,
        });
    }
    for (_, edge) in &kept {
        graph.add_segment(Segment {
            segment_id: String::new(),
            start_node: edge.start_node,
            end_node: edge.end_node,
            length_metres: edge.length_metres,
        });
    }

    let features: Vec<SegmentFeature> = kept
        .into_iter()
        .map(|(segment_id, edge)| SegmentFeature {
            segment_id: Some(segment_id),
            start_node: edge.start_node,
            end_node: edge.end_node,
            coordinates: edge.coordinates.clone(),
        })
        .collect();

    let geometry = orient_geometries(&mut graph, features);

    // Keep graph and geometry 1:1: edges whose feature was dropped (or that
    // never got stamped) are not routable.
    let surviving: HashSet<String> = geometry
        .features
        .iter()
        .filter_map(|f| f.segment_id.clone())
        .collect();
    graph.retain_segments(|s| surviving.contains(&s.segment_id));

    log::info!(
        "[NetworkBuilder] built graph with {} nodes / {} segments ({} features)",
        graph.node_count(),
        graph.segment_count(),
        geometry.len()
    );

    NetworkArtifacts { graph, geometry }
}

fn ref_matches_marker(ref_tag: Option<&str>, markers: &[String]) -> bool {
    match ref_tag {
        Some(value) => markers.iter().any(|marker| value.contains(marker.as_str())),
        None => false,
    }
}

/// Keep one edge per unordered node pair and source way.
///
/// Providers emit one edge per travel direction; for running we only need
/// one (the graph is undirected), and rendering two identical geometries
/// on top of each other doubles every segment visually.
fn collapse_paired_edges(raw: RawNetwork) -> RawNetwork {
    let mut seen: HashSet<(NodeId, NodeId, String)> = HashSet::new();
    let edges = raw
        .edges
        .into_iter()
        .filter(|edge| {
            let (a, b) = if edge.start_node <= edge.end_node {
                (edge.start_node, edge.end_node)
            } else {
                (edge.end_node, edge.start_node)
            };
            seen.insert((a, b, edge.source_id.normalized()))
        })
        .collect();

    RawNetwork {
        nodes: raw.nodes,
        edges,
    }
}

// ============================================================================
// Intersection consolidation
// ============================================================================

/// R-tree entry: a node projected to local metric coordinates.
struct ProjectedNode {
    point: [f64; 2],
    id: NodeId,
}

impl RTreeObject for ProjectedNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for ProjectedNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Merge intersections closer than `tolerance_metres`, rebuilding topology.
///
/// Nodes are projected to a local metric plane, clustered with an R-tree
/// radius query plus union-find, and each cluster becomes one node at the
/// cluster centroid (reprojected back to geographic coordinates; the
/// smallest member id is kept as the representative so re-processing is
/// stable). Edges are reconnected to the merged nodes: endpoints remapped,
/// endpoint coordinates rewritten, lengths recomputed, and edges that
/// collapse entirely inside a cluster dropped.
fn consolidate_intersections(raw: RawNetwork, tolerance_metres: f64) -> RawNetwork {
    let positions: Vec<LatLng> = raw.nodes.iter().map(|n| n.position).collect();
    let Some(projection) = LocalProjection::for_points(&positions) else {
        return raw;
    };

    let index = RTree::bulk_load(
        raw.nodes
            .iter()
            .map(|node| ProjectedNode {
                point: projection.to_metric(&node.position),
                id: node.id,
            })
            .collect(),
    );

    let mut clusters: UnionFind<NodeId> = UnionFind::with_capacity(raw.nodes.len());
    for entry in index.iter() {
        clusters.make_set(entry.id);
        for neighbour in index.locate_within_distance(entry.point, tolerance_metres * tolerance_metres)
        {
            clusters.union(&entry.id, &neighbour.id);
        }
    }

    // Each cluster becomes one node: smallest member id, centroid position.
    let old_positions: HashMap<NodeId, LatLng> =
        raw.nodes.iter().map(|n| (n.id, n.position)).collect();
    let mut node_map: HashMap<NodeId, NodeId> = HashMap::new();
    let mut merged_nodes: Vec<RawNode> = Vec::new();

    for (_, members) in clusters.groups() {
        let representative = *members.iter().min().expect("cluster is non-empty");
        let position = if members.len() == 1 {
            old_positions[&representative]
        } else {
            let centroid = members
                .iter()
                .map(|id| projection.to_metric(&old_positions[id]))
                .fold([0.0, 0.0], |acc, xy| [acc[0] + xy[0], acc[1] + xy[1]]);
            let n = members.len() as f64;
            projection.to_geographic([centroid[0] / n, centroid[1] / n])
        };
        for member in &members {
            node_map.insert(*member, representative);
        }
        merged_nodes.push(RawNode {
            id: representative,
            position,
        });
    }
    merged_nodes.sort_by_key(|n| n.id);

    let new_positions: HashMap<NodeId, LatLng> =
        merged_nodes.iter().map(|n| (n.id, n.position)).collect();

    let before = raw.edges.len();
    let edges: Vec<RawEdge> = raw
        .edges
        .into_iter()
        .filter_map(|mut edge| {
            let start = node_map[&edge.start_node];
            let end = node_map[&edge.end_node];
            if start == end {
                // Edge swallowed by the merged junction.
                return None;
            }

            reconnect_endpoint_coordinates(&mut edge, &old_positions, &new_positions, start, end);
            edge.start_node = start;
            edge.end_node = end;
            edge.length_metres = polyline_length(&edge.coordinates);
            Some(edge)
        })
        .collect();

    log::info!(
        "[NetworkBuilder] consolidated {} nodes into {} ({} edges -> {})",
        old_positions.len(),
        merged_nodes.len(),
        before,
        edges.len()
    );

    RawNetwork {
        nodes: merged_nodes,
        edges,
    }
}

/// Rewrite the terminal coordinates of an edge's geometry to the merged
/// node positions, preserving whichever orientation the geometry had.
fn reconnect_endpoint_coordinates(
    edge: &mut RawEdge,
    old_positions: &HashMap<NodeId, LatLng>,
    new_positions: &HashMap<NodeId, LatLng>,
    start: NodeId,
    end: NodeId,
) {
    let old_start = old_positions[&edge.start_node];
    let old_end = old_positions[&edge.end_node];
    let new_start = new_positions[&start];
    let new_end = new_positions[&end];

    if let Some(first) = edge.coordinates.first_mut() {
        if *first == old_start {
            *first = new_start;
        } else if *first == old_end {
            *first = new_end;
        }
    }
    if let Some(last) = edge.coordinates.last_mut() {
        if *last == old_end {
            *last = new_end;
        } else if *last == old_start {
            *last = new_start;
        }
    }
}
