//! Point-to-point routing between snapped points.
//!
//! Both route endpoints arrive already snapped onto a segment: the
//! segment's id, its node pair and a distance along it. The router stitches
//! partial traversals of the two anchor segments onto a shortest path
//! through the graph, in three cases evaluated in priority order:
//!
//! 1. both points on the same segment -> one partial traversal
//! 2. the two segments share a node -> two partial traversals through it
//! 3. otherwise -> try all four endpoint pairings, keep the shortest
//!    total (partial ends + path), emit partial / full... / partial
//!
//! "No route" is a valid outcome and comes back as an empty sequence.

use serde::{Deserialize, Serialize};

use crate::graph::{NodeId, RouteGraph, Segment};

/// A point projected onto a segment of the road network.
///
/// `distance_along_segment_metres` is measured in the direction of the
/// segment's geometry and is clamped to `[0, length]` by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnappedPoint {
    pub segment_id: String,
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub distance_along_segment_metres: f64,
}

/// Partial traversal of a segment found during routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTraversal {
    pub segment_id: String,
    pub start_distance_metres: f64,
    pub end_distance_metres: f64,
    pub starts_at_end: bool,
    pub ends_at_end: bool,
}

/// A segment fully traversed between the route's anchor segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSegmentTraversal {
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub length_metres: f64,
}

/// One step of a computed route, serialized as a tagged record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteStep {
    Partial(SegmentTraversal),
    Full(FullSegmentTraversal),
}

impl RouteStep {
    /// Distance covered by this step in metres.
    pub fn length_metres(&self) -> f64 {
        match self {
            RouteStep::Partial(t) => (t.start_distance_metres - t.end_distance_metres).abs(),
            RouteStep::Full(t) => t.length_metres,
        }
    }
}

/// Router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// A snapped distance beyond this proportion of the segment's length
    /// counts as "at the end" for the traversal flags. Only the flags are
    /// affected, never the choice of route.
    pub at_end_proportion: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            at_end_proportion: 0.95,
        }
    }
}

impl RoutingConfig {
    fn at_end(&self, segment_length_metres: f64, distance_metres: f64) -> bool {
        distance_metres > segment_length_metres * self.at_end_proportion
    }
}

fn partial(
    segment_id: &str,
    start_distance_metres: f64,
    end_distance_metres: f64,
    starts_at_end: bool,
    ends_at_end: bool,
) -> SegmentTraversal {
    SegmentTraversal {
        segment_id: segment_id.to_string(),
        start_distance_metres,
        end_distance_metres,
        starts_at_end,
        ends_at_end,
    }
}

/// Resolve the anchor segment for a snapped point: by id first, falling
/// back to the node pair (snaps created against an older snapshot).
fn anchor_segment<'a>(graph: &'a RouteGraph, point: &SnappedPoint) -> Option<&'a Segment> {
    graph
        .segment_by_id(&point.segment_id)
        .or_else(|| graph.segment_between(point.start_node, point.end_node))
}

/// Compute the minimum-length route between two snapped points.
///
/// Returns an ordered sequence of traversal steps; an empty sequence means
/// the points are not connected on this graph (or an anchor segment is
/// missing from it), which callers treat as "no route", not as an error.
pub fn route_between(
    graph: &RouteGraph,
    from: &SnappedPoint,
    to: &SnappedPoint,
    config: &RoutingConfig,
) -> Vec<RouteStep> {
    // Case 1: both points snapped onto the same segment.
    if from.segment_id == to.segment_id {
        let Some(segment) = anchor_segment(graph, from) else {
            log::warn!(
                "[Router] anchor segment '{}' missing from graph",
                from.segment_id
            );
            return Vec::new();
        };
        let length = segment.length_metres;
        return vec![RouteStep::Partial(partial(
            &to.segment_id,
            from.distance_along_segment_metres,
            to.distance_along_segment_metres,
            config.at_end(length, from.distance_along_segment_metres),
            config.at_end(length, to.distance_along_segment_metres),
        ))];
    }

    let (Some(from_segment), Some(to_segment)) =
        (anchor_segment(graph, from), anchor_segment(graph, to))
    else {
        log::warn!(
            "[Router] anchor segment missing from graph ('{}' or '{}')",
            from.segment_id,
            to.segment_id
        );
        return Vec::new();
    };
    let from_length = from_segment.length_metres;
    let to_length = to_segment.length_metres;

    // Case 2: the segments share a node. The start segment's end node is
    // checked first so the choice is deterministic when both endpoints are
    // shared (parallel segments).
    let to_nodes = [to.start_node, to.end_node];
    let common_node = if to_nodes.contains(&from.end_node) {
        Some(from.end_node)
    } else if to_nodes.contains(&from.start_node) {
        Some(from.start_node)
    } else {
        None
    };

    if let Some(common) = common_node {
        let mut route = Vec::with_capacity(2);

        if common == from.end_node {
            route.push(RouteStep::Partial(partial(
                &from.segment_id,
                from.distance_along_segment_metres,
                from_length,
                false,
                true,
            )));
        } else {
            route.push(RouteStep::Partial(partial(
                &from.segment_id,
                from.distance_along_segment_metres,
                0.0,
                false,
                false,
            )));
        }

        if common == to.start_node {
            route.push(RouteStep::Partial(partial(
                &to.segment_id,
                0.0,
                to.distance_along_segment_metres,
                false,
                config.at_end(to_length, to.distance_along_segment_metres),
            )));
        } else {
            route.push(RouteStep::Partial(partial(
                &to.segment_id,
                to_length,
                to.distance_along_segment_metres,
                true,
                false,
            )));
        }

        return route;
    }

    // Case 3: no shared node. Try every pairing of the segments' endpoints
    // and keep the cheapest total; the pairing order is fixed, and a tie
    // keeps the first pairing found.
    let candidates = [
        (
            from.start_node,
            to.start_node,
            partial(&from.segment_id, from.distance_along_segment_metres, 0.0, false, false),
            partial(&to.segment_id, 0.0, to.distance_along_segment_metres, false, false),
        ),
        (
            from.start_node,
            to.end_node,
            partial(&from.segment_id, from.distance_along_segment_metres, 0.0, false, false),
            partial(&to.segment_id, to_length, to.distance_along_segment_metres, false, false),
        ),
        (
            from.end_node,
            to.start_node,
            partial(&from.segment_id, from.distance_along_segment_metres, from_length, false, true),
            partial(&to.segment_id, 0.0, to.distance_along_segment_metres, false, false),
        ),
        (
            from.end_node,
            to.end_node,
            partial(&from.segment_id, from.distance_along_segment_metres, from_length, false, true),
            partial(&to.segment_id, to_length, to.distance_along_segment_metres, false, false),
        ),
    ];

    let mut min_length_metres = f64::INFINITY;
    let mut best: Option<(Vec<NodeId>, SegmentTraversal, SegmentTraversal)> = None;

    for (source, target, start_step, end_step) in candidates {
        // A pairing with no connecting path is skipped, not an error.
        let Some((path_nodes, path_length)) = graph.shortest_path(source, target) else {
            continue;
        };

        let anchor_length = (start_step.start_distance_metres - start_step.end_distance_metres)
            .abs()
            + (end_step.start_distance_metres - end_step.end_distance_metres).abs();
        let total = anchor_length + path_length;

        if total < min_length_metres {
            min_length_metres = total;
            best = Some((path_nodes, start_step, end_step));
        }
    }

    let Some((path_nodes, start_step, end_step)) = best else {
        return Vec::new();
    };

    let mut route = Vec::with_capacity(path_nodes.len() + 1);
    route.push(RouteStep::Partial(start_step));
    for pair in path_nodes.windows(2) {
        let length = graph
            .min_segment_between(pair[0], pair[1])
            .map(|s| s.length_metres)
            .unwrap_or_default();
        route.push(RouteStep::Full(FullSegmentTraversal {
            start_node: pair[0],
            end_node: pair[1],
            length_metres: length,
        }));
    }
    route.push(RouteStep::Partial(end_step));
    route
}
