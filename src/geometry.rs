//! Segment geometry features and WKT helpers.
//!
//! A [`SegmentFeature`] is the renderable counterpart of a graph segment:
//! the ordered coordinates of the road piece plus the node pair it spans.
//! Features are typed records rather than property bags so the orientation
//! pass in the network builder can rely on the fields existing.

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;
use crate::LatLng;

/// Line geometry for one segment, keyed by the node pair it connects.
///
/// `segment_id` is optional because features are created before identity
/// assignment reaches the graph; the orientation pass stamps ids onto graph
/// edges from here. After a network build completes every surviving feature
/// has `Some(segment_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFeature {
    pub segment_id: Option<String>,
    pub start_node: NodeId,
    pub end_node: NodeId,
    pub coordinates: Vec<LatLng>,
}

/// All segment features for one run area, 1:1 with routable edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometryCollection {
    pub features: Vec<SegmentFeature>,
}

impl GeometryCollection {
    pub fn new(features: Vec<SegmentFeature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Find the feature for a segment id.
    pub fn feature(&self, segment_id: &str) -> Option<&SegmentFeature> {
        self.features
            .iter()
            .find(|f| f.segment_id.as_deref() == Some(segment_id))
    }
}

// ============================================================================
// WKT formatting
// ============================================================================

// Area boundaries and uploaded run tracks are persisted as WKT text with
// (lat lng) coordinate order, matching what the map layer sends back.

/// Format a boundary ring as a WKT polygon, closing the ring if needed.
pub fn polygon_wkt(points: &[LatLng]) -> String {
    let mut ring: Vec<&LatLng> = points.iter().collect();
    if let (Some(first), Some(last)) = (points.first(), points.last()) {
        if first != last {
            ring.push(first);
        }
    }
    let coords = ring
        .iter()
        .map(|p| format!("{} {}", p.latitude, p.longitude))
        .collect::<Vec<_>>()
        .join(", ");
    format!("POLYGON(({}))", coords)
}

/// Format a GPS track as a WKT linestring.
pub fn linestring_wkt(points: &[LatLng]) -> String {
    let coords = points
        .iter()
        .map(|p| format!("{} {}", p.latitude, p.longitude))
        .collect::<Vec<_>>()
        .join(", ");
    format!("LINESTRING({})", coords)
}

/// Cheap shape check for a WKT linestring: correct delimiters and one space
/// per coordinate pair plus one after each comma.
pub fn is_linestring_wkt(value: &str) -> bool {
    let correct_start = value.starts_with("LINESTRING(");
    let correct_end = value.ends_with(')');
    let num_commas = value.chars().filter(|c| *c == ',').count();
    let num_spaces = value.chars().filter(|c| *c == ' ').count();
    correct_start && correct_end && 2 * num_commas + 1 == num_spaces
}
