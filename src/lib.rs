//! # Run Coverage
//!
//! Segment-aware running coverage tracking and routing over road networks.
//!
//! This library provides:
//! - Construction of a routable running network from raw road data, with
//!   stable segment identities and orientation-consistent geometry
//! - Point-to-point routing between points snapped onto segments,
//!   stitching partial traversals at both ends of the route
//! - Durable accounting of runs and per-segment traversal counts, with
//!   date-ranged aggregate queries
//!
//! ## Quick Start
//!
//! ```rust
//! use run_coverage::{
//!     route_between, LatLng, Node, RouteGraph, RoutingConfig, Segment, SnappedPoint,
//! };
//!
//! // A one-segment network: a 50 m road between two junctions.
//! let graph = RouteGraph::from_parts(
//!     vec![
//!         Node { id: 1, position: LatLng::new(51.5074, -0.1278) },
//!         Node { id: 2, position: LatLng::new(51.5078, -0.1278) },
//!     ],
//!     vec![Segment {
//!         segment_id: "817_0".to_string(),
//!         start_node: 1,
//!         end_node: 2,
//!         length_metres: 50.0,
//!     }],
//! );
//!
//! let from = SnappedPoint {
//!     segment_id: "817_0".to_string(),
//!     start_node: 1,
//!     end_node: 2,
//!     distance_along_segment_metres: 10.0,
//! };
//! let to = SnappedPoint {
//!     segment_id: "817_0".to_string(),
//!     start_node: 1,
//!     end_node: 2,
//!     distance_along_segment_metres: 40.0,
//! };
//!
//! let route = route_between(&graph, &from, &to, &RoutingConfig::default());
//! assert_eq!(route.len(), 1);
//! assert!((route[0].length_metres() - 30.0).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CoverageError, Result};

// Geographic utilities (distance, polyline length, local projection)
pub mod geo_utils;

// Union-Find data structure for intersection clustering
pub mod union_find;
pub use union_find::UnionFind;

// Routable graph arena, ignore filter and shortest paths
pub mod graph;
pub use graph::{Node, NodeId, RouteGraph, Segment};

// Segment geometry features and WKT helpers
pub mod geometry;
pub use geometry::{GeometryCollection, SegmentFeature};

// Network builder: raw data -> routable graph + oriented geometry
pub mod network;
pub use network::{
    assign_segment_ids, build_running_network, orient_geometries, NetworkArtifacts,
    NetworkConfig, NetworkSource, RawEdge, RawNetwork, RawNode, SourceWayId,
};

// Point-to-point routing over snapped points
pub mod routing;
pub use routing::{
    route_between, FullSegmentTraversal, RouteStep, RoutingConfig, SegmentTraversal,
    SnappedPoint,
};

// Keyed LRU cache for per-area graph snapshots
pub mod cache;
pub use cache::LruCache;

// Traversal accounting store (SQLite)
pub mod store;
pub use store::{
    duration_to_minutes, parse_date, AreaKey, DateRange, DatedTraversals, FirstSeen, LoggedRun,
    RunArea, RunLinestring, RunningStore, SegmentTotal, StoreRunOutcome, StoredUser, SubRunArea,
    TraversalRow,
};

// Stateful engine (store + graph cache + background builds)
pub mod engine;
pub use engine::{init_engine, with_engine, CoverageEngine, NetworkBuildHandle, ENGINE};

// ============================================================================
// Core Types
// ============================================================================

/// A geographic coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use run_coverage::LatLng;
/// let point = LatLng::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that the coordinate is finite and within world bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}
