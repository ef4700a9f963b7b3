//! # Coverage engine
//!
//! Stateful facade tying the pieces together: the accounting store, a
//! keyed cache of routable graphs and the build/route entry points the
//! embedding application calls.
//!
//! ## Graph caching
//!
//! Graphs are expensive to load and deserialize, so the engine keeps an
//! LRU of snapshots keyed by `(username, area_name)`. Each area gets its
//! own entry: concurrent users never overwrite each other's snapshot.
//! Ignore-filtered views are derived from the cached snapshot after
//! lookup and are never cached themselves; the stored graph stays intact
//! for callers that want the full network.
//!
//! ## Area creation
//!
//! Fetching the raw road network is the one unbounded-latency step in the
//! system, so it runs on a background thread with its own database
//! connection. The area row is inserted synchronously (duplicate names
//! conflict immediately); the graph and geometry snapshots land when the
//! build finishes, and until then routing reports "no data".

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use once_cell::sync::Lazy;

use crate::cache::LruCache;
use crate::error::{CoverageError, Result};
use crate::geometry::polygon_wkt;
use crate::graph::RouteGraph;
use crate::network::{build_running_network, NetworkConfig, NetworkSource};
use crate::routing::{route_between, RouteStep, RoutingConfig, SnappedPoint};
use crate::store::{AreaKey, RunArea, RunningStore};
use crate::LatLng;

/// How many per-area graph snapshots to keep in memory.
const GRAPH_CACHE_CAPACITY: usize = 16;

/// Handle for a background network build.
pub struct NetworkBuildHandle {
    receiver: mpsc::Receiver<Result<()>>,
}

impl NetworkBuildHandle {
    /// Check if the build finished (non-blocking).
    pub fn try_recv(&self) -> Option<Result<()>> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the build to finish (blocking). `None` if the worker died
    /// without reporting.
    pub fn recv(self) -> Option<Result<()>> {
        self.receiver.recv().ok()
    }
}

/// The stateful coverage engine.
pub struct CoverageEngine {
    store: RunningStore,
    db_path: String,
    graph_cache: LruCache<AreaKey, RouteGraph>,
    network_config: NetworkConfig,
    routing_config: RoutingConfig,
}

impl CoverageEngine {
    /// Open an engine over the store at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        Self::with_configs(db_path, NetworkConfig::default(), RoutingConfig::default())
    }

    /// Open an engine with custom build/routing configuration.
    pub fn with_configs(
        db_path: &str,
        network_config: NetworkConfig,
        routing_config: RoutingConfig,
    ) -> Result<Self> {
        Ok(Self {
            store: RunningStore::open(db_path)?,
            db_path: db_path.to_string(),
            graph_cache: LruCache::new(GRAPH_CACHE_CAPACITY),
            network_config,
            routing_config,
        })
    }

    /// In-memory engine for testing. Background builds need a file-backed
    /// store (the worker opens its own connection); use
    /// [`build_run_area_now`](Self::build_run_area_now) here instead.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn store(&self) -> &RunningStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RunningStore {
        &mut self.store
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Load the routable graph for an area, from cache when possible.
    ///
    /// With `respect_ignored` the user's ignored segments are removed from
    /// a copy; the cached snapshot is never filtered in place.
    pub fn routing_graph(&mut self, key: &AreaKey, respect_ignored: bool) -> Result<RouteGraph> {
        let graph = match self.graph_cache.get(key) {
            Some(graph) => graph.clone(),
            None => {
                let loaded =
                    self.store
                        .load_graph(key)?
                        .ok_or_else(|| CoverageError::NotFound {
                            entity: "graph",
                            key: key.to_string(),
                        })?;
                self.graph_cache.insert(key.clone(), loaded.clone());
                loaded
            }
        };

        if !respect_ignored {
            return Ok(graph);
        }

        let ignored: HashSet<String> = self.store.ignored_segment_ids(key)?.into_iter().collect();
        Ok(graph.without_segments(&ignored))
    }

    /// Route between two snapped points on an area's network.
    ///
    /// An empty sequence means the points are not connected; callers treat
    /// that as "no route", not as an error.
    pub fn route(
        &mut self,
        key: &AreaKey,
        from: &SnappedPoint,
        to: &SnappedPoint,
        respect_ignored: bool,
    ) -> Result<Vec<RouteStep>> {
        let graph = self.routing_graph(key, respect_ignored)?;
        Ok(route_between(&graph, from, to, &self.routing_config))
    }

    /// Drop the cached snapshot for an area. Call after a rebuild or
    /// removal so the next request reloads from the store.
    pub fn invalidate_graph(&mut self, key: &AreaKey) {
        self.graph_cache.invalidate(key);
    }

    // ========================================================================
    // Area creation
    // ========================================================================

    /// Create a run area and build its network on a background thread.
    ///
    /// The area row is inserted before the thread starts, so duplicate
    /// names conflict synchronously. The worker fetches the raw network,
    /// builds the artifacts, persists them over its own connection, and
    /// makes the area active if the user had none. The returned handle
    /// reports the build outcome.
    pub fn create_run_area<S>(
        &mut self,
        username: &str,
        area_name: &str,
        boundary: Vec<LatLng>,
        source: S,
    ) -> Result<NetworkBuildHandle>
    where
        S: NetworkSource + Send + 'static,
    {
        let area = RunArea {
            username: username.to_string(),
            area_name: area_name.to_string(),
            polygon: polygon_wkt(&boundary),
            active: false,
        };
        self.store.insert_run_area(&area)?;

        let (tx, rx) = mpsc::channel();
        let db_path = self.db_path.clone();
        let network_config = self.network_config.clone();
        let key = area.key();

        thread::spawn(move || {
            log::info!("[CoverageEngine] building network for area {}", key);
            let outcome = fetch_build_and_store(&db_path, &network_config, &key, &boundary, &source);
            match &outcome {
                Ok(()) => log::info!("[CoverageEngine] network ready for area {}", key),
                Err(err) => {
                    log::error!("[CoverageEngine] build failed for area {}: {}", key, err)
                }
            }
            tx.send(outcome).ok();
        });

        Ok(NetworkBuildHandle { receiver: rx })
    }

    /// Create a run area and build its network synchronously. Same
    /// semantics as [`create_run_area`](Self::create_run_area) without the
    /// worker thread; used by tests and embedded callers.
    pub fn build_run_area_now(
        &mut self,
        username: &str,
        area_name: &str,
        boundary: &[LatLng],
        source: &dyn NetworkSource,
    ) -> Result<()> {
        let area = RunArea {
            username: username.to_string(),
            area_name: area_name.to_string(),
            polygon: polygon_wkt(boundary),
            active: false,
        };
        self.store.insert_run_area(&area)?;

        let key = area.key();
        let raw = source.fetch(boundary)?;
        let artifacts = build_running_network(raw, &self.network_config);
        self.store.save_network_artifacts(&key, &artifacts)?;

        if self.store.active_area_for(username)?.is_none() {
            self.store.set_active_area(username, area_name)?;
        }
        self.graph_cache.invalidate(&key);
        Ok(())
    }
}

/// Worker-side build: separate connection, fetch, build, persist.
fn fetch_build_and_store(
    db_path: &str,
    network_config: &NetworkConfig,
    key: &AreaKey,
    boundary: &[LatLng],
    source: &dyn NetworkSource,
) -> Result<()> {
    let store = RunningStore::open(db_path)?;
    let raw = source.fetch(boundary)?;
    let artifacts = build_running_network(raw, network_config);
    store.save_network_artifacts(key, &artifacts)?;

    // Only switch the active area for a user's first area.
    if store.active_area_for(&key.username)?.is_none() {
        store.set_active_area(&key.username, &key.area_name)?;
    }
    Ok(())
}

// ============================================================================
// Singleton
// ============================================================================

/// Process-wide engine, initialised once with [`init_engine`].
pub static ENGINE: Lazy<Mutex<Option<CoverageEngine>>> = Lazy::new(|| Mutex::new(None));

/// Initialise the global engine over the store at `db_path`. Replaces any
/// previously initialised engine.
pub fn init_engine(db_path: &str) -> Result<()> {
    let engine = CoverageEngine::new(db_path)?;
    let mut guard = ENGINE.lock().map_err(|_| CoverageError::Internal {
        message: "engine mutex poisoned".to_string(),
    })?;
    *guard = Some(engine);
    Ok(())
}

/// Run a closure against the global engine.
pub fn with_engine<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&mut CoverageEngine) -> Result<R>,
{
    let mut guard = ENGINE.lock().map_err(|_| CoverageError::Internal {
        message: "engine mutex poisoned".to_string(),
    })?;
    let engine = guard.as_mut().ok_or_else(|| CoverageError::Internal {
        message: "engine not initialised; call init_engine first".to_string(),
    })?;
    f(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{RawEdge, RawNetwork, RawNode, SourceWayId};

    /// Source returning a fixed two-segment network, independent of the
    /// requested boundary.
    struct StubSource {
        way_offset: i64,
    }

    impl NetworkSource for StubSource {
        fn fetch(&self, _boundary: &[LatLng]) -> Result<RawNetwork> {
            let nodes = vec![
                RawNode {
                    id: 1,
                    position: LatLng::new(53.0000, -1.0000),
                },
                RawNode {
                    id: 2,
                    position: LatLng::new(53.0010, -1.0000),
                },
                RawNode {
                    id: 3,
                    position: LatLng::new(53.0020, -1.0000),
                },
            ];
            let edge = |start: usize, end: usize, way: i64| RawEdge {
                start_node: nodes[start].id,
                end_node: nodes[end].id,
                source_id: SourceWayId::Single(way),
                length_metres: 111.0,
                road_class: "residential".to_string(),
                ref_tag: None,
                coordinates: vec![nodes[start].position, nodes[end].position],
            };
            Ok(RawNetwork {
                edges: vec![
                    edge(0, 1, self.way_offset),
                    edge(1, 2, self.way_offset + 1),
                ],
                nodes,
            })
        }
    }

    /// Source with no road network at all (degenerate boundary).
    struct EmptySource;

    impl NetworkSource for EmptySource {
        fn fetch(&self, _boundary: &[LatLng]) -> Result<RawNetwork> {
            Ok(RawNetwork::default())
        }
    }

    fn boundary() -> Vec<LatLng> {
        vec![
            LatLng::new(52.99, -1.01),
            LatLng::new(52.99, -0.99),
            LatLng::new(53.01, -0.99),
            LatLng::new(53.01, -1.01),
        ]
    }

    fn snapped(id: &str, start: i64, end: i64, distance: f64) -> SnappedPoint {
        SnappedPoint {
            segment_id: id.to_string(),
            start_node: start,
            end_node: end,
            distance_along_segment_metres: distance,
        }
    }

    #[test]
    fn test_build_and_route_end_to_end() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        engine
            .build_run_area_now("ada", "york", &boundary(), &StubSource { way_offset: 100 })
            .unwrap();

        let key = AreaKey::new("ada", "york");
        // First area becomes active.
        assert_eq!(
            engine.store().active_area_for("ada").unwrap().unwrap().area_name,
            "york"
        );

        let route = engine
            .route(
                &key,
                &snapped("100_0", 1, 2, 100.0),
                &snapped("101_0", 2, 3, 50.0),
                false,
            )
            .unwrap();
        // Adjacent segments through node 2.
        assert_eq!(route.len(), 2);
    }

    #[test]
    fn test_duplicate_area_conflicts_synchronously() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        engine
            .build_run_area_now("ada", "york", &boundary(), &StubSource { way_offset: 100 })
            .unwrap();

        let err = engine
            .build_run_area_now("ada", "york", &boundary(), &StubSource { way_offset: 100 })
            .unwrap_err();
        assert!(matches!(err, CoverageError::RunAreaExists { .. }));
    }

    #[test]
    fn test_missing_graph_is_not_found() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        // Area exists but no artifacts yet (as during a pending build).
        engine
            .store()
            .insert_run_area(&RunArea {
                username: "ada".to_string(),
                area_name: "york".to_string(),
                polygon: polygon_wkt(&boundary()),
                active: false,
            })
            .unwrap();

        let err = engine
            .routing_graph(&AreaKey::new("ada", "york"), false)
            .unwrap_err();
        assert!(matches!(err, CoverageError::NotFound { .. }));
    }

    #[test]
    fn test_empty_network_is_data_not_an_error() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        engine
            .build_run_area_now("ada", "flat", &boundary(), &EmptySource)
            .unwrap();

        let graph = engine
            .routing_graph(&AreaKey::new("ada", "flat"), false)
            .unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_graph_cache_is_keyed_per_area() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        engine
            .build_run_area_now("ada", "york", &boundary(), &StubSource { way_offset: 100 })
            .unwrap();
        engine
            .build_run_area_now("grace", "hull", &boundary(), &StubSource { way_offset: 500 })
            .unwrap();

        let ada = AreaKey::new("ada", "york");
        let grace = AreaKey::new("grace", "hull");

        // Interleaved loads: each user keeps seeing their own network.
        let g1 = engine.routing_graph(&ada, false).unwrap();
        let g2 = engine.routing_graph(&grace, false).unwrap();
        let g1_again = engine.routing_graph(&ada, false).unwrap();

        assert!(g1.segment_by_id("100_0").is_some());
        assert!(g2.segment_by_id("500_0").is_some());
        assert!(g2.segment_by_id("100_0").is_none());
        assert!(g1_again.segment_by_id("100_0").is_some());
    }

    #[test]
    fn test_ignored_filter_applies_to_copy_not_cache() {
        let mut engine = CoverageEngine::in_memory().unwrap();
        engine
            .build_run_area_now("ada", "york", &boundary(), &StubSource { way_offset: 100 })
            .unwrap();
        let key = AreaKey::new("ada", "york");

        engine
            .store_mut()
            .update_ignored_segments(&key, &["100_0".to_string()])
            .unwrap();

        let filtered = engine.routing_graph(&key, true).unwrap();
        assert!(filtered.segment_by_id("100_0").is_none());
        assert_eq!(filtered.segment_count(), 1);

        // The unfiltered (cached) graph is untouched.
        let full = engine.routing_graph(&key, false).unwrap();
        assert!(full.segment_by_id("100_0").is_some());
        assert_eq!(full.segment_count(), 2);
    }

    #[test]
    fn test_background_build_lands_artifacts() {
        let db_path = std::env::temp_dir().join(format!(
            "run_coverage_engine_test_{}.db",
            std::process::id()
        ));
        let db_path = db_path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&db_path);

        {
            let mut engine = CoverageEngine::new(&db_path).unwrap();
            let handle = engine
                .create_run_area("ada", "york", boundary(), StubSource { way_offset: 100 })
                .unwrap();

            handle.recv().unwrap().unwrap();

            let key = AreaKey::new("ada", "york");
            let graph = engine.routing_graph(&key, false).unwrap();
            assert_eq!(graph.segment_count(), 2);
            assert_eq!(
                engine.store().active_area_for("ada").unwrap().unwrap().area_name,
                "york"
            );
        }

        let _ = std::fs::remove_file(&db_path);
    }
}
