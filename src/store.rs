//! # Traversal accounting store
//!
//! Durable record of users, run areas, logged runs and per-segment
//! traversal counts, backed by SQLite.
//!
//! ## Layout
//!
//! - `users` - registered usernames with their password hash
//! - `run_areas` - one row per `(username, area_name)`, holding the WKT
//!   boundary, the active flag and the graph/geometry JSON snapshots
//! - `sub_run_areas` - named polygon subsets of an area (display only)
//! - `logged_runs` / `segment_traversals` - a run plus its normalized
//!   per-segment counts, inserted together atomically
//! - `ignored_segments` - segment ids excluded from stats/routing views
//!
//! Run dates are stored as ISO-8601 text, so SQLite's lexicographic
//! `BETWEEN` matches chronological order. Aggregate queries take an
//! optional inclusive [`DateRange`] with either bound omissible.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{CoverageError, Result};
use crate::geometry::GeometryCollection;
use crate::graph::RouteGraph;
use crate::network::NetworkArtifacts;

// ============================================================================
// Models
// ============================================================================

/// Scope key for everything area-owned: ignored segments, runs, snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AreaKey {
    pub username: String,
    pub area_name: String,
}

impl AreaKey {
    pub fn new(username: &str, area_name: &str) -> Self {
        Self {
            username: username.to_string(),
            area_name: area_name.to_string(),
        }
    }
}

impl std::fmt::Display for AreaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.username, self.area_name)
    }
}

/// A registered user. Password hashing happens upstream; the store only
/// keeps the hash it was handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    pub username: String,
    pub hashed_password: String,
}

/// Area selected by a user in which to track run coverage.
///
/// At most one area is active per username at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArea {
    pub username: String,
    pub area_name: String,
    /// Boundary polygon in WKT, (lat lng) coordinate order.
    pub polygon: String,
    pub active: bool,
}

impl RunArea {
    pub fn key(&self) -> AreaKey {
        AreaKey::new(&self.username, &self.area_name)
    }
}

/// Named polygon subset of a run area, used only for display partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRunArea {
    pub username: String,
    pub area_name: String,
    pub sub_area_name: String,
    pub polygon: Option<String>,
}

/// A run to log towards coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedRun {
    pub date: NaiveDate,
    pub distance_miles: f64,
    /// Duration in `HH:MM:SS.cc` format; unparsable values store as NULL.
    pub duration: Option<String>,
    pub comments: Option<String>,
    /// WKT linestring of the run, usually from GPS tracking.
    pub linestring: Option<String>,
    /// Allow logging more than one run on the same date.
    pub allow_multiple: bool,
    /// segment id -> number of traversals in this run.
    pub segment_traversals: HashMap<String, u32>,
}

/// Outcome of storing a run. A duplicate date without `allow_multiple` is
/// an ordinary outcome for the caller to relay, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreRunOutcome {
    Stored { run_id: i64 },
    DuplicateDate { date: NaiveDate },
}

/// One traversal record row: a segment covered on a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalRow {
    pub date: NaiveDate,
    pub segment_id: String,
    pub traversals: u32,
}

/// Total traversal count for one segment over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTotal {
    pub segment_id: String,
    pub total_traversals: i64,
}

/// Earliest date in range on which a segment was covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstSeen {
    pub date: NaiveDate,
    pub segment_id: String,
}

/// Stored run geometry for rendering past runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLinestring {
    pub date: NaiveDate,
    pub linestring: String,
}

/// All traversals logged on one date, with the gap to the next run date
/// (0 for the last). Shaped for coverage playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedTraversals {
    pub date: NaiveDate,
    pub diff_days: i64,
    pub traversals: Vec<TraversalRow>,
}

/// Inclusive date range; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: NaiveDate) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// WHERE clause + its parameters. The degenerate `1 = 1` form keeps
    /// the caller's `AND` concatenation uniform.
    fn clause(&self) -> (&'static str, Vec<String>) {
        match (self.start, self.end) {
            (None, None) => ("WHERE 1 = 1", vec![]),
            (Some(start), None) => ("WHERE date >= ?", vec![start.to_string()]),
            (None, Some(end)) => ("WHERE date <= ?", vec![end.to_string()]),
            (Some(start), Some(end)) => (
                "WHERE date BETWEEN ? AND ?",
                vec![start.to_string(), end.to_string()],
            ),
        }
    }
}

/// Parse a user-supplied `YYYY-MM-DD` date string.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| CoverageError::MalformedDate {
        value: value.to_string(),
    })
}

/// Convert an `HH:MM:SS.cc` duration into minutes.
///
/// Returns `None` for anything that doesn't match the shape; absent or
/// malformed durations store as NULL rather than failing the run insert.
pub fn duration_to_minutes(duration: &str) -> Option<f64> {
    let hours: f64 = duration.get(0..2)?.parse().ok()?;
    let minutes: f64 = duration.get(3..5)?.parse().ok()?;
    let seconds: f64 = duration.get(6..8)?.parse().ok()?;
    let centis: f64 = duration.get(9..)?.parse().ok()?;
    Some(hours * 60.0 + minutes + seconds / 60.0 + centis / 6000.0)
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed store for run areas and traversal accounting.
pub struct RunningStore {
    conn: Connection,
}

impl RunningStore {
    /// Open (creating if needed) a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                hashed_password TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_areas (
                username TEXT NOT NULL,
                area_name TEXT NOT NULL,
                polygon TEXT NOT NULL,
                graph TEXT NULL,
                geometry TEXT NULL,
                active INTEGER NOT NULL,
                PRIMARY KEY (username, area_name)
            );

            CREATE TABLE IF NOT EXISTS sub_run_areas (
                username TEXT NOT NULL,
                area_name TEXT NOT NULL,
                sub_area_name TEXT NOT NULL,
                polygon TEXT NOT NULL,
                PRIMARY KEY (username, area_name, sub_area_name)
            );

            CREATE TABLE IF NOT EXISTS logged_runs (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                area_name TEXT NOT NULL,
                date TEXT NOT NULL,
                distance_miles REAL NOT NULL,
                duration_minutes REAL NULL,
                comments TEXT NULL,
                linestring TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS segment_traversals (
                run_id INTEGER NOT NULL,
                segment_id TEXT NOT NULL,
                traversals INTEGER NOT NULL,
                FOREIGN KEY (run_id) REFERENCES logged_runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS ignored_segments (
                username TEXT NOT NULL,
                area_name TEXT NOT NULL,
                segment_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logged_runs_area
                ON logged_runs(username, area_name, date);
            CREATE INDEX IF NOT EXISTS idx_traversals_run
                ON segment_traversals(run_id);
            CREATE INDEX IF NOT EXISTS idx_ignored_area
                ON ignored_segments(username, area_name);

            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Fetch a registered user.
    pub fn get_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let user = self
            .conn
            .query_row(
                "SELECT username, hashed_password FROM users WHERE username = ?",
                params![username],
                |row| {
                    Ok(StoredUser {
                        username: row.get(0)?,
                        hashed_password: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Register a user; a taken username is a typed conflict.
    pub fn insert_user(&self, username: &str, hashed_password: &str) -> Result<()> {
        if self.get_user(username)?.is_some() {
            return Err(CoverageError::UsernameExists {
                username: username.to_string(),
            });
        }
        self.conn.execute(
            "INSERT INTO users (username, hashed_password) VALUES (?, ?)",
            params![username, hashed_password],
        )?;
        Ok(())
    }

    // ========================================================================
    // Run areas
    // ========================================================================

    /// Insert a run area; a duplicate name for the user is a typed conflict.
    pub fn insert_run_area(&self, area: &RunArea) -> Result<()> {
        let existing = self.areas_for_user(&area.username, false)?;
        if existing.iter().any(|a| a.area_name == area.area_name) {
            return Err(CoverageError::RunAreaExists {
                username: area.username.clone(),
                area_name: area.area_name.clone(),
            });
        }
        self.conn.execute(
            "INSERT INTO run_areas (username, area_name, polygon, active)
             VALUES (?, ?, ?, ?)",
            params![area.username, area.area_name, area.polygon, area.active as i64],
        )?;
        Ok(())
    }

    /// Areas created by this user, ordered by name. With `artifacts_exist`
    /// only areas whose graph and geometry snapshots are both present.
    pub fn areas_for_user(&self, username: &str, artifacts_exist: bool) -> Result<Vec<RunArea>> {
        let artifacts_clause = if artifacts_exist {
            "AND graph IS NOT NULL AND geometry IS NOT NULL"
        } else {
            ""
        };
        let query = format!(
            "SELECT username, area_name, polygon, active
             FROM run_areas
             WHERE username = ? {}
             ORDER BY area_name",
            artifacts_clause
        );

        let mut stmt = self.conn.prepare(&query)?;
        let areas = stmt
            .query_map(params![username], |row| {
                Ok(RunArea {
                    username: row.get(0)?,
                    area_name: row.get(1)?,
                    polygon: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(areas)
    }

    /// Make `area_name` the user's single active area. One UPDATE flips
    /// every row, so a reader never sees two active areas.
    pub fn set_active_area(&self, username: &str, area_name: &str) -> Result<Option<RunArea>> {
        self.conn.execute(
            "UPDATE run_areas
             SET active = CASE WHEN area_name = ? THEN 1 ELSE 0 END
             WHERE username = ?",
            params![area_name, username],
        )?;
        self.active_area_for(username)
    }

    /// The user's single active area, if any.
    pub fn active_area_for(&self, username: &str) -> Result<Option<RunArea>> {
        let area = self
            .conn
            .query_row(
                "SELECT username, area_name, polygon, active
                 FROM run_areas
                 WHERE username = ? AND active = 1",
                params![username],
                |row| {
                    Ok(RunArea {
                        username: row.get(0)?,
                        area_name: row.get(1)?,
                        polygon: row.get(2)?,
                        active: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(area)
    }

    /// Remove an area and everything it owns (runs, traversal records,
    /// sub areas, ignored segments, snapshots) in one transaction. If the
    /// removed area was active and the user has others, one of them is
    /// promoted.
    pub fn remove_run_area(&mut self, key: &AreaKey) -> Result<()> {
        let was_active: bool = self
            .conn
            .query_row(
                "SELECT active FROM run_areas WHERE username = ? AND area_name = ?",
                params![key.username, key.area_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v != 0)
            .unwrap_or(false);

        let replacement: Option<String> = self
            .conn
            .query_row(
                "SELECT area_name FROM run_areas
                 WHERE username = ? AND area_name != ?
                 ORDER BY area_name LIMIT 1",
                params![key.username, key.area_name],
                |row| row.get(0),
            )
            .optional()?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM segment_traversals
             WHERE run_id IN (
                 SELECT id FROM logged_runs WHERE username = ? AND area_name = ?
             )",
            params![key.username, key.area_name],
        )?;
        for table in ["logged_runs", "sub_run_areas", "ignored_segments", "run_areas"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE username = ? AND area_name = ?", table),
                params![key.username, key.area_name],
            )?;
        }
        tx.commit()?;

        if was_active {
            if let Some(name) = replacement {
                self.set_active_area(&key.username, &name)?;
            }
        }
        log::info!("[RunningStore] removed run area {}", key);
        Ok(())
    }

    // ========================================================================
    // Network snapshots
    // ========================================================================

    /// Replace the area's graph and geometry snapshots together. Always a
    /// full replacement, never a patch.
    pub fn save_network_artifacts(&self, key: &AreaKey, artifacts: &NetworkArtifacts) -> Result<()> {
        let graph_json = serde_json::to_string(&artifacts.graph)?;
        let geometry_json = serde_json::to_string(&artifacts.geometry)?;
        let updated = self.conn.execute(
            "UPDATE run_areas SET graph = ?, geometry = ?
             WHERE username = ? AND area_name = ?",
            params![graph_json, geometry_json, key.username, key.area_name],
        )?;
        if updated == 0 {
            return Err(CoverageError::NotFound {
                entity: "run area",
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Load the area's routable graph; `None` when the area is missing or
    /// its build has not landed yet.
    pub fn load_graph(&self, key: &AreaKey) -> Result<Option<RouteGraph>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT graph FROM run_areas WHERE username = ? AND area_name = ?",
                params![key.username, key.area_name],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Load the area's geometry collection; `None` as for [`load_graph`].
    ///
    /// [`load_graph`]: RunningStore::load_graph
    pub fn load_geometry(&self, key: &AreaKey) -> Result<Option<GeometryCollection>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT geometry FROM run_areas WHERE username = ? AND area_name = ?",
                params![key.username, key.area_name],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Sub run areas
    // ========================================================================

    pub fn get_sub_run_area(&self, key: &AreaKey, sub_area_name: &str) -> Result<Option<SubRunArea>> {
        let sub = self
            .conn
            .query_row(
                "SELECT username, area_name, sub_area_name, polygon
                 FROM sub_run_areas
                 WHERE username = ? AND area_name = ? AND sub_area_name = ?",
                params![key.username, key.area_name, sub_area_name],
                |row| {
                    Ok(SubRunArea {
                        username: row.get(0)?,
                        area_name: row.get(1)?,
                        sub_area_name: row.get(2)?,
                        polygon: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(sub)
    }

    pub fn sub_run_areas(&self, key: &AreaKey) -> Result<Vec<SubRunArea>> {
        let mut stmt = self.conn.prepare(
            "SELECT username, area_name, sub_area_name, polygon
             FROM sub_run_areas
             WHERE username = ? AND area_name = ?
             ORDER BY sub_area_name",
        )?;
        let subs = stmt
            .query_map(params![key.username, key.area_name], |row| {
                Ok(SubRunArea {
                    username: row.get(0)?,
                    area_name: row.get(1)?,
                    sub_area_name: row.get(2)?,
                    polygon: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(subs)
    }

    /// Insert a sub run area. Requires a polygon; a duplicate name within
    /// the area is a typed conflict.
    pub fn insert_sub_run_area(&self, sub: &SubRunArea) -> Result<()> {
        let Some(polygon) = &sub.polygon else {
            return Err(CoverageError::MissingPolygon {
                username: sub.username.clone(),
                area_name: sub.area_name.clone(),
                sub_area_name: sub.sub_area_name.clone(),
            });
        };

        let key = AreaKey::new(&sub.username, &sub.area_name);
        if self.get_sub_run_area(&key, &sub.sub_area_name)?.is_some() {
            return Err(CoverageError::SubRunAreaExists {
                username: sub.username.clone(),
                area_name: sub.area_name.clone(),
                sub_area_name: sub.sub_area_name.clone(),
            });
        }

        self.conn.execute(
            "INSERT INTO sub_run_areas (username, area_name, sub_area_name, polygon)
             VALUES (?, ?, ?, ?)",
            params![sub.username, sub.area_name, sub.sub_area_name, polygon],
        )?;
        Ok(())
    }

    pub fn remove_sub_run_area(&self, key: &AreaKey, sub_area_name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sub_run_areas
             WHERE username = ? AND area_name = ? AND sub_area_name = ?",
            params![key.username, key.area_name, sub_area_name],
        )?;
        Ok(())
    }

    // ========================================================================
    // Runs and traversals
    // ========================================================================

    /// Store a run and its traversal records atomically.
    ///
    /// A run already logged on the date (without `allow_multiple`) comes
    /// back as [`StoreRunOutcome::DuplicateDate`]; nothing is written.
    /// A linestring that is not WKT-shaped is rejected outright.
    pub fn store_run(&mut self, key: &AreaKey, run: &LoggedRun) -> Result<StoreRunOutcome> {
        if let Some(linestring) = &run.linestring {
            if !crate::geometry::is_linestring_wkt(linestring) {
                return Err(CoverageError::MalformedGeometry {
                    message: format!("run linestring is not a WKT linestring: {}", linestring),
                });
            }
        }

        if !run.allow_multiple && self.exists_run_on_date(key, run.date)? {
            log::info!(
                "[RunningStore] run already exists on {} for {}, not storing",
                run.date,
                key
            );
            return Ok(StoreRunOutcome::DuplicateDate { date: run.date });
        }

        let duration_minutes = run.duration.as_deref().and_then(duration_to_minutes);

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO logged_runs
                 (username, area_name, date, distance_miles, duration_minutes, comments, linestring)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                key.username,
                key.area_name,
                run.date,
                run.distance_miles,
                duration_minutes,
                run.comments,
                run.linestring
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO segment_traversals (run_id, segment_id, traversals)
                 VALUES (?, ?, ?)",
            )?;
            for (segment_id, count) in &run.segment_traversals {
                stmt.execute(params![run_id, segment_id, count])?;
            }
        }
        tx.commit()?;

        Ok(StoreRunOutcome::Stored { run_id })
    }

    /// Whether a run is already stored for the date.
    pub fn exists_run_on_date(&self, key: &AreaKey, date: NaiveDate) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM logged_runs
             WHERE username = ? AND area_name = ? AND date = ?",
            params![key.username, key.area_name, date],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete one run by id; its traversal records cascade.
    pub fn delete_run_by_id(&self, run_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM logged_runs WHERE id = ?", params![run_id])?;
        Ok(())
    }

    /// Delete every run logged on a date; traversal records cascade.
    pub fn delete_runs_on_date(&self, key: &AreaKey, date: NaiveDate) -> Result<()> {
        self.conn.execute(
            "DELETE FROM logged_runs
             WHERE username = ? AND area_name = ? AND date = ?",
            params![key.username, key.area_name, date],
        )?;
        Ok(())
    }

    /// Number of distinct runs in the range.
    pub fn number_of_runs(&self, key: &AreaKey, range: DateRange) -> Result<i64> {
        let (clause, mut query_params) = range.clause();
        let query = format!(
            "SELECT COUNT(DISTINCT id) FROM logged_runs
             {} AND username = ? AND area_name = ?",
            clause
        );
        query_params.push(key.username.clone());
        query_params.push(key.area_name.clone());

        let count = self
            .conn
            .query_row(&query, params_from_iter(query_params), |row| row.get(0))?;
        Ok(count)
    }

    /// All traversal records in the range, ordered by run date ascending.
    pub fn runs_in_date_range(&self, key: &AreaKey, range: DateRange) -> Result<Vec<TraversalRow>> {
        let (clause, mut query_params) = range.clause();
        let query = format!(
            "SELECT lr.date, st.segment_id, st.traversals
             FROM segment_traversals st
             INNER JOIN (
                 SELECT id, date FROM logged_runs
                 {} AND username = ? AND area_name = ?
             ) lr ON st.run_id = lr.id
             ORDER BY lr.date ASC",
            clause
        );
        query_params.push(key.username.clone());
        query_params.push(key.area_name.clone());

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(query_params), |row| {
                Ok(TraversalRow {
                    date: row.get(0)?,
                    segment_id: row.get(1)?,
                    traversals: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Per-segment traversal totals over the range.
    pub fn traversal_totals(&self, key: &AreaKey, range: DateRange) -> Result<Vec<SegmentTotal>> {
        let (clause, mut query_params) = range.clause();
        let query = format!(
            "SELECT st.segment_id, SUM(st.traversals) AS total_traversals
             FROM segment_traversals st
             INNER JOIN (
                 SELECT id FROM logged_runs
                 {} AND username = ? AND area_name = ?
             ) lr ON st.run_id = lr.id
             GROUP BY st.segment_id
             ORDER BY st.segment_id",
            clause
        );
        query_params.push(key.username.clone());
        query_params.push(key.area_name.clone());

        let mut stmt = self.conn.prepare(&query)?;
        let totals = stmt
            .query_map(params_from_iter(query_params), |row| {
                Ok(SegmentTotal {
                    segment_id: row.get(0)?,
                    total_traversals: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(totals)
    }

    /// For each segment covered in the range, the earliest date it was
    /// traversed; grouped per segment and ordered by that date.
    pub fn first_seen(&self, key: &AreaKey, range: DateRange) -> Result<Vec<FirstSeen>> {
        let (clause, mut query_params) = range.clause();
        let query = format!(
            "SELECT MIN(lr.date), st.segment_id
             FROM segment_traversals st
             INNER JOIN (
                 SELECT id, date FROM logged_runs
                 {} AND username = ? AND area_name = ?
             ) lr ON st.run_id = lr.id
             GROUP BY st.segment_id
             ORDER BY MIN(lr.date)",
            clause
        );
        query_params.push(key.username.clone());
        query_params.push(key.area_name.clone());

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(query_params), |row| {
                Ok(FirstSeen {
                    date: row.get(0)?,
                    segment_id: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Stored run geometries in the range, ordered by date ascending.
    pub fn run_linestrings(&self, key: &AreaKey, range: DateRange) -> Result<Vec<RunLinestring>> {
        let (clause, mut query_params) = range.clause();
        let query = format!(
            "SELECT date, linestring FROM logged_runs
             {} AND username = ? AND area_name = ? AND linestring IS NOT NULL
             ORDER BY date ASC",
            clause
        );
        query_params.push(key.username.clone());
        query_params.push(key.area_name.clone());

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(query_params), |row| {
                Ok(RunLinestring {
                    date: row.get(0)?,
                    linestring: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ========================================================================
    // Ignored segments
    // ========================================================================

    /// Segment ids currently excluded from stats and routing views.
    pub fn ignored_segment_ids(&self, key: &AreaKey) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT segment_id FROM ignored_segments
             WHERE username = ? AND area_name = ?",
        )?;
        let ids = stmt
            .query_map(params![key.username, key.area_name], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Toggle the ignore state of the given segment ids in one transaction:
    /// ids not currently ignored are added, ids currently ignored are
    /// removed. A concurrent reader sees either the whole update or none
    /// of it. Toggling the same set twice restores the original state.
    pub fn update_ignored_segments(&mut self, key: &AreaKey, segment_ids: &[String]) -> Result<()> {
        let currently: HashSet<String> = self.ignored_segment_ids(key)?.into_iter().collect();

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO ignored_segments (username, area_name, segment_id)
                 VALUES (?, ?, ?)",
            )?;
            let mut delete = tx.prepare(
                "DELETE FROM ignored_segments
                 WHERE username = ? AND area_name = ? AND segment_id = ?",
            )?;
            for segment_id in segment_ids {
                if currently.contains(segment_id) {
                    delete.execute(params![key.username, key.area_name, segment_id])?;
                } else {
                    insert.execute(params![key.username, key.area_name, segment_id])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Date-grouped reporting
    // ========================================================================

    /// Newly covered segment ids per date, ordered by date.
    pub fn first_seen_by_date(
        &self,
        key: &AreaKey,
        range: DateRange,
    ) -> Result<BTreeMap<NaiveDate, Vec<String>>> {
        let mut by_date: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
        for row in self.first_seen(key, range)? {
            by_date.entry(row.date).or_default().push(row.segment_id);
        }
        Ok(by_date)
    }

    /// Traversals bundled per run date, each with the day gap to the next
    /// date (0 for the last). Shaped for coverage playback animation.
    pub fn runs_grouped_by_date(
        &self,
        key: &AreaKey,
        range: DateRange,
    ) -> Result<Vec<DatedTraversals>> {
        let rows = self.runs_in_date_range(key, range)?;

        let mut grouped: Vec<DatedTraversals> = Vec::new();
        for row in rows {
            match grouped.last_mut() {
                Some(group) if group.date == row.date => group.traversals.push(row),
                _ => grouped.push(DatedTraversals {
                    date: row.date,
                    diff_days: 0,
                    traversals: vec![row],
                }),
            }
        }
        for i in 0..grouped.len().saturating_sub(1) {
            grouped[i].diff_days = (grouped[i + 1].date - grouped[i].date).num_days();
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Segment};
    use crate::LatLng;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn area(username: &str, area_name: &str) -> RunArea {
        RunArea {
            username: username.to_string(),
            area_name: area_name.to_string(),
            polygon: "POLYGON((53 -1, 53 -2, 54 -2, 53 -1))".to_string(),
            active: false,
        }
    }

    fn run(on: &str, traversals: &[(&str, u32)]) -> LoggedRun {
        LoggedRun {
            date: date(on),
            distance_miles: 3.1,
            duration: Some("00:25:30.00".to_string()),
            comments: None,
            linestring: None,
            allow_multiple: false,
            segment_traversals: traversals
                .iter()
                .map(|(id, count)| (id.to_string(), *count))
                .collect(),
        }
    }

    fn store_with_area() -> (RunningStore, AreaKey) {
        let store = RunningStore::in_memory().unwrap();
        store.insert_run_area(&area("ada", "york")).unwrap();
        (store, AreaKey::new("ada", "york"))
    }

    fn sample_artifacts() -> NetworkArtifacts {
        let graph = RouteGraph::from_parts(
            vec![
                Node {
                    id: 1,
                    position: LatLng::new(53.0, -1.0),
                },
                Node {
                    id: 2,
                    position: LatLng::new(53.001, -1.0),
                },
            ],
            vec![Segment {
                segment_id: "12_0".to_string(),
                start_node: 1,
                end_node: 2,
                length_metres: 111.0,
            }],
        );
        NetworkArtifacts {
            graph,
            geometry: GeometryCollection::default(),
        }
    }

    #[test]
    fn test_duration_to_minutes() {
        assert_eq!(duration_to_minutes("01:30:00.00"), Some(90.0));
        let m = duration_to_minutes("00:25:30.00").unwrap();
        assert!((m - 25.5).abs() < 1e-9);
        assert_eq!(duration_to_minutes("garbage"), None);
        assert_eq!(duration_to_minutes(""), None);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2024-05-01").unwrap(), date("2024-05-01"));
        assert!(matches!(
            parse_date("01/05/2024").unwrap_err(),
            CoverageError::MalformedDate { .. }
        ));
    }

    #[test]
    fn test_store_run_rejects_malformed_linestring() {
        let (mut store, key) = store_with_area();
        let mut bad = run("2024-05-01", &[("a_0", 1)]);
        bad.linestring = Some("not wkt at all".to_string());

        let err = store.store_run(&key, &bad).unwrap_err();
        assert!(matches!(err, CoverageError::MalformedGeometry { .. }));
        assert_eq!(store.number_of_runs(&key, DateRange::all()).unwrap(), 0);
    }

    #[test]
    fn test_insert_user_conflicts_on_duplicate() {
        let store = RunningStore::in_memory().unwrap();
        store.insert_user("ada", "hash-1").unwrap();

        let err = store.insert_user("ada", "hash-2").unwrap_err();
        assert!(matches!(err, CoverageError::UsernameExists { .. }));

        let user = store.get_user("ada").unwrap().unwrap();
        assert_eq!(user.hashed_password, "hash-1");
    }

    #[test]
    fn test_insert_run_area_conflicts_on_duplicate() {
        let (store, _) = store_with_area();
        let err = store.insert_run_area(&area("ada", "york")).unwrap_err();
        assert!(matches!(err, CoverageError::RunAreaExists { .. }));

        // Same name for a different user is fine.
        store.insert_run_area(&area("grace", "york")).unwrap();
    }

    #[test]
    fn test_at_most_one_active_area() {
        let (store, _) = store_with_area();
        store.insert_run_area(&area("ada", "leeds")).unwrap();

        store.set_active_area("ada", "york").unwrap();
        store.set_active_area("ada", "leeds").unwrap();

        let active = store.active_area_for("ada").unwrap().unwrap();
        assert_eq!(active.area_name, "leeds");

        let all = store.areas_for_user("ada", false).unwrap();
        assert_eq!(all.iter().filter(|a| a.active).count(), 1);
    }

    #[test]
    fn test_artifact_save_and_load_round_trip() {
        let (store, key) = store_with_area();

        // Nothing saved yet: area exists but the build hasn't landed.
        assert!(store.load_graph(&key).unwrap().is_none());
        assert!(store.load_geometry(&key).unwrap().is_none());

        store
            .save_network_artifacts(&key, &sample_artifacts())
            .unwrap();

        let graph = store.load_graph(&key).unwrap().unwrap();
        assert_eq!(graph.segment_count(), 1);
        assert!(graph.segment_by_id("12_0").is_some());
        assert!(store.load_geometry(&key).unwrap().is_some());

        // Filtered area listing now includes the area.
        assert_eq!(store.areas_for_user("ada", true).unwrap().len(), 1);
    }

    #[test]
    fn test_save_artifacts_for_missing_area_is_not_found() {
        let store = RunningStore::in_memory().unwrap();
        let err = store
            .save_network_artifacts(&AreaKey::new("ada", "nowhere"), &sample_artifacts())
            .unwrap_err();
        assert!(matches!(err, CoverageError::NotFound { .. }));
    }

    #[test]
    fn test_store_run_rejects_duplicate_date() {
        let (mut store, key) = store_with_area();

        let outcome = store.store_run(&key, &run("2024-05-01", &[("a_0", 2)])).unwrap();
        assert!(matches!(outcome, StoreRunOutcome::Stored { .. }));

        let outcome = store.store_run(&key, &run("2024-05-01", &[("b_0", 1)])).unwrap();
        assert_eq!(
            outcome,
            StoreRunOutcome::DuplicateDate {
                date: date("2024-05-01")
            }
        );

        // Exactly one run persisted, and only its traversals.
        assert_eq!(store.number_of_runs(&key, DateRange::all()).unwrap(), 1);
        let rows = store.runs_in_date_range(&key, DateRange::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment_id, "a_0");
    }

    #[test]
    fn test_store_run_allow_multiple() {
        let (mut store, key) = store_with_area();

        let mut second = run("2024-05-01", &[("b_0", 1)]);
        second.allow_multiple = true;

        store.store_run(&key, &run("2024-05-01", &[("a_0", 2)])).unwrap();
        let outcome = store.store_run(&key, &second).unwrap();
        assert!(matches!(outcome, StoreRunOutcome::Stored { .. }));
        assert_eq!(store.number_of_runs(&key, DateRange::all()).unwrap(), 2);
    }

    #[test]
    fn test_date_range_queries() {
        let (mut store, key) = store_with_area();
        store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        store.store_run(&key, &run("2024-05-10", &[("a_0", 2), ("b_0", 1)])).unwrap();
        store.store_run(&key, &run("2024-05-20", &[("b_0", 3)])).unwrap();

        assert_eq!(store.number_of_runs(&key, DateRange::all()).unwrap(), 3);
        assert_eq!(
            store
                .number_of_runs(&key, DateRange::since(date("2024-05-05")))
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .number_of_runs(&key, DateRange::until(date("2024-05-10")))
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .number_of_runs(&key, DateRange::between(date("2024-05-10"), date("2024-05-20")))
                .unwrap(),
            2
        );

        // Rows come back ordered by date ascending.
        let rows = store.runs_in_date_range(&key, DateRange::all()).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.windows(2).all(|w| w[0].date <= w[1].date));

        // Range scoping is per area: a second area sees nothing.
        store.insert_run_area(&area("ada", "leeds")).unwrap();
        let other = AreaKey::new("ada", "leeds");
        assert_eq!(store.number_of_runs(&other, DateRange::all()).unwrap(), 0);
    }

    #[test]
    fn test_traversal_totals_sum_per_segment() {
        let (mut store, key) = store_with_area();
        store.store_run(&key, &run("2024-05-01", &[("a_0", 1), ("b_0", 2)])).unwrap();
        store.store_run(&key, &run("2024-05-02", &[("a_0", 3)])).unwrap();

        let totals = store.traversal_totals(&key, DateRange::all()).unwrap();
        assert_eq!(
            totals,
            vec![
                SegmentTotal {
                    segment_id: "a_0".to_string(),
                    total_traversals: 4
                },
                SegmentTotal {
                    segment_id: "b_0".to_string(),
                    total_traversals: 2
                },
            ]
        );

        let recent = store
            .traversal_totals(&key, DateRange::since(date("2024-05-02")))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].total_traversals, 3);
    }

    #[test]
    fn test_first_seen_earliest_date_per_segment() {
        let (mut store, key) = store_with_area();
        store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        store.store_run(&key, &run("2024-05-05", &[("a_0", 1), ("b_0", 1)])).unwrap();

        let first = store.first_seen(&key, DateRange::all()).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].segment_id, "a_0");
        assert_eq!(first[0].date, date("2024-05-01"));
        assert_eq!(first[1].segment_id, "b_0");
        assert_eq!(first[1].date, date("2024-05-05"));

        // Restricting the range moves a_0's first sighting.
        let first = store
            .first_seen(&key, DateRange::since(date("2024-05-02")))
            .unwrap();
        assert_eq!(first[0].date, date("2024-05-05"));
    }

    #[test]
    fn test_delete_run_cascades_traversals() {
        let (mut store, key) = store_with_area();
        let outcome = store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        let StoreRunOutcome::Stored { run_id } = outcome else {
            panic!("expected stored run");
        };
        store.store_run(&key, &run("2024-05-02", &[("b_0", 1)])).unwrap();

        store.delete_run_by_id(run_id).unwrap();
        let rows = store.runs_in_date_range(&key, DateRange::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment_id, "b_0");

        store.delete_runs_on_date(&key, date("2024-05-02")).unwrap();
        assert!(store.runs_in_date_range(&key, DateRange::all()).unwrap().is_empty());
        assert_eq!(store.number_of_runs(&key, DateRange::all()).unwrap(), 0);
    }

    #[test]
    fn test_run_linestrings_skip_missing_geometry() {
        let (mut store, key) = store_with_area();
        let mut with_geometry = run("2024-05-02", &[("a_0", 1)]);
        with_geometry.linestring = Some("LINESTRING(53 -1, 53.001 -1)".to_string());

        store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        store.store_run(&key, &with_geometry).unwrap();

        let lines = store.run_linestrings(&key, DateRange::all()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].date, date("2024-05-02"));
    }

    #[test]
    fn test_ignored_segment_toggle_is_idempotent_over_two_passes() {
        let (mut store, key) = store_with_area();
        let ids = vec!["a_0".to_string(), "b_0".to_string()];

        store.update_ignored_segments(&key, &ids).unwrap();
        let mut ignored = store.ignored_segment_ids(&key).unwrap();
        ignored.sort();
        assert_eq!(ignored, ids);

        // Toggling the same set again restores the original (empty) state.
        store.update_ignored_segments(&key, &ids).unwrap();
        assert!(store.ignored_segment_ids(&key).unwrap().is_empty());
    }

    #[test]
    fn test_ignored_segment_toggle_mixed_set() {
        let (mut store, key) = store_with_area();
        store
            .update_ignored_segments(&key, &["a_0".to_string()])
            .unwrap();

        // a_0 flips off, c_0 flips on.
        store
            .update_ignored_segments(&key, &["a_0".to_string(), "c_0".to_string()])
            .unwrap();

        assert_eq!(store.ignored_segment_ids(&key).unwrap(), vec!["c_0".to_string()]);
    }

    #[test]
    fn test_remove_run_area_cascades_and_promotes_active() {
        let (mut store, key) = store_with_area();
        store.insert_run_area(&area("ada", "leeds")).unwrap();
        store.set_active_area("ada", "york").unwrap();

        store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        store
            .update_ignored_segments(&key, &["a_0".to_string()])
            .unwrap();
        store
            .insert_sub_run_area(&SubRunArea {
                username: "ada".to_string(),
                area_name: "york".to_string(),
                sub_area_name: "north".to_string(),
                polygon: Some("POLYGON((53 -1, 53 -2, 54 -2, 53 -1))".to_string()),
            })
            .unwrap();

        store.remove_run_area(&key).unwrap();

        assert!(store.runs_in_date_range(&key, DateRange::all()).unwrap().is_empty());
        assert!(store.ignored_segment_ids(&key).unwrap().is_empty());
        assert!(store.sub_run_areas(&key).unwrap().is_empty());
        let remaining = store.areas_for_user("ada", false).unwrap();
        assert_eq!(remaining.len(), 1);
        // The other area was promoted to active.
        assert_eq!(
            store.active_area_for("ada").unwrap().unwrap().area_name,
            "leeds"
        );
    }

    #[test]
    fn test_sub_run_area_conflicts() {
        let (store, key) = store_with_area();
        let sub = SubRunArea {
            username: "ada".to_string(),
            area_name: "york".to_string(),
            sub_area_name: "north".to_string(),
            polygon: Some("POLYGON((53 -1, 53 -2, 54 -2, 53 -1))".to_string()),
        };

        store.insert_sub_run_area(&sub).unwrap();
        let err = store.insert_sub_run_area(&sub).unwrap_err();
        assert!(matches!(err, CoverageError::SubRunAreaExists { .. }));

        let missing = SubRunArea {
            polygon: None,
            sub_area_name: "south".to_string(),
            ..sub
        };
        let err = store.insert_sub_run_area(&missing).unwrap_err();
        assert!(matches!(err, CoverageError::MissingPolygon { .. }));

        assert_eq!(store.sub_run_areas(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_first_seen_by_date_groups_segments() {
        let (mut store, key) = store_with_area();
        store.store_run(&key, &run("2024-05-01", &[("a_0", 1), ("b_0", 1)])).unwrap();
        store.store_run(&key, &run("2024-05-05", &[("b_0", 1), ("c_0", 1)])).unwrap();

        let by_date = store.first_seen_by_date(&key, DateRange::all()).unwrap();
        assert_eq!(by_date.len(), 2);
        let mut first_day = by_date[&date("2024-05-01")].clone();
        first_day.sort();
        assert_eq!(first_day, vec!["a_0".to_string(), "b_0".to_string()]);
        assert_eq!(by_date[&date("2024-05-05")], vec!["c_0".to_string()]);
    }

    #[test]
    fn test_runs_grouped_by_date_with_day_gaps() {
        let (mut store, key) = store_with_area();
        store.store_run(&key, &run("2024-05-01", &[("a_0", 1)])).unwrap();
        store.store_run(&key, &run("2024-05-04", &[("b_0", 1), ("c_0", 2)])).unwrap();
        store.store_run(&key, &run("2024-05-09", &[("a_0", 1)])).unwrap();

        let grouped = store.runs_grouped_by_date(&key, DateRange::all()).unwrap();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].diff_days, 3);
        assert_eq!(grouped[1].diff_days, 5);
        assert_eq!(grouped[1].traversals.len(), 2);
        // Nothing to wait for after the last run.
        assert_eq!(grouped[2].diff_days, 0);
    }
}
