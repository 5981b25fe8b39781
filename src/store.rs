use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Configuration ───────────────────────────────────────────────

/// How long SQLite retries on a locked database before giving up (ms).
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Batch deletes are chunked so the generated IN-list stays well under
/// SQLite's bound-variable limit.
const DELETE_CHUNK: usize = 500;

/// Column list shared by every query that reads full sample rows.
/// Must stay in sync with `sample_from_row`.
const SAMPLE_COLUMNS: &str = "id, recorded_at, url_path, screen_id, hook_suffix, \
     http_method, user_id, user_roles, load_ms, query_count, peak_memory_bytes, \
     plugins_hash, theme_slug, is_ajax, is_heartbeat";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at       INTEGER NOT NULL,  -- unix epoch milliseconds, UTC
    url_path          TEXT    NOT NULL,
    screen_id         TEXT    NOT NULL DEFAULT '',
    hook_suffix       TEXT    NOT NULL DEFAULT '',
    http_method       TEXT    NOT NULL,
    user_id           INTEGER NOT NULL,
    user_roles        TEXT    NOT NULL,  -- JSON array of role names
    load_ms           INTEGER NOT NULL,
    query_count       INTEGER NOT NULL,
    peak_memory_bytes INTEGER NOT NULL,
    plugins_hash      TEXT    NOT NULL,
    theme_slug        TEXT    NOT NULL,
    is_ajax           INTEGER NOT NULL,
    is_heartbeat      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_recorded_at ON samples(recorded_at);
CREATE INDEX IF NOT EXISTS idx_samples_load_ms     ON samples(load_ms);

CREATE TABLE IF NOT EXISTS slow_queries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_id   INTEGER NOT NULL REFERENCES samples(id),
    recorded_at INTEGER NOT NULL,
    query_ms    REAL    NOT NULL,
    query_text  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_slow_queries_sample_id   ON slow_queries(sample_id);
CREATE INDEX IF NOT EXISTS idx_slow_queries_recorded_at ON slow_queries(recorded_at);

CREATE TABLE IF NOT EXISTS settings (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    json TEXT NOT NULL
);
"#;

// ─── Errors ──────────────────────────────────────────────────────

/// Storage-layer failure. Report and export surface this to the caller;
/// the recorder and sweeper log it and carry on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Row types ───────────────────────────────────────────────────

/// A sample about to be inserted: everything but the id, which the
/// store assigns.
#[derive(Debug, Clone)]
pub struct NewSample {
    pub recorded_at: i64,
    pub url_path: String,
    pub screen_id: String,
    pub hook_suffix: String,
    pub http_method: String,
    pub user_id: i64,
    pub user_roles: Vec<String>,
    pub load_ms: i64,
    pub query_count: i64,
    pub peak_memory_bytes: i64,
    pub plugins_hash: String,
    pub theme_slug: String,
    pub is_ajax: bool,
    pub is_heartbeat: bool,
}

/// One persisted measurement of a single admitted admin request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub id: i64,
    pub recorded_at: i64,
    pub url_path: String,
    pub screen_id: String,
    pub hook_suffix: String,
    pub http_method: String,
    pub user_id: i64,
    pub user_roles: Vec<String>,
    pub load_ms: i64,
    pub query_count: i64,
    pub peak_memory_bytes: i64,
    pub plugins_hash: String,
    pub theme_slug: String,
    pub is_ajax: bool,
    pub is_heartbeat: bool,
}

/// A slow query about to be attached to a sample.
#[derive(Debug, Clone)]
pub struct NewSlowQuery {
    pub recorded_at: i64,
    pub query_ms: f64,
    pub query_text: String,
}

/// A slow query joined to its parent sample's screen context, as it
/// appears in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryHit {
    pub id: i64,
    pub sample_id: i64,
    pub recorded_at: i64,
    pub query_ms: f64,
    pub query_text: String,
    pub screen_id: String,
    pub hook_suffix: String,
    pub url_path: String,
}

/// Aggregates for one (screen_id, hook_suffix) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageGroupRow {
    pub screen_id: String,
    pub hook_suffix: String,
    pub samples: i64,
    pub avg_load_ms: f64,
    pub max_load_ms: i64,
    pub avg_query_count: f64,
}

// ─── Store ───────────────────────────────────────────────────────

/// The shared row store. Every component talks to the database through
/// this type; access is serialized through a mutex around the single
/// connection, and every operation is a single statement (or a short
/// id-targeted batch), so no application-level transactions are needed.
pub struct SampleStore {
    conn: Mutex<Connection>,
}

impl SampleStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Insert one sample row, returning its assigned id.
    pub fn insert_sample(&self, sample: &NewSample) -> Result<i64, StoreError> {
        let roles_json = serde_json::to_string(&sample.user_roles)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO samples (recorded_at, url_path, screen_id, hook_suffix, \
             http_method, user_id, user_roles, load_ms, query_count, \
             peak_memory_bytes, plugins_hash, theme_slug, is_ajax, is_heartbeat) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                sample.recorded_at,
                sample.url_path,
                sample.screen_id,
                sample.hook_suffix,
                sample.http_method,
                sample.user_id,
                roles_json,
                sample.load_ms,
                sample.query_count,
                sample.peak_memory_bytes,
                sample.plugins_hash,
                sample.theme_slug,
                sample.is_ajax,
                sample.is_heartbeat,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach slow-query rows to an existing sample. Returns how many
    /// were inserted.
    pub fn insert_slow_queries(
        &self,
        sample_id: i64,
        rows: &[NewSlowQuery],
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "INSERT INTO slow_queries (sample_id, recorded_at, query_ms, query_text) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut inserted = 0;
        for row in rows {
            stmt.execute(params![
                sample_id,
                row.recorded_at,
                row.query_ms,
                row.query_text
            ])?;
            inserted += 1;
        }
        Ok(inserted)
    }

    // ── Retention ───────────────────────────────────────────────

    /// Ids of samples strictly older than `cutoff_ms`, oldest first,
    /// capped at `limit`. Rows at exactly the cutoff are retained.
    pub fn stale_sample_ids(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM samples WHERE recorded_at < ?1 \
             ORDER BY recorded_at ASC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![cutoff_ms, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Delete the given samples and their slow-query children, children
    /// first so no orphan can survive. Returns
    /// `(deleted_slow_queries, deleted_samples)`.
    pub fn delete_samples_with_children(
        &self,
        ids: &[i64],
    ) -> Result<(usize, usize), StoreError> {
        let conn = self.conn.lock();
        let mut slow_queries = 0;
        let mut samples = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            slow_queries += conn.execute(
                &format!("DELETE FROM slow_queries WHERE sample_id IN ({placeholders})"),
                params_from_iter(chunk.iter()),
            )?;
            samples += conn.execute(
                &format!("DELETE FROM samples WHERE id IN ({placeholders})"),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok((slow_queries, samples))
    }

    // ── Window reads ────────────────────────────────────────────

    /// Count of samples recorded at or after `since_ms`.
    pub fn count_since(&self, since_ms: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE recorded_at >= ?1",
            params![since_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Mean load_ms over the window, or `None` when the window is empty.
    pub fn avg_load_since(&self, since_ms: i64) -> Result<Option<f64>, StoreError> {
        let conn = self.conn.lock();
        let avg = conn.query_row(
            "SELECT AVG(load_ms) FROM samples WHERE recorded_at >= ?1",
            params![since_ms],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    /// Maximum load_ms over the window, or `None` when the window is empty.
    pub fn max_load_since(&self, since_ms: i64) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let max = conn.query_row(
            "SELECT MAX(load_ms) FROM samples WHERE recorded_at >= ?1",
            params![since_ms],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// The load_ms at rank `offset` (0-based) with window samples sorted
    /// ascending by load_ms. Ties fall in storage order.
    pub fn load_at_rank(
        &self,
        since_ms: i64,
        offset: i64,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT load_ms FROM samples WHERE recorded_at >= ?1 \
                 ORDER BY load_ms ASC LIMIT 1 OFFSET ?2",
                params![since_ms, offset],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Per-(screen_id, hook_suffix) aggregates over the window, keeping
    /// only groups with at least `min_samples` rows, slowest mean first.
    pub fn slowest_pages(
        &self,
        since_ms: i64,
        min_samples: i64,
        limit: i64,
    ) -> Result<Vec<PageGroupRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT screen_id, hook_suffix, COUNT(*), AVG(load_ms), MAX(load_ms), \
             AVG(query_count) \
             FROM samples WHERE recorded_at >= ?1 \
             GROUP BY screen_id, hook_suffix \
             HAVING COUNT(*) >= ?2 \
             ORDER BY AVG(load_ms) DESC \
             LIMIT ?3",
        )?;
        let groups = stmt
            .query_map(params![since_ms, min_samples, limit], |row| {
                Ok(PageGroupRow {
                    screen_id: row.get(0)?,
                    hook_suffix: row.get(1)?,
                    samples: row.get(2)?,
                    avg_load_ms: row.get(3)?,
                    max_load_ms: row.get(4)?,
                    avg_query_count: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// The `limit` window samples with the highest load_ms, descending.
    pub fn worst_outliers(
        &self,
        since_ms: i64,
        limit: i64,
    ) -> Result<Vec<SampleRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE recorded_at >= ?1 \
             ORDER BY load_ms DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since_ms, limit], sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The `limit` slowest queries in the window, joined to their parent
    /// sample for screen context, descending by duration.
    pub fn slow_queries_since(
        &self,
        since_ms: i64,
        limit: i64,
    ) -> Result<Vec<SlowQueryHit>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT q.id, q.sample_id, q.recorded_at, q.query_ms, q.query_text, \
             s.screen_id, s.hook_suffix, s.url_path \
             FROM slow_queries q JOIN samples s ON s.id = q.sample_id \
             WHERE q.recorded_at >= ?1 \
             ORDER BY q.query_ms DESC \
             LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![since_ms, limit], |row| {
                Ok(SlowQueryHit {
                    id: row.get(0)?,
                    sample_id: row.get(1)?,
                    recorded_at: row.get(2)?,
                    query_ms: row.get(3)?,
                    query_text: row.get(4)?,
                    screen_id: row.get(5)?,
                    hook_suffix: row.get(6)?,
                    url_path: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// The `limit` most recent window samples, newest first.
    pub fn recent_samples(
        &self,
        since_ms: i64,
        limit: i64,
    ) -> Result<Vec<SampleRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE recorded_at >= ?1 \
             ORDER BY recorded_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since_ms, limit], sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Slow-query rows whose parent sample no longer exists. Always zero
    /// after a correct sweep; exposed for diagnostics and tests.
    pub fn orphaned_slow_queries(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM slow_queries q \
             LEFT JOIN samples s ON s.id = q.sample_id \
             WHERE s.id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Settings record ─────────────────────────────────────────

    /// The stored settings document, if one has ever been saved.
    pub fn load_settings_json(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let json = conn
            .query_row("SELECT json FROM settings WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(json)
    }

    /// Overwrite the singleton settings document.
    pub fn save_settings_json(&self, json: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (id, json) VALUES (1, ?1) \
             ON CONFLICT(id) DO UPDATE SET json = excluded.json",
            params![json],
        )?;
        Ok(())
    }
}

/// Map a full sample row. Column order must match `SAMPLE_COLUMNS`.
fn sample_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SampleRow> {
    let roles_json: String = row.get(7)?;
    Ok(SampleRow {
        id: row.get(0)?,
        recorded_at: row.get(1)?,
        url_path: row.get(2)?,
        screen_id: row.get(3)?,
        hook_suffix: row.get(4)?,
        http_method: row.get(5)?,
        user_id: row.get(6)?,
        user_roles: serde_json::from_str(&roles_json).unwrap_or_default(),
        load_ms: row.get(8)?,
        query_count: row.get(9)?,
        peak_memory_bytes: row.get(10)?,
        plugins_hash: row.get(11)?,
        theme_slug: row.get(12)?,
        is_ajax: row.get(13)?,
        is_heartbeat: row.get(14)?,
    })
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(recorded_at: i64, load_ms: i64) -> NewSample {
        NewSample {
            recorded_at,
            url_path: "/admin/orders".into(),
            screen_id: "orders".into(),
            hook_suffix: "admin_page_orders".into(),
            http_method: "GET".into(),
            user_id: 7,
            user_roles: vec!["manager".into(), "editor".into()],
            load_ms,
            query_count: 12,
            peak_memory_bytes: 32 << 20,
            plugins_hash: "abc123".into(),
            theme_slug: "storefront".into(),
            is_ajax: false,
            is_heartbeat: false,
        }
    }

    #[test]
    fn insert_assigns_monotonic_ids_and_round_trips() {
        let store = SampleStore::open_in_memory().unwrap();
        let a = store.insert_sample(&sample_at(1_000, 10)).unwrap();
        let b = store.insert_sample(&sample_at(2_000, 20)).unwrap();
        assert!(b > a);

        let rows = store.recent_samples(0, 10).unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0].id, b);
        assert_eq!(rows[0].load_ms, 20);
        assert_eq!(rows[1].user_roles, vec!["manager", "editor"]);
        assert!(!rows[1].is_ajax);
    }

    #[test]
    fn open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.db");
        {
            let store = SampleStore::open(&path).unwrap();
            store.insert_sample(&sample_at(1_000, 10)).unwrap();
        }
        // Reopen and read back.
        let store = SampleStore::open(&path).unwrap();
        assert_eq!(store.count_since(0).unwrap(), 1);
    }

    #[test]
    fn delete_removes_children_before_parents() {
        let store = SampleStore::open_in_memory().unwrap();
        let id = store.insert_sample(&sample_at(1_000, 10)).unwrap();
        store
            .insert_slow_queries(
                id,
                &[
                    NewSlowQuery {
                        recorded_at: 1_000,
                        query_ms: 300.0,
                        query_text: "SELECT 1".into(),
                    },
                    NewSlowQuery {
                        recorded_at: 1_000,
                        query_ms: 450.5,
                        query_text: "SELECT 2".into(),
                    },
                ],
            )
            .unwrap();

        let (slow, samples) = store.delete_samples_with_children(&[id]).unwrap();
        assert_eq!((slow, samples), (2, 1));
        assert_eq!(store.count_since(0).unwrap(), 0);
        assert_eq!(store.orphaned_slow_queries().unwrap(), 0);
    }

    #[test]
    fn stale_ids_respect_cutoff_and_limit() {
        let store = SampleStore::open_in_memory().unwrap();
        for at in [100, 200, 300, 400] {
            store.insert_sample(&sample_at(at, 10)).unwrap();
        }
        // Strictly-older-than cutoff; row at 300 survives.
        let ids = store.stale_sample_ids(300, 10).unwrap();
        assert_eq!(ids.len(), 2);
        let capped = store.stale_sample_ids(300, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn rank_select_walks_sorted_order() {
        let store = SampleStore::open_in_memory().unwrap();
        // Insert out of order so storage order differs from value order.
        for load in [30, 10, 20] {
            store.insert_sample(&sample_at(1_000, load)).unwrap();
        }
        assert_eq!(store.load_at_rank(0, 0).unwrap(), Some(10));
        assert_eq!(store.load_at_rank(0, 2).unwrap(), Some(30));
        assert_eq!(store.load_at_rank(0, 3).unwrap(), None);
    }

    #[test]
    fn settings_record_is_a_singleton() {
        let store = SampleStore::open_in_memory().unwrap();
        assert!(store.load_settings_json().unwrap().is_none());
        store.save_settings_json(r#"{"a":1}"#).unwrap();
        store.save_settings_json(r#"{"a":2}"#).unwrap();
        assert_eq!(
            store.load_settings_json().unwrap().as_deref(),
            Some(r#"{"a":2}"#)
        );
    }
}
