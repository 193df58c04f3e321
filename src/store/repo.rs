//! Store operations over the embedded database
//!
//! Every operation acquires the store mutex for the full duration of the
//! database call, making the store serializable at a coarse grain. That is
//! adequate at flush cadence (seconds).

use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const DB_FILE: &str = "posthog.db";

/// Reserved settings keys
const SETTING_DISTINCT_ID: &str = "distinct_id";
const SETTING_SESSION_ID: &str = "session_id";
const SETTING_FEATURE_FLAGS: &str = "feature_flags";
const SETTING_OPT_OUT: &str = "opt_out";

/// Durable key/value and event-queue storage
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database under the given data directory.
    ///
    /// Creates the directory if missing, then `posthog.db` inside it.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(data_dir.join(DB_FILE))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        super::schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ============================================
    // Event queue
    // ============================================

    /// Insert an event at the tail of the queue.
    pub fn enqueue(&self, event_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (id, event_json, created_at) VALUES (?1, ?2, ?3)",
            params![
                Uuid::new_v4().to_string(),
                event_json,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Read up to `limit` queued events, oldest first. The timestamp has
    /// one-second resolution, so ties fall back to the insertion-ordered
    /// rowid to keep the queue strictly FIFO.
    ///
    /// Pure read; rows are removed separately after the server acknowledged
    /// the batch.
    pub fn drain(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_json FROM events ORDER BY created_at ASC, rowid ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete the rows with the given ids as a single statement.
    pub fn remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM events WHERE id IN ({})", placeholders);
        conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Exact number of queued events.
    pub fn queue_size(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(count)
    }

    // ============================================
    // Settings
    // ============================================

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Persistent distinct id, if one was ever assigned.
    pub fn distinct_id(&self) -> Result<Option<String>> {
        self.get_setting(SETTING_DISTINCT_ID)
    }

    pub fn set_distinct_id(&self, distinct_id: &str) -> Result<()> {
        self.set_setting(SETTING_DISTINCT_ID, distinct_id)
    }

    /// Current session id. Regenerated at every agent start, so this only
    /// reflects the most recent process.
    pub fn session_id(&self) -> Result<Option<String>> {
        self.get_setting(SETTING_SESSION_ID)
    }

    pub fn set_session_id(&self, session_id: &str) -> Result<()> {
        self.set_setting(SETTING_SESSION_ID, session_id)
    }

    /// Raw JSON blob of the last successful decide response.
    pub fn feature_flags(&self) -> Result<Option<String>> {
        self.get_setting(SETTING_FEATURE_FLAGS)
    }

    pub fn set_feature_flags(&self, flags_json: &str) -> Result<()> {
        self.set_setting(SETTING_FEATURE_FLAGS, flags_json)
    }

    pub fn opt_out(&self) -> Result<bool> {
        Ok(self.get_setting(SETTING_OPT_OUT)?.as_deref() == Some("1"))
    }

    pub fn set_opt_out(&self, opt_out: bool) -> Result<()> {
        self.set_setting(SETTING_OPT_OUT, if opt_out { "1" } else { "0" })
    }

    // ============================================
    // Super properties
    // ============================================

    /// Upsert one super property (value stored as encoded JSON).
    pub fn set_super_property(&self, key: &str, value_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO super_properties (key, value_json) VALUES (?1, ?2)",
            params![key, value_json],
        )?;
        Ok(())
    }

    pub fn remove_super_property(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM super_properties WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn clear_super_properties(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM super_properties", [])?;
        Ok(())
    }

    /// All super properties as key → encoded JSON value.
    pub fn super_properties(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value_json FROM super_properties")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }
}
