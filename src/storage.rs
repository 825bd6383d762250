// =============================================================================
// Storage - embedded SQLite store for snapshots, audit rows, and agent KV
// =============================================================================
//
// Single connection driven through tokio-rusqlite's background thread, which
// serialises all writes by construction. WAL journaling and a busy timeout
// keep the occasional concurrent reader (metrics export) from erroring.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;
use tracing::info;

use crate::types::{PowerState, ResourceSnapshot};

/// Bumped when the schema changes shape; recorded in `agent_state`.
const SCHEMA_VERSION: &str = "1";

/// Append-only audit row for a fired alert.
#[derive(Debug, Clone)]
pub struct AlertHistoryEntry {
    pub rule_id: String,
    pub user_uuid: String,
    pub server_id: String,
    pub condition: String,
    pub value: f64,
    pub triggered_at: DateTime<Utc>,
}

/// Append-only audit row for an executed automation.
#[derive(Debug, Clone)]
pub struct AutomationLogEntry {
    pub rule_id: String,
    pub user_uuid: String,
    pub server_id: String,
    pub action: String,
    /// "success" or "failure".
    pub result: String,
    pub error_msg: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// SQLite-backed store. Cheap to clone is not needed; share via `Arc`.
pub struct Storage {
    conn: Connection,
    /// Absent for in-memory databases.
    path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// helpers - enum <-> SQLite string, timestamps
// ---------------------------------------------------------------------------

fn power_state_to_sql(state: PowerState) -> String {
    state.to_string()
}

fn power_state_from_sql(raw: &str) -> PowerState {
    serde_json::from_str(&format!("\"{raw}\"")).unwrap_or(PowerState::Unknown)
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceSnapshot> {
    let state: String = row.get(3)?;
    Ok(ResourceSnapshot {
        id: row.get(0)?,
        server_id: row.get(1)?,
        timestamp: datetime_from_secs(row.get(2)?),
        power_state: power_state_from_sql(&state),
        cpu_percent: row.get(4)?,
        mem_bytes: row.get(5)?,
        mem_limit: row.get(6)?,
        disk_bytes: row.get(7)?,
        disk_limit: row.get(8)?,
        net_rx: row.get(9)?,
        net_tx: row.get(10)?,
        uptime_ms: row.get(11)?,
    })
}

const SNAPSHOT_COLUMNS: &str = "id, server_id, timestamp, power_state, cpu_percent, \
     mem_bytes, mem_limit, disk_bytes, disk_limit, net_rx, net_tx, uptime_ms";

impl Storage {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path.clone())
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let storage = Self {
            conn,
            path: Some(path),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Purely in-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .context("failed to open in-memory database")?;
        let storage = Self { conn, path: None };
        storage.init_schema().await?;
        Ok(storage)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS resource_snapshots (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        server_id   TEXT NOT NULL,
                        timestamp   INTEGER NOT NULL,
                        power_state TEXT NOT NULL,
                        cpu_percent REAL NOT NULL DEFAULT 0,
                        mem_bytes   INTEGER NOT NULL DEFAULT 0,
                        mem_limit   INTEGER NOT NULL DEFAULT 0,
                        disk_bytes  INTEGER NOT NULL DEFAULT 0,
                        disk_limit  INTEGER NOT NULL DEFAULT 0,
                        net_rx      INTEGER NOT NULL DEFAULT 0,
                        net_tx      INTEGER NOT NULL DEFAULT 0,
                        uptime_ms   INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_snapshots_server_time
                        ON resource_snapshots(server_id, timestamp);

                    CREATE TABLE IF NOT EXISTS automation_log (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        rule_id     TEXT NOT NULL,
                        user_uuid   TEXT NOT NULL,
                        server_id   TEXT NOT NULL,
                        action      TEXT NOT NULL,
                        result      TEXT NOT NULL,
                        error_msg   TEXT,
                        executed_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
                    );

                    CREATE TABLE IF NOT EXISTS alert_history (
                        id           INTEGER PRIMARY KEY AUTOINCREMENT,
                        rule_id      TEXT NOT NULL,
                        user_uuid    TEXT NOT NULL,
                        server_id    TEXT NOT NULL,
                        condition    TEXT NOT NULL,
                        value        REAL NOT NULL DEFAULT 0,
                        triggered_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
                    );

                    CREATE INDEX IF NOT EXISTS idx_alert_history_time
                        ON alert_history(triggered_at);

                    CREATE TABLE IF NOT EXISTS agent_state (
                        key   TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .context("failed to apply storage schema")?;

        self.set_state("schema_version", SCHEMA_VERSION).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Insert one snapshot, returning its assigned row id.
    pub async fn insert_snapshot(&self, snap: &ResourceSnapshot) -> Result<i64> {
        let snap = snap.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO resource_snapshots (server_id, timestamp, power_state,
                        cpu_percent, mem_bytes, mem_limit, disk_bytes, disk_limit,
                        net_rx, net_tx, uptime_ms)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        snap.server_id,
                        snap.timestamp.timestamp(),
                        power_state_to_sql(snap.power_state),
                        snap.cpu_percent,
                        snap.mem_bytes,
                        snap.mem_limit,
                        snap.disk_bytes,
                        snap.disk_limit,
                        snap.net_rx,
                        snap.net_tx,
                        snap.uptime_ms,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .context("failed to insert resource snapshot")
    }

    /// Most recent snapshot for `server_id`, if any.
    pub async fn latest_snapshot(&self, server_id: &str) -> Result<Option<ResourceSnapshot>> {
        let server_id = server_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM resource_snapshots
                     WHERE server_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1"
                ))?;
                let mut rows = stmt.query(params![server_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(snapshot_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .context("failed to read latest snapshot")
    }

    /// Up to `limit` most recent snapshots for `server_id`, oldest first.
    pub async fn recent_snapshots(
        &self,
        server_id: &str,
        limit: u32,
    ) -> Result<Vec<ResourceSnapshot>> {
        let server_id = server_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM resource_snapshots
                     WHERE server_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2"
                ))?;
                let mut out: Vec<ResourceSnapshot> = stmt
                    .query_map(params![server_id, limit], snapshot_from_row)?
                    .collect::<rusqlite::Result<_>>()?;
                out.reverse();
                Ok(out)
            })
            .await
            .context("failed to read recent snapshots")
    }

    /// Total number of stored snapshots.
    pub async fn snapshot_count(&self) -> Result<i64> {
        self.conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM resource_snapshots", [], |r| {
                    r.get(0)
                })?)
            })
            .await
            .context("failed to count snapshots")
    }

    // -----------------------------------------------------------------------
    // Audit rows
    // -----------------------------------------------------------------------

    pub async fn insert_alert_history(&self, entry: &AlertHistoryEntry) -> Result<()> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO alert_history
                        (rule_id, user_uuid, server_id, condition, value, triggered_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        entry.rule_id,
                        entry.user_uuid,
                        entry.server_id,
                        entry.condition,
                        entry.value,
                        entry.triggered_at.timestamp(),
                    ],
                )?;
                Ok(())
            })
            .await
            .context("failed to insert alert history row")
    }

    pub async fn insert_automation_log(&self, entry: &AutomationLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO automation_log
                        (rule_id, user_uuid, server_id, action, result, error_msg, executed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        entry.rule_id,
                        entry.user_uuid,
                        entry.server_id,
                        entry.action,
                        entry.result,
                        entry.error_msg,
                        entry.executed_at.timestamp(),
                    ],
                )?;
                Ok(())
            })
            .await
            .context("failed to insert automation log row")
    }

    pub async fn alert_history_count(&self) -> Result<i64> {
        self.conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM alert_history", [], |r| r.get(0))?)
            })
            .await
            .context("failed to count alert history")
    }

    pub async fn automation_log_count(&self) -> Result<i64> {
        self.conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM automation_log", [], |r| r.get(0))?)
            })
            .await
            .context("failed to count automation log")
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete rows older than `days` from all three time-series tables.
    ///
    /// The three DELETEs run independently; on the first failure the count
    /// deleted so far is returned together with the error message.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<(u64, Option<String>)> {
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
        self.conn
            .call(move |conn| {
                let statements = [
                    "DELETE FROM resource_snapshots WHERE timestamp < ?1",
                    "DELETE FROM alert_history WHERE triggered_at < ?1",
                    "DELETE FROM automation_log WHERE executed_at < ?1",
                ];
                let mut deleted: u64 = 0;
                for sql in statements {
                    match conn.execute(sql, params![cutoff]) {
                        Ok(n) => deleted += n as u64,
                        Err(e) => return Ok((deleted, Some(e.to_string()))),
                    }
                }
                Ok((deleted, None))
            })
            .await
            .context("cleanup failed")
    }

    // -----------------------------------------------------------------------
    // Agent KV
    // -----------------------------------------------------------------------

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM agent_state WHERE key = ?1")?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .context("failed to read agent state")
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_state (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
                Ok(())
            })
            .await
            .context("failed to write agent state")
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// On-disk size of the database file, if file-backed.
    pub fn db_size_bytes(&self) -> Option<u64> {
        let path = self.path.as_ref()?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    /// Log a one-line summary at startup.
    pub async fn log_summary(&self) -> Result<()> {
        let snapshots = self.snapshot_count().await?;
        info!(
            snapshots,
            size_bytes = self.db_size_bytes(),
            "storage opened"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.path).finish()
    }
}
