// =============================================================================
// Status and metrics export - atomic JSON files read back through the panel
// =============================================================================
//
// The agent has no inbound port; the mobile app observes it by reading two
// files out of the container volume via the panel's file API. Both files are
// replaced atomically (write to .tmp, rename over) so a reader can never see
// a partial document. Readers must still tolerate a missing file on first
// boot.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::ResourceSnapshot;

/// Hard cap on the entries carried in `AgentStatus::errors`.
pub const MAX_STATUS_ERRORS: usize = 20;
/// Default per-server snapshot cap for the metrics export (24h at 30s).
pub const DEFAULT_METRICS_LIMIT: u32 = 2880;

/// Operational summary recomputed every sampling cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStatus {
    pub agent_version: String,
    pub uptime_seconds: u64,
    /// RFC3339; fractional seconds permitted.
    pub last_sample_at: String,
    pub control_version: i64,
    pub users_count: usize,
    pub active_alerts: usize,
    pub active_automations: usize,
    pub servers_monitored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// Bounded time-series window per monitored server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExport {
    pub generated_at: DateTime<Utc>,
    /// server_id -> snapshots, chronological.
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<ResourceSnapshot>>,
}

/// Writes `status.json` and `metrics.json`, each under its own mutex.
pub struct StatusExporter {
    status_path: PathBuf,
    metrics_path: PathBuf,
    status_lock: Mutex<()>,
    metrics_lock: Mutex<()>,
}

impl StatusExporter {
    pub fn new(status_path: impl Into<PathBuf>, metrics_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            metrics_path: metrics_path.into(),
            status_lock: Mutex::new(()),
            metrics_lock: Mutex::new(()),
        }
    }

    pub fn write_status(&self, status: &AgentStatus) -> Result<()> {
        let json = serde_json::to_vec(status).context("failed to serialise agent status")?;
        let _guard = self.status_lock.lock();
        write_atomic(&self.status_path, &json)
    }

    pub fn write_metrics(&self, export: &MetricsExport) -> Result<()> {
        let json = serde_json::to_vec(export).context("failed to serialise metrics export")?;
        let _guard = self.metrics_lock.lock();
        write_atomic(&self.metrics_path, &json)
    }
}

impl std::fmt::Debug for StatusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusExporter")
            .field("status_path", &self.status_path)
            .field("metrics_path", &self.metrics_path)
            .finish()
    }
}

/// Write to a `.tmp` sibling, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
