// =============================================================================
// Shared types used across the agent
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Panel-reported lifecycle state of a server.
///
/// The panel may grow new states; anything unrecognised maps to `Unknown`
/// rather than failing the whole resources fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Offline,
    #[serde(other)]
    Unknown,
}

impl PowerState {
    /// True for the states that count as "not serving": the server process
    /// is gone, whether by request or by crash.
    pub fn is_down(self) -> bool {
        matches!(self, Self::Offline | Self::Stopped)
    }
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Starting => write!(f, "starting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One resource-usage sample for one server at one point in time.
///
/// `mem_limit` and `disk_limit` are 0 when the panel's resources endpoint
/// does not report them; percent-based rule math treats a zero limit as
/// "percent not available".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Storage-assigned row id; 0 before the snapshot is persisted.
    #[serde(skip_serializing, default)]
    pub id: i64,
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub mem_bytes: i64,
    #[serde(default)]
    pub mem_limit: i64,
    #[serde(default)]
    pub disk_bytes: i64,
    #[serde(default)]
    pub disk_limit: i64,
    #[serde(default)]
    pub net_rx: i64,
    #[serde(default)]
    pub net_tx: i64,
    #[serde(default)]
    pub uptime_ms: i64,
}

impl ResourceSnapshot {
    /// Memory usage as a percentage of the limit, if a limit is known.
    pub fn mem_percent(&self) -> Option<f64> {
        if self.mem_limit > 0 {
            Some(self.mem_bytes as f64 / self.mem_limit as f64 * 100.0)
        } else {
            None
        }
    }

    /// Disk usage as a percentage of the limit, if a limit is known.
    pub fn disk_percent(&self) -> Option<f64> {
        if self.disk_limit > 0 {
            Some(self.disk_bytes as f64 / self.disk_limit as f64 * 100.0)
        } else {
            None
        }
    }
}
