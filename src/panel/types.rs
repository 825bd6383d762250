// =============================================================================
// Panel API wire types (client view)
// =============================================================================
//
// The panel wraps every object as {"object": ..., "attributes": {...}}.
// Numeric fields default to 0 so a panel version that omits a counter does
// not fail the whole fetch.
// =============================================================================

use serde::Deserialize;

use crate::types::PowerState;

/// Generic `{object, attributes}` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Wrapped<T> {
    pub attributes: T,
}

/// Live resource usage for one server, from
/// `GET /api/client/servers/{id}/resources`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceStats {
    pub current_state: PowerState,
    #[serde(default)]
    pub is_suspended: bool,
    #[serde(default)]
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub memory_bytes: i64,
    #[serde(default)]
    pub cpu_absolute: f64,
    #[serde(default)]
    pub disk_bytes: i64,
    #[serde(default)]
    pub network_rx_bytes: i64,
    #[serde(default)]
    pub network_tx_bytes: i64,
    /// Milliseconds since the server process started.
    #[serde(default)]
    pub uptime: i64,
}

/// One entry from the paginated `GET /api/client` server list.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSummary {
    pub identifier: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limits: ServerLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerLimits {
    /// Memory limit in MiB; 0 means unlimited.
    #[serde(default)]
    pub memory: i64,
    /// Disk limit in MiB; 0 means unlimited.
    #[serde(default)]
    pub disk: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerListPage {
    pub data: Vec<Wrapped<ServerSummary>>,
    #[serde(default)]
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default = "one")]
    pub total_pages: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { total_pages: 1 }
    }
}

fn one() -> u32 {
    1
}

/// Power signal accepted by `POST /api/client/servers/{id}/power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSignal {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

impl std::fmt::Display for PowerSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
